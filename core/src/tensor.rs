/// Flat f32 buffer utilities shared by every layer kernel.
///
/// All kernels are free functions on flat slices with explicit dimensions,
/// channels-first (`[depth][len]`) and row-major throughout.

use crate::error::EngineError;

/// Number of samples trained together: two per class.
pub const QUAD: usize = 4;

/// One value per sample of the quadruple.
pub type Quad<T> = [T; QUAD];

/// Allocate a zeroed buffer, failing with `EngineError::Allocation` instead of
/// aborting when the reservation cannot be satisfied.
pub fn try_zeros(what: &'static str, n: usize) -> Result<Vec<f32>, EngineError> {
    let mut buf: Vec<f32> = Vec::new();
    buf.try_reserve_exact(n)
        .map_err(|_| EngineError::Allocation { what, elements: n })?;
    buf.resize(n, 0.0);
    Ok(buf)
}

/// Fallible zeroed buffer of any `Copy` element (arg-max maps, packed records).
pub fn try_filled<T: Copy>(what: &'static str, n: usize, value: T) -> Result<Vec<T>, EngineError> {
    let mut buf: Vec<T> = Vec::new();
    buf.try_reserve_exact(n)
        .map_err(|_| EngineError::Allocation { what, elements: n })?;
    buf.resize(n, value);
    Ok(buf)
}

/// Four zeroed buffers of the same length, one per sample.
pub fn try_zeros_quad(what: &'static str, n: usize) -> Result<Quad<Vec<f32>>, EngineError> {
    Ok([
        try_zeros(what, n)?,
        try_zeros(what, n)?,
        try_zeros(what, n)?,
        try_zeros(what, n)?,
    ])
}

/// Dot product of two equal-length slices.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Set every element to zero without reallocating.
#[inline]
pub fn zero(buf: &mut [f32]) {
    buf.iter_mut().for_each(|v| *v = 0.0);
}

/// Deterministic xorshift RNG for reproducible initialization in tests and benches.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }

    /// Vector of `n` values uniform in [-scale, scale].
    pub fn vec_uniform(&mut self, n: usize, scale: f32) -> Vec<f32> {
        let mut v = vec![0.0f32; n];
        self.fill_uniform(&mut v, scale);
        v
    }
}
