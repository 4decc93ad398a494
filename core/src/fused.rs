/// Fused conv-block kernel: Conv1D -> frozen BN -> ReLU -> MaxPool1D for the
/// four samples of a quadruple in lockstep, keeping 32 bits per pooled output
/// instead of the per-sample pre-activation and post-ReLU maps.
///
/// Record for pooled output (f, q):
///   bits 0..16  arg-max nibble of each sample, sample s at bits 4s..4s+4;
///               the value `pool_size` marks a window whose maximum is not
///               positive (ReLU closed, no gradient flows)
///   equal       bit k set when both samples of PAIRS[k] pooled to the same value
///   greater     bit k set when the first sample of PAIRS[k] pooled higher
///
/// The flags give the Norm1 sign of every pair at that output, which is all
/// the QOID gradient needs. Gradients are accumulated before the frozen-BN
/// slope is applied; the slope is one scalar per filter, so it is folded in
/// once per filter by `rescale_by_bn` or inside `adam_step_optimized`.

use crate::adam::AdamState;
use crate::backward::LayerGrads;
use crate::batch_norm::dydx_bn_frozen;
use crate::conv1d::conv1d_at;
use crate::error::{ConfigError, EngineError};
use crate::model::ConvBlock;
use crate::qoid::{QoidMetric, QoidState, PAIRS};
use crate::tensor::{try_filled, try_zeros_quad, Quad, QUAD};

/// Largest pool size whose indices plus the sentinel fit in a nibble.
pub const MAX_PACKED_POOL: usize = 15;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackedBackwardRecord {
    pub argmax: u16,
    pub equal: u8,
    pub greater: u8,
}

pub fn pack_nibbles_to_u16(nibbles: [u8; QUAD]) -> u16 {
    nibbles
        .iter()
        .enumerate()
        .fold(0u16, |acc, (s, &n)| acc | (((n & 0x0f) as u16) << (4 * s)))
}

pub fn unpack_u16_to_nibbles(packed: u16) -> [u8; QUAD] {
    let mut out = [0u8; QUAD];
    for (s, n) in out.iter_mut().enumerate() {
        *n = ((packed >> (4 * s)) & 0x0f) as u8;
    }
    out
}

impl PackedBackwardRecord {
    /// Build the record of one pooled output from each sample's arg-max nibble
    /// and pooled maximum.
    pub fn pack(nibbles: [u8; QUAD], maxima: Quad<f32>) -> Self {
        let mut equal = 0u8;
        let mut greater = 0u8;
        for (k, &(a, b)) in PAIRS.iter().enumerate() {
            if maxima[a] == maxima[b] {
                equal |= 1 << k;
            } else if maxima[a] > maxima[b] {
                greater |= 1 << k;
            }
        }
        PackedBackwardRecord { argmax: pack_nibbles_to_u16(nibbles), equal, greater }
    }

    #[inline]
    pub fn nibble(&self, sample: usize) -> usize {
        ((self.argmax >> (4 * sample)) & 0x0f) as usize
    }

    #[inline]
    pub fn equal_bit(&self, k: usize) -> bool {
        self.equal & (1 << k) != 0
    }

    #[inline]
    pub fn greater_bit(&self, k: usize) -> bool {
        self.greater & (1 << k) != 0
    }

    /// sign(y_a - y_b) for pair k.
    #[inline]
    pub fn sign(&self, k: usize) -> f32 {
        if self.equal_bit(k) {
            0.0
        } else if self.greater_bit(k) {
            1.0
        } else {
            -1.0
        }
    }

    /// Little-endian wire form: argmax (2 bytes), equal, greater.
    pub fn to_bytes(self) -> [u8; 4] {
        let [lo, hi] = self.argmax.to_le_bytes();
        [lo, hi, self.equal, self.greater]
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        PackedBackwardRecord {
            argmax: u16::from_le_bytes([bytes[0], bytes[1]]),
            equal: bytes[2],
            greater: bytes[3],
        }
    }
}

fn check_packable(block: &ConvBlock) -> Result<(), ConfigError> {
    if block.geometry.pool_size > MAX_PACKED_POOL {
        return Err(ConfigError::PoolTooLarge { pool_size: block.geometry.pool_size, max: MAX_PACKED_POOL });
    }
    Ok(())
}

fn check_inputs(block: &ConvBlock, inputs: &Quad<&[f32]>) -> Result<(), ConfigError> {
    let expected = block.geometry.input_size();
    match inputs.iter().find(|x| x.len() != expected) {
        Some(x) => Err(ConfigError::LengthMismatch { what: "fused conv input", expected, found: x.len() }),
        None => Ok(()),
    }
}

/// Post-ReLU maximum of window `q` of filter `f` and its first in-window arg-max.
#[inline]
fn pooled_window(block: &ConvBlock, x: &[f32], f: usize, q: usize) -> (usize, f32) {
    let g = &block.geometry;
    let start = q * g.pool_size;
    let mut best_idx = 0;
    let mut best = f32::NEG_INFINITY;
    for k in 0..g.pool_size {
        let z = block.bn.apply(f, conv1d_at(x, &block.filters, &block.bias, g, f, start + k));
        let v = if z > 0.0 { z } else { 0.0 };
        if v > best {
            best = v;
            best_idx = k;
        }
    }
    (best_idx, best)
}

/// Forward all four samples through the block, pack one record per pooled
/// output and accumulate the Norm1 QOID distances of the pooled outputs.
///
/// Records are laid out `[no_filters, pooled_len]`, matching the pooled map.
pub fn forward_dldy_conv1d_bn_relu_maxpool_4(
    block: &ConvBlock,
    inputs: Quad<&[f32]>,
) -> Result<(Vec<PackedBackwardRecord>, QoidState), EngineError> {
    check_packable(block)?;
    check_inputs(block, &inputs)?;
    let g = &block.geometry;
    let pooled_len = g.pooled_len();
    let sentinel = g.pool_size as u8;

    let mut records = try_filled("packed backward records", g.output_size(), PackedBackwardRecord::default())?;
    let mut sums = [0.0f32; 6];
    for f in 0..g.no_filters {
        for q in 0..pooled_len {
            let mut nibbles = [0u8; QUAD];
            let mut maxima = [0.0f32; QUAD];
            for s in 0..QUAD {
                let (k, m) = pooled_window(block, inputs[s], f, q);
                nibbles[s] = if m > 0.0 { k as u8 } else { sentinel };
                maxima[s] = m;
            }
            for (sum, &(a, b)) in sums.iter_mut().zip(PAIRS.iter()) {
                *sum += (maxima[a] - maxima[b]).abs();
            }
            records[f * pooled_len + q] = PackedBackwardRecord::pack(nibbles, maxima);
        }
    }

    let n = g.output_size();
    let dists = sums.map(|s| s / n as f32);
    Ok((records, QoidState::from_distances(QoidMetric::Norm1, dists, n)))
}

/// Accumulate the pre-BN-scale gradients of `sample` from its packed records.
/// `x` is that sample's block input.
pub fn backward_optimized_conv1d_bn_relu_maxpool(
    block: &ConvBlock,
    x: &[f32],
    sample: usize,
    records: &[PackedBackwardRecord],
    state: &QoidState,
    grads: &mut LayerGrads,
) {
    let g = &block.geometry;
    let pooled_len = g.pooled_len();
    let per_filter = g.in_depth * g.filter_len;
    debug_assert_eq!(state.metric(), QoidMetric::Norm1);
    debug_assert_eq!(records.len(), g.output_size());

    for (i, rec) in records.iter().enumerate() {
        let k = rec.nibble(sample);
        if k == g.pool_size {
            continue;
        }
        let dldy = state.element_grad(sample, |pair| rec.sign(pair));
        if dldy == 0.0 {
            continue;
        }
        let (f, q) = (i / pooled_len, i % pooled_len);
        let p = q * g.pool_size + k;
        let gw = &mut grads.w[f * per_filter..(f + 1) * per_filter];
        for d in 0..g.in_depth {
            for t in 0..g.filter_len {
                if let Some(xi) = g.input_index(d, p, t) {
                    gw[d * g.filter_len + t] += dldy * x[xi];
                }
            }
        }
        grads.b[g.bias_index(f, p)] += dldy;
    }
}

/// Fold the frozen-BN slope of each filter into its weight and bias gradients.
pub fn rescale_by_bn(block: &ConvBlock, grads: &mut LayerGrads) {
    let g = &block.geometry;
    for f in 0..g.no_filters {
        let scale = dydx_bn_frozen(&block.bn, f);
        grads.w[g.filter_range(f)].iter_mut().for_each(|v| *v *= scale);
        grads.b[g.bias_range(f)].iter_mut().for_each(|v| *v *= scale);
    }
}

/// Adam step on a block from pre-BN-scale gradients, applying the BN slope
/// per filter on the way in. `grads` is left unscaled.
pub fn adam_step_optimized(block: &mut ConvBlock, grads: &LayerGrads, adam_w: &mut AdamState, adam_b: &mut AdamState) {
    let g = block.geometry;
    for f in 0..g.no_filters {
        let scale = dydx_bn_frozen(&block.bn, f);
        for i in g.filter_range(f) {
            adam_w.update(i, &mut block.filters[i], grads.w[i] * scale);
        }
        for i in g.bias_range(f) {
            adam_b.update(i, &mut block.bias[i], grads.b[i] * scale);
        }
    }
    adam_w.advance();
    adam_b.advance();
}

/// Plain pooled outputs of the four samples, for the next layer's input.
pub fn forward_output_conv1d_bn_relu_maxpool_4(
    block: &ConvBlock,
    inputs: Quad<&[f32]>,
) -> Result<Quad<Vec<f32>>, EngineError> {
    check_inputs(block, &inputs)?;
    let g = &block.geometry;
    let pooled_len = g.pooled_len();
    let mut out = try_zeros_quad("fused pooled output", g.output_size())?;
    for f in 0..g.no_filters {
        for q in 0..pooled_len {
            for (s, y) in out.iter_mut().enumerate() {
                y[f * pooled_len + q] = pooled_window(block, inputs[s], f, q).1;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::conv_block_forward;
    use crate::model::NetworkParameters;
    use crate::tensor::SimpleRng;

    #[test]
    fn test_nibble_packing() {
        let packed = pack_nibbles_to_u16([1, 0, 15, 7]);
        assert_eq!(packed, 0x7f01);
        assert_eq!(unpack_u16_to_nibbles(packed), [1, 0, 15, 7]);
    }

    #[test]
    fn test_record_flags() {
        let rec = PackedBackwardRecord::pack([0, 1, 2, 2], [0.5, 0.5, 0.2, 0.9]);
        // (0,1) equal, (2,3) less, (0,2) greater, (0,3) less, (1,2) greater, (1,3) less
        assert_eq!(rec.equal, 0b000001);
        assert_eq!(rec.greater, 0b010100);
        assert_eq!(rec.sign(0), 0.0);
        assert_eq!(rec.sign(1), -1.0);
        assert_eq!(rec.sign(2), 1.0);
        assert_eq!(rec.nibble(3), 2);
        assert_eq!(PackedBackwardRecord::from_bytes(rec.to_bytes()), rec);
    }

    #[test]
    fn test_fused_pooled_output_matches_dense_forward() {
        let net = NetworkParameters::test_network(17).unwrap();
        let block = net.conv_block(1).unwrap();
        let mut rng = SimpleRng::new(2);
        let xs: Vec<Vec<f32>> = (0..4).map(|_| rng.vec_uniform(32, 1.0)).collect();
        let inputs = [&xs[0][..], &xs[1][..], &xs[2][..], &xs[3][..]];
        let fused = forward_output_conv1d_bn_relu_maxpool_4(block, inputs).unwrap();
        for s in 0..4 {
            let dense = conv_block_forward(block, inputs[s]).unwrap();
            assert_eq!(fused[s], dense.pooled);
        }
    }

    #[test]
    fn test_sentinel_marks_closed_windows() {
        let mut net = NetworkParameters::test_network(17).unwrap();
        let block = net.conv_block_mut(1).unwrap();
        // Large negative shift closes every ReLU.
        block.bn.beta.iter_mut().for_each(|b| *b = -100.0);
        let x = vec![0.1f32; 32];
        let inputs = [&x[..], &x[..], &x[..], &x[..]];
        let (records, state) = forward_dldy_conv1d_bn_relu_maxpool_4(block, inputs).unwrap();
        assert!(records.iter().all(|r| (0..4).all(|s| r.nibble(s) == 2)));
        assert!(state.distances().iter().all(|&d| d == 0.0));

        let mut grads = LayerGrads::new(block.geometry.filters_len(), block.geometry.bias_len()).unwrap();
        backward_optimized_conv1d_bn_relu_maxpool(block, &x, 0, &records, &state, &mut grads);
        assert!(grads.w.iter().chain(grads.b.iter()).all(|&v| v == 0.0));
    }

    #[test]
    fn test_pool_too_large_rejected() {
        let mut net = NetworkParameters::test_network(1).unwrap();
        let block = net.conv_block_mut(1).unwrap();
        block.geometry.pool_size = 16;
        let x = vec![0.0f32; 32];
        let err = forward_dldy_conv1d_bn_relu_maxpool_4(block, [&x[..], &x[..], &x[..], &x[..]]).unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::PoolTooLarge { pool_size: 16, max: 15 })));
    }
}
