/// Per-sample z-score normalization of the raw input.
///
///   y_j = (x_j - mean) / s,   s = sqrt(var + eps),   var = mean((x - mean)^2)
///
/// Applied before layer 1 when `InputParams::normalize` is set. It carries no
/// trainable parameters; its Jacobian is still exposed column-by-column:
///
///   dy_j/dx_i = (delta_ij - 1/n) / s - (x_j - mean)(x_i - mean) / (n s^3)

pub const NORMALIZATION_EPS: f32 = 1e-5;

fn mean_and_scale(x: &[f32]) -> (f32, f32) {
    let n = x.len() as f32;
    let mean = x.iter().sum::<f32>() / n;
    let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, (var + NORMALIZATION_EPS).sqrt())
}

/// Normalize `x` into `y` (same length, overwritten).
pub fn normalize(x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len());
    if x.is_empty() {
        return;
    }
    let (mean, s) = mean_and_scale(x);
    for (o, &v) in y.iter_mut().zip(x.iter()) {
        *o = (v - mean) / s;
    }
}

/// Column `i` of dy/dx: the sensitivity of every output to input `i`.
pub fn dydx_column_normalization(x: &[f32], i: usize, col: &mut [f32]) {
    debug_assert_eq!(x.len(), col.len());
    debug_assert!(i < x.len());
    let n = x.len() as f32;
    let (mean, s) = mean_and_scale(x);
    let ci = x[i] - mean;
    for (j, c) in col.iter_mut().enumerate() {
        let delta = if i == j { 1.0 } else { 0.0 };
        *c = (delta - 1.0 / n) / s - (x[j] - mean) * ci / (n * s * s * s);
    }
}
