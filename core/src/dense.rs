/// Fully-connected layer, softmax and categorical cross-entropy.
///
/// Weights are `[out, in]` row-major; `y = W x + b`.
///
/// `softmax` exponentiates the raw logits without subtracting the maximum.
/// This keeps outputs bit-compatible with checkpoints trained by the
/// embedded engine; large logits overflow to inf/NaN.

use crate::tensor::dot;

/// Floor applied to the target probability before taking its log.
pub const CE_MIN_PROB: f32 = 1e-12;

/// `y[o] = sum_i w[o, i] * x[i] + b[o]`. `y` is overwritten.
pub fn fully_connected(x: &[f32], w: &[f32], b: &[f32], in_size: usize, out_size: usize, y: &mut [f32]) {
    debug_assert_eq!(x.len(), in_size);
    debug_assert_eq!(w.len(), out_size * in_size);
    debug_assert_eq!(b.len(), out_size);
    debug_assert_eq!(y.len(), out_size);

    for o in 0..out_size {
        y[o] = dot(&w[o * in_size..(o + 1) * in_size], x) + b[o];
    }
}

/// Plain softmax of `z` into `p`.
pub fn softmax(z: &[f32], p: &mut [f32]) {
    debug_assert_eq!(z.len(), p.len());
    let mut sum = 0.0f32;
    for (o, &v) in p.iter_mut().zip(z.iter()) {
        *o = v.exp();
        sum += *o;
    }
    for o in p.iter_mut() {
        *o /= sum;
    }
}

/// `-ln p[label]`, with `p[label]` floored at `CE_MIN_PROB`.
pub fn categorical_cross_entropy(p: &[f32], label: usize) -> f32 {
    -p[label].max(CE_MIN_PROB).ln()
}

/// dL/dz of softmax followed by cross-entropy: `p - onehot(label)`.
/// `dldz` is overwritten.
pub fn dldz_softmax_cross_entropy(p: &[f32], label: usize, dldz: &mut [f32]) {
    debug_assert_eq!(p.len(), dldz.len());
    for (o, (d, &pv)) in dldz.iter_mut().zip(p.iter()).enumerate() {
        *d = if o == label { pv - 1.0 } else { pv };
    }
}

/// Accumulate dL/dW and dL/db for one sample given dL/dy at the layer output
/// (pre-activation). `gw[o, i] += g[o] * x[i]`, `gb[o] += g[o]`.
pub fn accumulate_dense_grads(x: &[f32], g: &[f32], gw: &mut [f32], gb: &mut [f32]) {
    let in_size = x.len();
    debug_assert_eq!(gw.len(), g.len() * in_size);
    debug_assert_eq!(gb.len(), g.len());

    for (o, &go) in g.iter().enumerate() {
        if go == 0.0 {
            continue;
        }
        gb[o] += go;
        for (w, &xi) in gw[o * in_size..(o + 1) * in_size].iter_mut().zip(x.iter()) {
            *w += go * xi;
        }
    }
}
