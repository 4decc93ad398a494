/// ReLU and non-overlapping 1D max-pooling.
///
/// Max-pool scans each window left to right with a strict `>` comparison, so
/// on ties the first maximal index wins and receives the whole gradient.
/// Windows that do not fit completely at the end of a channel are dropped.

/// In-place ReLU.
#[inline]
pub fn relu(x: &mut [f32]) {
    for v in x.iter_mut() {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}

/// ReLU derivative from the pre-activation value; 0 at exactly 0.
#[inline]
pub fn relu_grad(pre: f32) -> f32 {
    if pre > 0.0 { 1.0 } else { 0.0 }
}

/// First arg-max of a window and its value.
#[inline]
pub fn window_argmax(window: &[f32]) -> (usize, f32) {
    let mut best = window[0];
    let mut best_idx = 0;
    for (k, &v) in window.iter().enumerate().skip(1) {
        if v > best {
            best = v;
            best_idx = k;
        }
    }
    (best_idx, best)
}

/// Max-pool a `[channels, len]` map into `out` `[channels, len / pool]`,
/// recording the in-window arg-max of every output in `argmax`.
pub fn max_pool1d(
    x: &[f32],
    channels: usize,
    len: usize,
    pool: usize,
    out: &mut [f32],
    argmax: &mut [usize],
) {
    let pooled = len / pool;
    debug_assert_eq!(x.len(), channels * len);
    debug_assert_eq!(out.len(), channels * pooled);
    debug_assert_eq!(argmax.len(), channels * pooled);

    for c in 0..channels {
        for q in 0..pooled {
            let start = c * len + q * pool;
            let (k, v) = window_argmax(&x[start..start + pool]);
            out[c * pooled + q] = v;
            argmax[c * pooled + q] = k;
        }
    }
}

/// Route pooled gradients back to the selected positions of a `[channels, len]` map.
/// `dldx` is overwritten; unselected positions (and the dropped tail) get 0.
pub fn max_pool1d_backward(
    dldy: &[f32],
    argmax: &[usize],
    channels: usize,
    len: usize,
    pool: usize,
    dldx: &mut [f32],
) {
    let pooled = len / pool;
    debug_assert_eq!(dldy.len(), channels * pooled);
    debug_assert_eq!(dldx.len(), channels * len);

    dldx.iter_mut().for_each(|v| *v = 0.0);
    for c in 0..channels {
        for q in 0..pooled {
            let i = c * pooled + q;
            dldx[c * len + q * pool + argmax[i]] += dldy[i];
        }
    }
}
