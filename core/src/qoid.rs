/// QOID: quadruple-output intra-class distance loss.
///
/// Samples 0,1 belong to one class and samples 2,3 to the other. With
/// `D` a distance between two layer outputs:
///
///   L = D(y0,y1) + D(y2,y3) + sum over cross pairs c of 1 / (D(c) + eps)
///
/// Two metrics:
///   Norm1:     D(a,b) = mean(|a - b|)
///   Euclidean: D(a,b) = ||a - b||_2
///
/// `update_loss_qoid_*` computes the six pairwise distances once per batch
/// and returns them in a `QoidState`; every per-sample gradient call reads
/// that state. The gradient w.r.t. one output element is a weighted sum over
/// the three pairs the sample belongs to:
///
///   dL/dy_s[i] = sum_k  coef_k * orient(s, k) * term_k[i]
///
/// where `term_k` is `sign(y_a[i] - y_b[i])` (Norm1, sign(0) = 0) or
/// `y_a[i] - y_b[i]` (Euclidean), and `orient` is +1 for the first sample of
/// the pair, -1 for the second.

use serde::{Deserialize, Serialize};

use crate::tensor::Quad;

/// Additive guard on cross-pair distances.
pub const QOID_EPS: f32 = 1e-7;

/// Pair order shared by the loss state and the packed backward record.
/// The first `SAME_CLASS_PAIRS` pairs are same-class, the rest cross-class.
pub const PAIRS: [(usize, usize); 6] = [(0, 1), (2, 3), (0, 2), (0, 3), (1, 2), (1, 3)];
pub const SAME_CLASS_PAIRS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QoidMetric {
    Norm1,
    Euclidean,
}

/// Pairwise distances of one batch plus the per-pair gradient coefficients.
#[derive(Clone, Debug, PartialEq)]
pub struct QoidState {
    metric: QoidMetric,
    output_size: usize,
    dists: [f32; 6],
    coefs: [f32; 6],
}

impl QoidState {
    /// Build the state from already-reduced distances (the fused kernel
    /// accumulates them while scanning).
    pub fn from_distances(metric: QoidMetric, dists: [f32; 6], output_size: usize) -> Self {
        let n = output_size as f32;
        let mut coefs = [0.0f32; 6];
        for (k, (c, &d)) in coefs.iter_mut().zip(dists.iter()).enumerate() {
            let guarded = d + QOID_EPS;
            *c = match (metric, k < SAME_CLASS_PAIRS) {
                (QoidMetric::Norm1, true) => 1.0 / n,
                (QoidMetric::Norm1, false) => -1.0 / (n * guarded * guarded),
                // d/da ||a-b|| = (a-b)/||a-b||, taken as 0 at coincident outputs
                (QoidMetric::Euclidean, true) if d > 0.0 => 1.0 / d,
                (QoidMetric::Euclidean, false) if d > 0.0 => -1.0 / (d * guarded * guarded),
                (QoidMetric::Euclidean, _) => 0.0,
            };
        }
        QoidState { metric, output_size, dists, coefs }
    }

    pub fn metric(&self) -> QoidMetric {
        self.metric
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn distances(&self) -> &[f32; 6] {
        &self.dists
    }

    pub fn coefficients(&self) -> &[f32; 6] {
        &self.coefs
    }

    pub fn loss(&self) -> f32 {
        let same: f32 = self.dists[..SAME_CLASS_PAIRS].iter().sum();
        let cross: f32 = self.dists[SAME_CLASS_PAIRS..].iter().map(|d| 1.0 / (d + QOID_EPS)).sum();
        same + cross
    }

    /// Contribution of pair `k` to dL/dy_sample for one element with pair term `term`.
    #[inline]
    pub fn pair_contribution(&self, k: usize, sample: usize, term: f32) -> f32 {
        let (a, b) = PAIRS[k];
        if sample == a {
            self.coefs[k] * term
        } else if sample == b {
            -self.coefs[k] * term
        } else {
            0.0
        }
    }

    /// dL/dy_sample for one element, given the pair term of each of the six pairs.
    #[inline]
    pub fn element_grad(&self, sample: usize, term: impl Fn(usize) -> f32) -> f32 {
        let mut g = 0.0f32;
        for (k, &(a, b)) in PAIRS.iter().enumerate() {
            if sample == a || sample == b {
                g += self.pair_contribution(k, sample, term(k));
            }
        }
        g
    }
}

/// Subgradient of |d|: the sign, with 0 at 0.
#[inline]
pub fn norm1_sign(diff: f32) -> f32 {
    if diff > 0.0 {
        1.0
    } else if diff < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn check_quad(y: &Quad<&[f32]>) -> usize {
    let n = y[0].len();
    debug_assert!(y.iter().all(|v| v.len() == n), "QOID outputs must share one length");
    n
}

/// Norm1 distances of the batch. Call once per batch, before any `dldy_*`.
pub fn update_loss_qoid_norm1(y: Quad<&[f32]>) -> QoidState {
    let n = check_quad(&y);
    let mut dists = [0.0f32; 6];
    for (d, &(a, b)) in dists.iter_mut().zip(PAIRS.iter()) {
        let s: f32 = y[a].iter().zip(y[b].iter()).map(|(p, q)| (p - q).abs()).sum();
        *d = s / n as f32;
    }
    QoidState::from_distances(QoidMetric::Norm1, dists, n)
}

/// Euclidean distances of the batch. Call once per batch, before any `dldy_*`.
pub fn update_loss_qoid_euclidean(y: Quad<&[f32]>) -> QoidState {
    let n = check_quad(&y);
    let mut dists = [0.0f32; 6];
    for (d, &(a, b)) in dists.iter_mut().zip(PAIRS.iter()) {
        let s: f32 = y[a].iter().zip(y[b].iter()).map(|(p, q)| (p - q) * (p - q)).sum();
        *d = s.sqrt();
    }
    QoidState::from_distances(QoidMetric::Euclidean, dists, n)
}

pub fn update_loss_qoid(metric: QoidMetric, y: Quad<&[f32]>) -> QoidState {
    match metric {
        QoidMetric::Norm1 => update_loss_qoid_norm1(y),
        QoidMetric::Euclidean => update_loss_qoid_euclidean(y),
    }
}

/// dL/dy for `sample` under the Norm1 metric. `out` is overwritten.
pub fn dldy_qoid_norm1(state: &QoidState, y: Quad<&[f32]>, sample: usize, out: &mut [f32]) {
    debug_assert_eq!(state.metric, QoidMetric::Norm1);
    debug_assert_eq!(out.len(), state.output_size);
    for (i, o) in out.iter_mut().enumerate() {
        *o = state.element_grad(sample, |k| {
            let (a, b) = PAIRS[k];
            norm1_sign(y[a][i] - y[b][i])
        });
    }
}

/// dL/dy for `sample` under the Euclidean metric. `out` is overwritten.
pub fn dldy_qoid_euclidean(state: &QoidState, y: Quad<&[f32]>, sample: usize, out: &mut [f32]) {
    debug_assert_eq!(state.metric, QoidMetric::Euclidean);
    debug_assert_eq!(out.len(), state.output_size);
    for (i, o) in out.iter_mut().enumerate() {
        *o = state.element_grad(sample, |k| {
            let (a, b) = PAIRS[k];
            y[a][i] - y[b][i]
        });
    }
}

pub fn dldy_qoid(state: &QoidState, y: Quad<&[f32]>, sample: usize, out: &mut [f32]) {
    match state.metric {
        QoidMetric::Norm1 => dldy_qoid_norm1(state, y, sample, out),
        QoidMetric::Euclidean => dldy_qoid_euclidean(state, y, sample, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> [Vec<f32>; 4] {
        [
            vec![0.10, 0.90, 0.35],
            vec![0.22, 0.71, 0.30],
            vec![1.40, -0.20, 0.05],
            vec![1.10, -0.45, 0.60],
        ]
    }

    fn refs(q: &[Vec<f32>; 4]) -> Quad<&[f32]> {
        [&q[0], &q[1], &q[2], &q[3]]
    }

    fn loss_of(metric: QoidMetric, q: &[Vec<f32>; 4]) -> f32 {
        update_loss_qoid(metric, refs(q)).loss()
    }

    #[test]
    fn test_norm1_distances() {
        let q = quad();
        let st = update_loss_qoid_norm1(refs(&q));
        let d01 = (0.12 + 0.19 + 0.05) / 3.0;
        assert!((st.distances()[0] - d01).abs() < 1e-6);
        let loss: f32 = st.distances()[0]
            + st.distances()[1]
            + st.distances()[2..].iter().map(|d| 1.0 / (d + QOID_EPS)).sum::<f32>();
        assert!((st.loss() - loss).abs() < 1e-6);
    }

    #[test]
    fn test_gradients_match_finite_difference() {
        // All pairwise element differences are nonzero, so Norm1 is differentiable here.
        for metric in [QoidMetric::Norm1, QoidMetric::Euclidean] {
            let q = quad();
            let st = update_loss_qoid(metric, refs(&q));
            let h = 1e-3f32;
            let mut g = vec![0.0; 3];
            for s in 0..4 {
                dldy_qoid(&st, refs(&q), s, &mut g);
                for i in 0..3 {
                    let mut qp = q.clone();
                    qp[s][i] += h;
                    let mut qm = q.clone();
                    qm[s][i] -= h;
                    let fd = (loss_of(metric, &qp) - loss_of(metric, &qm)) / (2.0 * h);
                    let tol = 1e-2 * fd.abs().max(1.0);
                    assert!((fd - g[i]).abs() < tol, "{metric:?} y{s}[{i}]: fd={fd}, analytic={}", g[i]);
                }
            }
        }
    }

    #[test]
    fn test_norm1_equal_elements_contribute_zero() {
        let q = [vec![1.0], vec![1.0], vec![1.0], vec![1.0]];
        let st = update_loss_qoid_norm1(refs(&q));
        let mut g = [7.0];
        dldy_qoid_norm1(&st, refs(&q), 0, &mut g);
        assert_eq!(g[0], 0.0);
        assert!(st.loss().is_finite(), "eps must guard coincident embeddings");
    }

    #[test]
    fn test_euclidean_coincident_pair_has_zero_coefficient() {
        let q = [vec![0.5, 0.5], vec![0.5, 0.5], vec![1.0, 0.0], vec![0.0, 1.0]];
        let st = update_loss_qoid_euclidean(refs(&q));
        assert_eq!(st.coefficients()[0], 0.0);
        let mut g = [0.0; 2];
        dldy_qoid_euclidean(&st, refs(&q), 0, &mut g);
        assert!(g.iter().all(|v| v.is_finite()));
    }
}
