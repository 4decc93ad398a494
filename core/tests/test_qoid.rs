/// QOID loss: distance symmetry, same-class antisymmetry, epsilon guard.

use biobpfree_core::qoid::{
    dldy_qoid, norm1_sign, update_loss_qoid, QoidMetric, QOID_EPS, PAIRS,
};
use biobpfree_core::tensor::SimpleRng;

fn quad(seed: u64, n: usize) -> [Vec<f32>; 4] {
    let mut rng = SimpleRng::new(seed);
    [rng.vec_uniform(n, 1.0), rng.vec_uniform(n, 1.0), rng.vec_uniform(n, 1.0), rng.vec_uniform(n, 1.0)]
}

#[test]
fn test_distance_is_symmetric() {
    let q = quad(3, 12);
    for metric in [QoidMetric::Norm1, QoidMetric::Euclidean] {
        let ab = update_loss_qoid(metric, [&q[0], &q[1], &q[2], &q[3]]);
        // swap within each class: every pair is the same pair read backwards
        let ba = update_loss_qoid(metric, [&q[1], &q[0], &q[3], &q[2]]);
        assert_eq!(ab.distances()[0], ba.distances()[0], "{metric:?} d(y0,y1) != d(y1,y0)");
        assert_eq!(ab.distances()[1], ba.distances()[1], "{metric:?} d(y2,y3) != d(y3,y2)");
        assert!((ab.loss() - ba.loss()).abs() < 1e-4 * ab.loss().abs());
    }
}

#[test]
fn test_same_class_term_is_antisymmetric() {
    let q = quad(5, 10);
    let y = [&q[0][..], &q[1][..], &q[2][..], &q[3][..]];
    let st = update_loss_qoid(QoidMetric::Norm1, y);
    assert_eq!(PAIRS[0], (0, 1));
    for i in 0..10 {
        let term = norm1_sign(y[0][i] - y[1][i]);
        let g0 = st.pair_contribution(0, 0, term);
        let g1 = st.pair_contribution(0, 1, term);
        assert_eq!(g0, -g1, "element {i}");
        assert_eq!(g0.abs(), 1.0 / 10.0);
    }
}

#[test]
fn test_gradients_sum_to_zero_across_samples() {
    // Every pair term enters once with + and once with -.
    let q = quad(8, 6);
    let y = [&q[0][..], &q[1][..], &q[2][..], &q[3][..]];
    for metric in [QoidMetric::Norm1, QoidMetric::Euclidean] {
        let st = update_loss_qoid(metric, y);
        let mut total = vec![0.0f32; 6];
        let mut g = vec![0.0f32; 6];
        let mut scale = 0.0f32;
        for s in 0..4 {
            dldy_qoid(&st, y, s, &mut g);
            for (t, v) in total.iter_mut().zip(g.iter()) {
                *t += v;
                scale = scale.max(v.abs());
            }
        }
        for (i, t) in total.iter().enumerate() {
            assert!(t.abs() <= 1e-5 * scale.max(1.0), "{metric:?} element {i}: {t}");
        }
    }
}

#[test]
fn test_coincident_embeddings_stay_finite() {
    let v = vec![0.25f32; 4];
    let st = update_loss_qoid(QoidMetric::Norm1, [&v, &v, &v, &v]);
    assert!(st.distances().iter().all(|&d| d == 0.0));
    let expected = 4.0 / QOID_EPS;
    assert!((st.loss() - expected).abs() <= 1e-3 * expected, "loss={}", st.loss());

    let mut g = vec![f32::NAN; 4];
    dldy_qoid(&st, [&v, &v, &v, &v], 2, &mut g);
    assert!(g.iter().all(|&x| x == 0.0));
}

#[test]
fn test_cross_class_separation_lowers_loss() {
    let a = vec![0.0f32; 4];
    let near = vec![0.1f32; 4];
    let far = vec![1.0f32; 4];
    let close = update_loss_qoid(QoidMetric::Norm1, [&a, &a, &near, &near]).loss();
    let apart = update_loss_qoid(QoidMetric::Norm1, [&a, &a, &far, &far]).loss();
    assert!(apart < close, "apart={apart}, close={close}");
}
