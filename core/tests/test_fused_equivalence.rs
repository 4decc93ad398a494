/// Fused packed-record conv kernel vs the dense conv engine.
///
/// Both paths see bit-identical pooled outputs, so the losses match exactly
/// and the gradients differ only by summation order.

use biobpfree_core::adam::{AdamConfig, AdamState};
use biobpfree_core::backward::LayerGrads;
use biobpfree_core::forward::{conv_block_forward, conv_block_qoid_loss};
use biobpfree_core::fused::{
    adam_step_optimized, backward_optimized_conv1d_bn_relu_maxpool, forward_dldy_conv1d_bn_relu_maxpool_4,
    forward_output_conv1d_bn_relu_maxpool_4, rescale_by_bn,
};
use biobpfree_core::gradient::conv_block_gradients;
use biobpfree_core::model::{ConvBlock, NetworkParameters};
use biobpfree_core::qoid::QoidMetric;
use biobpfree_core::tensor::{Quad, SimpleRng};

fn refs(q: &Quad<Vec<f32>>) -> Quad<&[f32]> {
    [&q[0], &q[1], &q[2], &q[3]]
}

/// Record-driven gradients before the BN slope is applied.
fn raw_fused_gradients(block: &ConvBlock, inputs: Quad<&[f32]>) -> LayerGrads {
    let g = &block.geometry;
    let (records, state) = forward_dldy_conv1d_bn_relu_maxpool_4(block, inputs).unwrap();
    let mut grads = LayerGrads::new(g.filters_len(), g.bias_len()).unwrap();
    for s in 0..4 {
        backward_optimized_conv1d_bn_relu_maxpool(block, inputs[s], s, &records, &state, &mut grads);
    }
    grads
}

fn fused_gradients(block: &ConvBlock, inputs: Quad<&[f32]>) -> (LayerGrads, f32) {
    let g = &block.geometry;
    let (records, state) = forward_dldy_conv1d_bn_relu_maxpool_4(block, inputs).unwrap();
    let mut grads = LayerGrads::new(g.filters_len(), g.bias_len()).unwrap();
    for s in 0..4 {
        backward_optimized_conv1d_bn_relu_maxpool(block, inputs[s], s, &records, &state, &mut grads);
    }
    rescale_by_bn(block, &mut grads);
    (grads, state.loss())
}

fn assert_close(name: &str, dense: &[f32], fused: &[f32]) {
    assert_eq!(dense.len(), fused.len());
    let scale = dense.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    let tol = 1e-5 * scale + 1e-7;
    for (i, (a, b)) in dense.iter().zip(fused.iter()).enumerate() {
        assert!((a - b).abs() <= tol, "{name}[{i}]: dense={a}, fused={b}, tol={tol}");
    }
}

/// Feed the quadruple through every conv block, comparing each one.
fn check_network(net_seed: u64, input_seed: u64) {
    let net = NetworkParameters::test_network(net_seed).unwrap();
    let mut rng = SimpleRng::new(input_seed);
    let n = net.layer_output_size(0).unwrap();
    let mut x: Quad<Vec<f32>> = [rng.vec_uniform(n, 1.0), rng.vec_uniform(n, 1.0), rng.vec_uniform(n, 1.0), rng.vec_uniform(n, 1.0)];

    for layer in 1..=3 {
        let block = net.conv_block(layer).unwrap();
        let dense = conv_block_gradients(block, QoidMetric::Norm1, refs(&x)).unwrap();
        let dense_loss = conv_block_qoid_loss(block, QoidMetric::Norm1, refs(&x)).unwrap();
        let (fused, fused_loss) = fused_gradients(block, refs(&x));

        assert_eq!(dense_loss, fused_loss, "layer {layer} loss");
        assert_close(&format!("w{layer}"), &dense.w, &fused.w);
        assert_close(&format!("b{layer}"), &dense.b, &fused.b);

        let next = forward_output_conv1d_bn_relu_maxpool_4(block, refs(&x)).unwrap();
        for s in 0..4 {
            let cache = conv_block_forward(block, &x[s]).unwrap();
            assert_eq!(next[s], cache.pooled, "layer {layer} sample {s} pooled output");
        }
        x = next;
    }
}

#[test]
fn test_fused_matches_dense_seed_42() {
    check_network(42, 1);
}

#[test]
fn test_fused_matches_dense_other_seeds() {
    for (net_seed, input_seed) in [(7, 2), (1, 3), (3, 4)] {
        check_network(net_seed, input_seed);
    }
}

#[test]
fn test_fused_all_windows_dead_gives_zero_gradient() {
    let mut net = NetworkParameters::test_network(42).unwrap();
    let block = net.conv_block_mut(1).unwrap();
    block.bn.beta.iter_mut().for_each(|b| *b = -100.0);
    let block = net.conv_block(1).unwrap();

    let mut rng = SimpleRng::new(11);
    let x: Quad<Vec<f32>> = [rng.vec_uniform(32, 1.0), rng.vec_uniform(32, 1.0), rng.vec_uniform(32, 1.0), rng.vec_uniform(32, 1.0)];
    let dense = conv_block_gradients(block, QoidMetric::Norm1, refs(&x)).unwrap();
    let (fused, _) = fused_gradients(block, refs(&x));
    assert!(dense.w.iter().chain(dense.b.iter()).all(|&v| v == 0.0));
    assert!(fused.w.iter().chain(fused.b.iter()).all(|&v| v == 0.0));
}

/// The fused optimizer is the dense Adam step fed BN-rescaled gradients.
#[test]
fn test_fused_adam_matches_dense_adam_on_rescaled_gradients() {
    let net = NetworkParameters::test_network(42).unwrap();
    let cfg = AdamConfig { lr: 1e-2, ..AdamConfig::default() };
    let mut rng = SimpleRng::new(6);
    let n = net.layer_output_size(0).unwrap();
    let mut x: Quad<Vec<f32>> = [rng.vec_uniform(n, 1.0), rng.vec_uniform(n, 1.0), rng.vec_uniform(n, 1.0), rng.vec_uniform(n, 1.0)];

    for layer in 1..=3 {
        let start = net.conv_block(layer).unwrap().clone();
        let g = start.geometry;
        let mut fused_block = start.clone();
        let mut dense_block = start.clone();
        let (mut fw, mut fb) = (AdamState::new(g.filters_len(), cfg), AdamState::new(g.bias_len(), cfg));
        let (mut dw, mut db) = (AdamState::new(g.filters_len(), cfg), AdamState::new(g.bias_len(), cfg));

        for step in 0..4 {
            let raw = raw_fused_gradients(&fused_block, refs(&x));
            adam_step_optimized(&mut fused_block, &raw, &mut fw, &mut fb);

            let mut scaled = raw.clone();
            rescale_by_bn(&dense_block, &mut scaled);
            dw.step(&mut dense_block.filters, &scaled.w);
            db.step(&mut dense_block.bias, &scaled.b);

            for (i, (a, b)) in fused_block.filters.iter().zip(dense_block.filters.iter()).enumerate() {
                assert!((a - b).abs() <= 1e-6, "layer {layer} step {step} w[{i}]: fused={a}, dense={b}");
            }
            for (i, (a, b)) in fused_block.bias.iter().zip(dense_block.bias.iter()).enumerate() {
                assert!((a - b).abs() <= 1e-6, "layer {layer} step {step} b[{i}]: fused={a}, dense={b}");
            }
        }
        assert_eq!(fw.steps(), 4);
        assert_ne!(fused_block.filters, start.filters, "layer {layer} never moved");
        x = forward_output_conv1d_bn_relu_maxpool_4(&start, refs(&x)).unwrap();
    }
}
