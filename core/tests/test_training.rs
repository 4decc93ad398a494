/// End-to-end layer-wise training on a synthetic quadruple.

use biobpfree_core::forward::infer;
use biobpfree_core::training::ConvKernel;
use biobpfree_core::qoid::QoidMetric;
use biobpfree_core::tensor::SimpleRng;
use biobpfree_core::{train_with_config, training_seizdet_cnn, EngineError, NetworkParameters, Quadruple, TrainingConfig, TrainingReport};

/// Positives: a period-8 sine plus small noise. Negatives: low-amplitude noise.
fn canonical_quadruple(seed: u64) -> Quadruple {
    let mut rng = SimpleRng::new(seed);
    let mut positive = || -> Vec<f32> {
        (0..32)
            .map(|t| (2.0 * std::f64::consts::PI * t as f64 / 8.0).sin() as f32 + rng.uniform(0.1))
            .collect()
    };
    let p0 = positive();
    let p1 = positive();
    let n0 = rng.vec_uniform(32, 0.3);
    let n1 = rng.vec_uniform(32, 0.3);
    Quadruple::new([p0, p1], [n0, n1])
}

fn assert_every_layer_improves(report: &TrainingReport) {
    assert_eq!(report.layers.len(), 5);
    for (i, l) in report.layers.iter().enumerate() {
        assert_eq!(l.layer, i + 1);
        let initial = l.initial_loss.unwrap();
        assert!(l.final_loss.is_finite());
        assert!(l.final_loss < initial, "layer {}: {} -> {}", l.layer, initial, l.final_loss);
    }
}

fn assert_probabilities_normalized(report: &TrainingReport) {
    for p in report.probabilities.iter() {
        assert!(p.iter().all(|&v| (0.0..=1.0).contains(&v)), "{p:?}");
        assert!((p[0] + p[1] - 1.0).abs() < 1e-5, "{p:?}");
    }
}

#[test]
fn test_one_epoch_lowers_every_layer_loss() {
    let mut net = NetworkParameters::test_network(42).unwrap();
    let before = net.clone();
    let quad = canonical_quadruple(5);
    let report = training_seizdet_cnn(&mut net, &quad, 1).unwrap();

    assert_every_layer_improves(&report);
    assert_probabilities_normalized(&report);
    for layer in 1..=3 {
        assert_ne!(net.conv_block(layer).unwrap().filters, before.conv_block(layer).unwrap().filters);
    }
    for layer in 4..=5 {
        assert_ne!(net.dense_layer(layer).unwrap().weights, before.dense_layer(layer).unwrap().weights);
    }
    // BN statistics are frozen.
    assert_eq!(net.conv_block(2).unwrap().bn, before.conv_block(2).unwrap().bn);
}

#[test]
fn test_fused_kernel_three_epochs() {
    let mut net = NetworkParameters::test_network(7).unwrap();
    let quad = canonical_quadruple(9);
    let config = TrainingConfig { epochs: 3, conv_kernel: ConvKernel::Fused, ..TrainingConfig::default() };
    let report = train_with_config(&mut net, &quad, &config).unwrap();
    assert_every_layer_improves(&report);
    assert_probabilities_normalized(&report);
}

#[test]
fn test_euclidean_metric_trains() {
    let mut net = NetworkParameters::test_network(3).unwrap();
    let quad = canonical_quadruple(5);
    let config = TrainingConfig { metric: QoidMetric::Euclidean, ..TrainingConfig::default() };
    let report = train_with_config(&mut net, &quad, &config).unwrap();
    assert_every_layer_improves(&report);
}

#[test]
fn test_reported_probabilities_match_inference() {
    let mut net = NetworkParameters::test_network(42).unwrap();
    let quad = canonical_quadruple(9);
    let report = training_seizdet_cnn(&mut net, &quad, 2).unwrap();
    for (s, p) in report.probabilities.iter().enumerate() {
        let q = infer(&net, &quad.samples[s]).unwrap();
        assert!((p[0] - q[0]).abs() < 1e-6 && (p[1] - q[1]).abs() < 1e-6, "sample {s}: {p:?} vs {q:?}");
    }
}

#[test]
fn test_fused_with_euclidean_rejected_before_training() {
    let mut net = NetworkParameters::test_network(42).unwrap();
    let before = net.clone();
    let config = TrainingConfig {
        metric: QoidMetric::Euclidean,
        conv_kernel: ConvKernel::Fused,
        ..TrainingConfig::default()
    };
    assert!(train_with_config(&mut net, &canonical_quadruple(5), &config).is_err());
    assert_eq!(net, before);
}

#[test]
fn test_malformed_head_rejected_before_training() {
    let mut net = NetworkParameters::test_network(42).unwrap();
    let head = net.dense[1].as_mut().unwrap();
    head.out_size = 3;
    head.weights = vec![0.1; 24];
    head.bias = vec![0.0; 3];
    let before = net.clone();
    let err = training_seizdet_cnn(&mut net, &canonical_quadruple(5), 1).unwrap_err();
    assert!(matches!(err, EngineError::Config(_)), "{err}");
    assert_eq!(net, before);
}
