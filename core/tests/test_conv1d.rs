/// Conv1D forward and dy/dw columns, checked by hand on a 1x5 input.

use biobpfree_core::conv1d::{conv1d, dydw_column_conv1d, ConvGeometry};

fn geometry(bias_shared: bool) -> ConvGeometry {
    ConvGeometry {
        in_len: 5,
        in_depth: 1,
        no_filters: 1,
        filter_len: 3,
        padding: 1,
        bias_shared,
        pool_size: 1,
    }
}

const X: [f32; 5] = [1.0, 2.0, 3.0, 4.0, 5.0];
const W: [f32; 3] = [0.5, -1.0, 2.0];

#[test]
fn test_conv1d_hand_computed_with_edges() {
    let g = geometry(true);
    assert_eq!(g.conv_len(), 5);
    let mut y = vec![0.0f32; 5];
    conv1d(&X, &W, &[0.25], &g, &mut y);

    // y[p] = 0.5*x[p-1] - x[p] + 2*x[p+1] + 0.25, out-of-range taps read 0
    let expected = [
        0.5 * 0.0 - 1.0 + 2.0 * 2.0 + 0.25,
        0.5 * 1.0 - 2.0 + 2.0 * 3.0 + 0.25,
        0.5 * 2.0 - 3.0 + 2.0 * 4.0 + 0.25,
        0.5 * 3.0 - 4.0 + 2.0 * 5.0 + 0.25,
        0.5 * 4.0 - 5.0 + 2.0 * 0.0 + 0.25,
    ];
    assert_eq!(expected, [3.25, 4.75, 6.25, 7.75, -2.75]);
    for p in 0..5 {
        assert!((y[p] - expected[p]).abs() < 1e-6, "y[{p}]={}, expected {}", y[p], expected[p]);
    }
}

#[test]
fn test_conv1d_unshared_bias_per_position() {
    let g = geometry(false);
    let bias = [0.0, 1.0, 2.0, 3.0, 4.0];
    let mut shared = vec![0.0f32; 5];
    let mut unshared = vec![0.0f32; 5];
    conv1d(&X, &W, &[0.0], &geometry(true), &mut shared);
    conv1d(&X, &W, &bias, &g, &mut unshared);
    for p in 0..5 {
        assert!((unshared[p] - shared[p] - bias[p]).abs() < 1e-6);
    }
}

#[test]
fn test_dydw_columns_hold_shifted_input() {
    let g = geometry(true);
    let mut col = vec![f32::NAN; 5];

    let seg = dydw_column_conv1d(&X, &g, 0, &mut col);
    assert_eq!(seg, 0..5);
    assert_eq!(col, vec![0.0, 1.0, 2.0, 3.0, 4.0]);

    dydw_column_conv1d(&X, &g, 1, &mut col);
    assert_eq!(col, X.to_vec());

    dydw_column_conv1d(&X, &g, 2, &mut col);
    assert_eq!(col, vec![2.0, 3.0, 4.0, 5.0, 0.0]);
}

#[test]
fn test_dydw_column_zero_outside_filter_row() {
    let g = ConvGeometry { no_filters: 3, ..geometry(true) };
    let mut col = vec![7.0f32; 15];
    // weight 4 = filter 1, tap 1
    let seg = dydw_column_conv1d(&X, &g, 4, &mut col);
    assert_eq!(seg, 5..10);
    assert!(col[..5].iter().chain(col[10..].iter()).all(|&v| v == 0.0));
    assert_eq!(&col[5..10], &X);
}
