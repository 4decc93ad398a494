/// 1D convolution with implicit zero-padding, stride 1.
///
/// Layout:
///   x:       [in_depth, in_len]
///   filters: [no_filters, in_depth, filter_len]
///   bias:    [no_filters] (shared) or [no_filters, conv_len]
///   y:       [no_filters, conv_len]
///
/// Output position `p` reads input position `p + tap - padding`; taps that
/// land outside `[0, in_len)` contribute zero.
///
/// The Jacobian of `y` with respect to one weight has a single nonzero
/// segment (the row of its filter), so it is produced on demand by
/// `dydw_column_conv1d` instead of being stored as a `#weights x #outputs`
/// matrix.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Shape of one Conv1D -> BatchNorm -> ReLU -> MaxPool block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub in_len: usize,
    pub in_depth: usize,
    pub no_filters: usize,
    pub filter_len: usize,
    pub padding: usize,
    /// One bias per filter when true, one per output element otherwise.
    pub bias_shared: bool,
    pub pool_size: usize,
}

impl ConvGeometry {
    /// Conv output length per filter: `in_len + 2*padding - filter_len + 1`, or 0.
    pub fn conv_len(&self) -> usize {
        (self.in_len + 2 * self.padding + 1).saturating_sub(self.filter_len)
    }

    /// Number of finished pooling windows per filter.
    pub fn pooled_len(&self) -> usize {
        if self.pool_size == 0 {
            return 0;
        }
        self.conv_len() / self.pool_size
    }

    pub fn input_size(&self) -> usize {
        self.in_depth * self.in_len
    }

    pub fn filters_len(&self) -> usize {
        self.no_filters * self.in_depth * self.filter_len
    }

    pub fn bias_len(&self) -> usize {
        if self.bias_shared {
            self.no_filters
        } else {
            self.no_filters * self.conv_len()
        }
    }

    /// Conv (and BN, ReLU) map size for one sample.
    pub fn conv_size(&self) -> usize {
        self.no_filters * self.conv_len()
    }

    /// Pooled output size for one sample.
    pub fn output_size(&self) -> usize {
        self.no_filters * self.pooled_len()
    }

    /// Index into the bias vector for filter `f` at conv position `p`.
    #[inline]
    pub fn bias_index(&self, f: usize, p: usize) -> usize {
        if self.bias_shared {
            f
        } else {
            f * self.conv_len() + p
        }
    }

    /// Bias entries owned by filter `f`.
    pub fn bias_range(&self, f: usize) -> Range<usize> {
        if self.bias_shared {
            f..f + 1
        } else {
            let n = self.conv_len();
            f * n..(f + 1) * n
        }
    }

    /// Weight entries owned by filter `f`.
    pub fn filter_range(&self, f: usize) -> Range<usize> {
        let per = self.in_depth * self.filter_len;
        f * per..(f + 1) * per
    }

    /// Split a flat weight index into (filter, depth, tap).
    #[inline]
    pub fn weight_coords(&self, weight_index: usize) -> (usize, usize, usize) {
        let per = self.in_depth * self.filter_len;
        let f = weight_index / per;
        let r = weight_index % per;
        (f, r / self.filter_len, r % self.filter_len)
    }

    /// Input index read by conv position `p` through tap `t` of depth `d`, if in range.
    #[inline]
    pub fn input_index(&self, d: usize, p: usize, t: usize) -> Option<usize> {
        let src = (p + t).checked_sub(self.padding)?;
        if src < self.in_len {
            Some(d * self.in_len + src)
        } else {
            None
        }
    }
}

/// Conv output for filter `f` at position `p`, bias included.
#[inline]
pub fn conv1d_at(x: &[f32], filters: &[f32], bias: &[f32], g: &ConvGeometry, f: usize, p: usize) -> f32 {
    let mut acc = bias[g.bias_index(f, p)];
    let base = f * g.in_depth * g.filter_len;
    for d in 0..g.in_depth {
        let w = &filters[base + d * g.filter_len..base + (d + 1) * g.filter_len];
        for (t, &wt) in w.iter().enumerate() {
            if let Some(i) = g.input_index(d, p, t) {
                acc += wt * x[i];
            }
        }
    }
    acc
}

/// Full Conv1D forward. `y` must hold `no_filters * conv_len` elements (overwritten).
pub fn conv1d(x: &[f32], filters: &[f32], bias: &[f32], g: &ConvGeometry, y: &mut [f32]) {
    debug_assert_eq!(x.len(), g.input_size());
    debug_assert_eq!(filters.len(), g.filters_len());
    debug_assert_eq!(bias.len(), g.bias_len());
    debug_assert_eq!(y.len(), g.conv_size());

    let conv_len = g.conv_len();
    for f in 0..g.no_filters {
        for p in 0..conv_len {
            y[f * conv_len + p] = conv1d_at(x, filters, bias, g, f, p);
        }
    }
}

/// Column `weight_index` of dy/dw: for every output element, the input sample
/// that weight multiplies (0 outside its filter row and for padded taps).
///
/// `col` must hold `no_filters * conv_len` elements (overwritten). Returns the
/// range of `col` that may be nonzero, so callers can restrict their dot product.
pub fn dydw_column_conv1d(x: &[f32], g: &ConvGeometry, weight_index: usize, col: &mut [f32]) -> Range<usize> {
    debug_assert_eq!(x.len(), g.input_size());
    debug_assert_eq!(col.len(), g.conv_size());
    debug_assert!(weight_index < g.filters_len());

    let conv_len = g.conv_len();
    let (f, d, t) = g.weight_coords(weight_index);
    col.iter_mut().for_each(|v| *v = 0.0);
    for p in 0..conv_len {
        if let Some(i) = g.input_index(d, p, t) {
            col[f * conv_len + p] = x[i];
        }
    }
    f * conv_len..(f + 1) * conv_len
}
