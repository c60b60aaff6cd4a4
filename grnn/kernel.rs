//! Gaussian-kernel regression primitives shared by both estimator stages.
//!
//! A reference point contributes to an estimate in proportion to
//! `exp(-d^2 / (2 sigma^2))`, where `d` is its Euclidean distance from the query. The
//! estimate is the weighted mean of the reference labels. When every weight underflows,
//! the weight total is floored at `DENOMINATOR_FLOOR` so the result stays finite.

use crate::data::TrainingMatrix;
use log::debug;
use ndarray::{Array1, ArrayView1};

/// Lower bound applied to the kernel-weight total before dividing.
pub const DENOMINATOR_FLOOR: f64 = 1e-7;

pub fn squared_distance<'a, 'b>(
    a: impl IntoIterator<Item = &'a f64>,
    b: impl IntoIterator<Item = &'b f64>,
) -> f64 {
    a.into_iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Gaussian weight for a squared distance. Always in `[0, 1]`, exactly 1 at distance 0.
#[inline]
pub fn gaussian_weight(squared_distance: f64, sigma: f64) -> f64 {
    (-squared_distance / (2.0 * sigma * sigma)).exp()
}

/// Running weighted mean with the denominator floor applied on `finish`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedMean {
    weighted_sum: f64,
    weight_sum: f64,
}

impl WeightedMean {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, weight: f64, value: f64) {
        self.weighted_sum += weight * value;
        self.weight_sum += weight;
    }

    pub fn weight_sum(&self) -> f64 {
        self.weight_sum
    }

    /// True when the floor, not the real weight total, will be the divisor.
    pub fn is_floored(&self) -> bool {
        self.weight_sum < DENOMINATOR_FLOOR
    }

    pub fn finish(&self) -> f64 {
        self.weighted_sum / self.weight_sum.max(DENOMINATOR_FLOOR)
    }
}

/// Estimates the label of `query` (features only) against the rows of `matrix`.
///
/// `skip` excludes one row from the reference set.
pub fn estimate(
    query: ArrayView1<f64>,
    matrix: &TrainingMatrix,
    sigma: f64,
    skip: Option<usize>,
) -> WeightedMean {
    let mut mean = WeightedMean::new();
    for r in (0..matrix.nrows()).filter(|&r| Some(r) != skip) {
        let weight = gaussian_weight(squared_distance(query, matrix.features(r)), sigma);
        mean.push(weight, matrix.label(r));
    }
    mean
}

/// Stage-1 pseudo-labels: every row's kernel estimate against the rest of the table.
///
/// With `include_self` the row also weighs itself (weight 1), which pulls each
/// pseudo-label towards the row's own label.
pub fn fit_in_sample(matrix: &TrainingMatrix, sigma1: f64, include_self: bool) -> Array1<f64> {
    let mut floored = 0usize;
    let pseudo = Array1::from_shape_fn(matrix.nrows(), |i| {
        let skip = if include_self { None } else { Some(i) };
        let mean = estimate(matrix.features(i), matrix, sigma1, skip);
        if mean.is_floored() {
            floored += 1;
        }
        mean.finish()
    });
    if floored > 0 {
        debug!(
            "Stage-1: {floored} of {} rows hit the kernel denominator floor (sigma1 = {sigma1})",
            matrix.nrows()
        );
    }
    pseudo
}
