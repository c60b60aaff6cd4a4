//! Error metrics for comparing predictions against held-out labels.

use ndarray::ArrayView1;

pub fn root_mean_squared_error(y_true: ArrayView1<f64>, y_pred: ArrayView1<f64>) -> f64 {
    debug_assert_eq!(y_true.len(), y_pred.len());
    if y_true.is_empty() {
        return 0.0;
    }
    let sum: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (p - t).powi(2))
        .sum();
    (sum / y_true.len() as f64).sqrt()
}

/// Mean absolute percentage error, in percent. Rows whose true label is exactly zero
/// have no defined percentage and are left out of the mean.
pub fn mean_absolute_percentage_error(y_true: ArrayView1<f64>, y_pred: ArrayView1<f64>) -> f64 {
    debug_assert_eq!(y_true.len(), y_pred.len());
    let (sum, count) = y_true
        .iter()
        .zip(y_pred)
        .filter(|(t, _)| **t != 0.0)
        .fold((0.0, 0usize), |(sum, count), (t, p)| {
            (sum + ((t - p) / t).abs(), count + 1)
        });
    if count == 0 {
        0.0
    } else {
        sum / count as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn rmse_of_known_errors() {
        let t = array![1.0, 2.0, 3.0, 4.0];
        let p = array![2.0, 2.0, 1.0, 4.0];
        assert_abs_diff_eq!(root_mean_squared_error(t.view(), p.view()), (5.0f64 / 4.0).sqrt());
        assert_abs_diff_eq!(root_mean_squared_error(t.view(), t.view()), 0.0);
    }

    #[test]
    fn mape_skips_zero_labels() {
        let t = array![10.0, 0.0, 20.0];
        let p = array![11.0, 5.0, 15.0];
        assert_abs_diff_eq!(
            mean_absolute_percentage_error(t.view(), p.view()),
            (0.1 + 0.25) / 2.0 * 100.0,
            epsilon = 1e-12
        );
    }
}
