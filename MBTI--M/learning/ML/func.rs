use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// Probabilities are clipped to this floor before taking logs.
pub const PROBABILITY_FLOOR: f64 = 1e-15;

/// Applies a numerically stable softmax to every row in place.
pub fn softmax_rows(scores: &mut Array2<f32>) {
    for mut row in scores.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|value| (value - max).exp());
        let total: f32 = row.sum();
        if total > 0.0 && total.is_finite() {
            row.mapv_inplace(|value| value / total);
        }
    }
}

/// Index of the largest value; the first one wins ties.
#[must_use]
pub fn argmax(row: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    for (idx, &value) in row.iter().enumerate() {
        if value > row[best] {
            best = idx;
        }
    }
    best
}

/// Row-wise argmax.
#[must_use]
pub fn argmax_rows(probabilities: ArrayView2<'_, f32>) -> Vec<usize> {
    probabilities.axis_iter(Axis(0)).map(argmax).collect()
}

/// Mean multiclass cross-entropy of `probabilities` against integer targets.
#[must_use]
pub fn log_loss(probabilities: ArrayView2<'_, f32>, targets: &[usize]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let total: f64 = targets
        .iter()
        .enumerate()
        .map(|(row, &target)| {
            -f64::from(probabilities[[row, target]])
                .clamp(PROBABILITY_FLOOR, 1.0)
                .ln()
        })
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let n = targets.len() as f64;
    total / n
}

/// One-hot encodes integer targets into an `n × n_classes` matrix.
#[must_use]
pub fn one_hot(targets: &[usize], n_classes: usize) -> Array2<f32> {
    let mut encoded = Array2::zeros((targets.len(), n_classes));
    for (row, &target) in targets.iter().enumerate() {
        encoded[[row, target]] = 1.0;
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut scores = array![[1.0_f32, 2.0, 3.0], [1000.0, 1000.0, -1000.0]];
        softmax_rows(&mut scores);
        for row in scores.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!((scores[[1, 0]] - 0.5).abs() < 1e-6);
        assert_eq!(argmax_rows(scores.view()), vec![2, 0]);
    }

    #[test]
    fn log_loss_rewards_confident_hits() {
        let good = array![[0.9_f32, 0.1], [0.2, 0.8]];
        let bad = array![[0.1_f32, 0.9], [0.8, 0.2]];
        assert!(log_loss(good.view(), &[0, 1]) < log_loss(bad.view(), &[0, 1]));
        let zero = array![[0.0_f32, 1.0]];
        assert!(log_loss(zero.view(), &[0]).is_finite());
    }

    #[test]
    fn one_hot_marks_targets() {
        let encoded = one_hot(&[2, 0], 3);
        assert_eq!(encoded, array![[0.0, 0.0, 1.0], [1.0, 0.0, 0.0]]);
    }
}
