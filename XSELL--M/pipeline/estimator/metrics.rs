use crate::artifact::ClassificationMetricArtifact;

/// Accuracy, F1, precision and recall for the positive class `1`.
///
/// Undefined ratios (no predicted or no actual positives) count as zero.
#[must_use]
pub fn classification_metrics(actual: &[u8], predicted: &[u8]) -> ClassificationMetricArtifact {
    let mut tp = 0_usize;
    let mut fp = 0_usize;
    let mut fn_ = 0_usize;
    let mut correct = 0_usize;
    for (truth, guess) in actual.iter().zip(predicted) {
        match (*truth == 1, *guess == 1) {
            (true, true) => tp += 1,
            (false, true) => fp += 1,
            (true, false) => fn_ += 1,
            (false, false) => {}
        }
        if truth == guess {
            correct += 1;
        }
    }
    let total = actual.len().min(predicted.len());
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };
    ClassificationMetricArtifact {
        accuracy: ratio(correct, total),
        f1_score: f1,
        precision_score: precision,
        recall_score: recall,
    }
}

/// Fraction of positions where the two label vectors agree.
#[must_use]
pub fn accuracy(actual: &[u8], predicted: &[u8]) -> f64 {
    let total = actual.len().min(predicted.len());
    let correct = actual
        .iter()
        .zip(predicted)
        .filter(|(truth, guess)| truth == guess)
        .count();
    ratio(correct, total)
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_positive_class_scores() {
        let metrics = classification_metrics(&[1, 1, 0, 0, 1], &[1, 0, 0, 1, 1]);
        assert!((metrics.accuracy - 0.6).abs() < 1e-12);
        assert!((metrics.precision_score - 2.0 / 3.0).abs() < 1e-12);
        assert!((metrics.recall_score - 2.0 / 3.0).abs() < 1e-12);
        assert!((metrics.f1_score - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn no_positive_predictions_scores_zero() {
        let metrics = classification_metrics(&[1, 0], &[0, 0]);
        assert!((metrics.f1_score).abs() < f64::EPSILON);
        assert!((metrics.accuracy - 0.5).abs() < 1e-12);
        assert!((accuracy(&[], &[])).abs() < f64::EPSILON);
    }
}
