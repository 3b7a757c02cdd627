use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Result of a non-fatal gate. Returned by value so callers must branch on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateOutcome {
    /// The pipeline may continue.
    Passed,
    /// The pipeline stops without error.
    Rejected(String),
}

impl GateOutcome {
    /// Returns `true` for [`GateOutcome::Passed`].
    #[must_use]
    pub const fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Output of the ingestion stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataIngestionArtifact {
    /// Full snapshot of the collection.
    pub feature_store_file_path: PathBuf,
    /// Training partition.
    pub trained_file_path: PathBuf,
    /// Test partition.
    pub test_file_path: PathBuf,
    /// Rows in the training partition.
    pub train_rows: usize,
    /// Rows in the test partition.
    pub test_rows: usize,
}

/// Persisted validation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Combined pass/fail over both partitions.
    pub validation_status: bool,
    /// Every violation found.
    pub message: Vec<String>,
}

/// Output of the validation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataValidationArtifact {
    /// Combined pass/fail over both partitions.
    pub validation_status: bool,
    /// Every violation found, prefixed by the partition name.
    pub message: Vec<String>,
    /// Location of the persisted report.
    pub validation_report_file_path: PathBuf,
}

impl DataValidationArtifact {
    /// Gate decision derived from the status flag.
    #[must_use]
    pub fn gate(&self) -> GateOutcome {
        if self.validation_status {
            GateOutcome::Passed
        } else {
            GateOutcome::Rejected(self.message.join("; "))
        }
    }

    /// Report view of this artifact.
    #[must_use]
    pub fn report(&self) -> ValidationReport {
        ValidationReport {
            validation_status: self.validation_status,
            message: self.message.clone(),
        }
    }
}

/// Output of the transformation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTransformationArtifact {
    /// Fitted feature transformer.
    pub transformed_object_file_path: PathBuf,
    /// Resampled training array, label in the last column.
    pub transformed_train_file_path: PathBuf,
    /// Test array at its natural distribution, label in the last column.
    pub transformed_test_file_path: PathBuf,
}

/// Held-out classification metrics of a trained model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetricArtifact {
    /// Fraction of correct predictions.
    pub accuracy: f64,
    /// Harmonic mean of precision and recall for the positive class.
    pub f1_score: f64,
    /// Positive predictive value.
    pub precision_score: f64,
    /// True positive rate.
    pub recall_score: f64,
}

/// Output of the training stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTrainerArtifact {
    /// Serialized model bundle.
    pub trained_model_file_path: PathBuf,
    /// Metrics on the test partition.
    pub metric_artifact: ClassificationMetricArtifact,
    /// Accuracy of the model on its own training data.
    pub training_accuracy: f64,
}

/// Candidate vs incumbent comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluateModelResponse {
    /// F1 of the newly trained model.
    pub trained_model_f1_score: f64,
    /// F1 of the model that should be serving after this run.
    pub best_model_f1_score: f64,
    /// Whether the candidate clears the promotion threshold.
    pub is_model_accepted: bool,
    /// `candidate - incumbent`.
    pub difference: f64,
}

impl EvaluateModelResponse {
    /// Applies the promotion rule. A candidate must beat the incumbent by more
    /// than `threshold` to be accepted.
    #[must_use]
    pub fn decide(candidate: f64, incumbent: f64, threshold: f64) -> Self {
        let best_model_f1_score = if incumbent > candidate - threshold {
            incumbent
        } else {
            candidate
        };
        Self {
            trained_model_f1_score: candidate,
            best_model_f1_score,
            is_model_accepted: candidate > incumbent + threshold,
            difference: candidate - incumbent,
        }
    }
}

/// Output of the evaluation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEvaluationArtifact {
    /// Promotion decision.
    pub is_model_accepted: bool,
    /// Best known F1 after this run.
    pub changed_accuracy: f64,
    /// F1 of the incumbent, zero when none is deployed.
    pub incumbent_f1_score: f64,
    /// Local path of the candidate bundle.
    pub trained_model_path: PathBuf,
    /// Destination bucket.
    pub bucket_name: String,
    /// Destination key.
    pub model_key: String,
    /// Full comparison.
    pub decision: EvaluateModelResponse,
}

impl ModelEvaluationArtifact {
    /// Gate decision derived from the promotion rule.
    #[must_use]
    pub fn gate(&self) -> GateOutcome {
        if self.is_model_accepted {
            GateOutcome::Passed
        } else {
            GateOutcome::Rejected(format!(
                "candidate f1 {:.4} does not beat incumbent f1 {:.4} by the configured margin (delta {:.4})",
                self.decision.trained_model_f1_score,
                self.incumbent_f1_score,
                self.decision.difference
            ))
        }
    }
}

/// Output of the pusher stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPusherArtifact {
    /// Bucket holding the published bundle.
    pub bucket_name: String,
    /// Key of the published bundle.
    pub model_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_candidate_beyond_threshold() {
        let decision = EvaluateModelResponse::decide(0.83, 0.80, 0.02);
        assert!(decision.is_model_accepted);
        assert!((decision.best_model_f1_score - 0.83).abs() < 1e-12);
        assert!((decision.difference - 0.03).abs() < 1e-9);
    }

    #[test]
    fn keeps_incumbent_within_threshold() {
        let decision = EvaluateModelResponse::decide(0.81, 0.80, 0.02);
        assert!(!decision.is_model_accepted);
        assert!((decision.best_model_f1_score - 0.80).abs() < 1e-12);
        assert!((decision.difference - 0.01).abs() < 1e-9);
    }

    #[test]
    fn first_model_competes_against_zero() {
        let decision = EvaluateModelResponse::decide(0.40, 0.0, 0.02);
        assert!(decision.is_model_accepted);
        assert!((decision.best_model_f1_score - 0.40).abs() < 1e-12);
    }

    #[test]
    fn validation_gate_carries_every_violation() {
        let artifact = DataValidationArtifact {
            validation_status: false,
            message: vec!["train: missing a".into(), "test: missing b".into()],
            validation_report_file_path: PathBuf::from("report.json"),
        };
        match artifact.gate() {
            GateOutcome::Rejected(reason) => {
                assert!(reason.contains("missing a"));
                assert!(reason.contains("missing b"));
            }
            GateOutcome::Passed => panic!("expected rejection"),
        }
        assert!(!artifact.report().validation_status);
    }
}
