use anyhow::{Context, Result};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    artifact::{
        DataIngestionArtifact, EvaluateModelResponse, ModelEvaluationArtifact,
        ModelTrainerArtifact,
    },
    config::ModelEvaluationConfig,
    error::Stage,
    estimator::{forest::binary_labels, metrics::classification_metrics, BundleError, ModelBundle},
    storage::ObjectStore,
    table::Table,
    telemetry::PipelineTelemetry,
};

/// Compares the candidate bundle with the deployed one on the test partition.
#[derive(Debug)]
pub struct ModelEvaluation {
    config: ModelEvaluationConfig,
    ingestion: DataIngestionArtifact,
    trainer: ModelTrainerArtifact,
    telemetry: PipelineTelemetry,
}

impl ModelEvaluation {
    /// Creates the stage.
    #[must_use]
    pub fn new(
        config: ModelEvaluationConfig,
        ingestion: DataIngestionArtifact,
        trainer: ModelTrainerArtifact,
        telemetry: &PipelineTelemetry,
    ) -> Self {
        Self {
            config,
            ingestion,
            trainer,
            telemetry: telemetry.for_module(Stage::ModelEvaluation.name()),
        }
    }

    /// Deployed bundle, if any. A bundle this build cannot read is treated as
    /// absent.
    pub fn get_best_model(&self, store: &dyn ObjectStore) -> Result<Option<ModelBundle>> {
        let (bucket, key) = (&self.config.bucket_name, &self.config.model_key);
        if !store.exists(bucket, key)? {
            return Ok(None);
        }
        let bytes = store.get(bucket, key)?;
        match ModelBundle::from_bytes(&bytes) {
            Ok(bundle) => Ok(Some(bundle)),
            Err(
                err @ (BundleError::Format(_)
                | BundleError::Version { .. }
                | BundleError::Json(_)
                | BundleError::FeatureMismatch { .. }),
            ) => {
                self.telemetry.warn(&format!(
                    "Ignoring incompatible deployed model {bucket}/{key}: {err}"
                ));
                Ok(None)
            }
            Err(err) => Err(err).with_context(|| format!("loading deployed model {bucket}/{key}")),
        }
    }

    /// F1 of the deployed bundle on the raw test partition; zero when there is
    /// none or it cannot score this data.
    pub fn incumbent_f1(&self, store: &dyn ObjectStore, test: &Table, actual: &[u8]) -> Result<f64> {
        let Some(bundle) = self.get_best_model(store)? else {
            self.telemetry.info("No deployed model found, candidate competes against 0");
            return Ok(0.0);
        };
        match bundle.predict(test) {
            Ok(predicted) => Ok(classification_metrics(actual, &predicted).f1_score),
            Err(err) => {
                self.telemetry
                    .warn(&format!("Deployed model cannot score the test partition: {err}"));
                Ok(0.0)
            }
        }
    }

    /// Applies the promotion rule and returns it with the incumbent's F1.
    ///
    /// The candidate's F1 is the trainer's figure on the transformed test
    /// array. The incumbent is scored on the raw ingestion test CSV instead,
    /// pushed through its own fitted transformer, since its feature layout
    /// may differ from the candidate's. Labels come from the same raw rows.
    fn compare(&self, store: &dyn ObjectStore) -> Result<(EvaluateModelResponse, f64)> {
        let test = Table::read_csv(&self.ingestion.test_file_path)?;
        let candidate = ModelBundle::load(&self.trainer.trained_model_file_path)?;
        let actual = binary_labels(&candidate.transformer().target_labels(&test)?)?;
        let incumbent = self.incumbent_f1(store, &test, &actual)?;
        let decision = EvaluateModelResponse::decide(
            self.trainer.metric_artifact.f1_score,
            incumbent,
            self.config.changed_threshold_score,
        );
        Ok((decision, incumbent))
    }

    /// Runs the stage. A declined promotion is reported in the artifact.
    pub fn initiate(&self, store: &dyn ObjectStore) -> Result<ModelEvaluationArtifact> {
        self.telemetry.info("Initialized Model Evaluation Component.");
        let (decision, incumbent_f1_score) = self.compare(store)?;
        let _ = self.telemetry.log(
            LogLevel::Info,
            "Model evaluation completed",
            json!({
                "trained_model_f1_score": decision.trained_model_f1_score,
                "incumbent_f1_score": incumbent_f1_score,
                "best_model_f1_score": decision.best_model_f1_score,
                "is_model_accepted": decision.is_model_accepted,
                "difference": decision.difference,
            }),
        );
        Ok(ModelEvaluationArtifact {
            is_model_accepted: decision.is_model_accepted,
            changed_accuracy: decision.best_model_f1_score,
            incumbent_f1_score,
            trained_model_path: self.trainer.trained_model_file_path.clone(),
            bucket_name: self.config.bucket_name.clone(),
            model_key: self.config.model_key.clone(),
            decision,
        })
    }
}
