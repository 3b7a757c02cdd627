use std::fs;

use anyhow::{bail, Context, Result};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    artifact::{ModelEvaluationArtifact, ModelPusherArtifact},
    config::ModelPusherConfig,
    error::Stage,
    estimator::ModelBundle,
    storage::ObjectStore,
    telemetry::PipelineTelemetry,
};

/// Uploads an accepted bundle to the object store.
#[derive(Debug)]
pub struct ModelPusher {
    config: ModelPusherConfig,
    evaluation: ModelEvaluationArtifact,
    telemetry: PipelineTelemetry,
}

impl ModelPusher {
    /// Creates the stage.
    #[must_use]
    pub fn new(
        config: ModelPusherConfig,
        evaluation: ModelEvaluationArtifact,
        telemetry: &PipelineTelemetry,
    ) -> Self {
        Self {
            config,
            evaluation,
            telemetry: telemetry.for_module(Stage::ModelPusher.name()),
        }
    }

    /// Runs the stage. Refuses evaluations that did not accept the candidate.
    pub fn initiate(&self, store: &dyn ObjectStore) -> Result<ModelPusherArtifact> {
        if !self.evaluation.is_model_accepted {
            bail!("refusing to publish a model that was not accepted by evaluation");
        }
        self.telemetry
            .info("Uploading artifacts folder to object storage");
        let path = &self.evaluation.trained_model_path;
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        ModelBundle::from_bytes(&bytes)
            .with_context(|| format!("checking bundle {} before upload", path.display()))?;
        store.put(&self.config.bucket_name, &self.config.model_key, &bytes)?;
        let _ = self.telemetry.log(
            LogLevel::Info,
            "Uploaded model bundle",
            json!({
                "bucket_name": self.config.bucket_name,
                "model_key": self.config.model_key,
                "bytes": bytes.len(),
            }),
        );
        Ok(ModelPusherArtifact {
            bucket_name: self.config.bucket_name.clone(),
            model_key: self.config.model_key.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifact::EvaluateModelResponse, storage::MemoryObjectStore, test_support,
    };
    use tempfile::tempdir;

    fn evaluation(run: &test_support::TrainedRun, accepted: bool) -> ModelEvaluationArtifact {
        let f1 = run.trainer.metric_artifact.f1_score;
        let incumbent = if accepted { 0.0 } else { f1 };
        let decision = EvaluateModelResponse::decide(f1, incumbent, 0.02);
        ModelEvaluationArtifact {
            is_model_accepted: decision.is_model_accepted,
            changed_accuracy: decision.best_model_f1_score,
            incumbent_f1_score: incumbent,
            trained_model_path: run.trainer.trained_model_file_path.clone(),
            bucket_name: run.stages.pusher.bucket_name.clone(),
            model_key: run.stages.pusher.model_key.clone(),
            decision,
        }
    }

    #[test]
    fn publishes_the_candidate_bytes() {
        let dir = tempdir().unwrap();
        let run = test_support::trained_run(dir.path());
        let store = MemoryObjectStore::new();
        let artifact = ModelPusher::new(
            run.stages.pusher.clone(),
            evaluation(&run, true),
            &PipelineTelemetry::disabled(),
        )
        .initiate(&store)
        .unwrap();
        assert_eq!(artifact.model_key, run.stages.pusher.model_key);
        assert_eq!(store.put_count(), 1);
        assert_eq!(
            store.get(&artifact.bucket_name, &artifact.model_key).unwrap(),
            fs::read(&run.trainer.trained_model_file_path).unwrap()
        );
    }

    #[test]
    fn refuses_rejected_candidates() {
        let dir = tempdir().unwrap();
        let run = test_support::trained_run(dir.path());
        let store = MemoryObjectStore::new();
        let result = ModelPusher::new(
            run.stages.pusher.clone(),
            evaluation(&run, false),
            &PipelineTelemetry::disabled(),
        )
        .initiate(&store);
        assert!(result.is_err());
        assert_eq!(store.put_count(), 0);
    }
}
