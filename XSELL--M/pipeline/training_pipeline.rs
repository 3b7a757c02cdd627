use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_logging::LogLevel;
use uuid::Uuid;

use crate::{
    artifact::{GateOutcome, ModelEvaluationArtifact, ModelPusherArtifact},
    components::{
        DataIngestion, DataTransformation, DataValidation, ModelEvaluation, ModelPusher,
        ModelTrainer,
    },
    config::PipelineConfig,
    error::{PipelineError, Stage},
    progress::ProgressSender,
    storage::{DocumentStore, ObjectStore},
    telemetry::PipelineTelemetry,
};

/// Cooperative cancellation flag, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a run that raised no error ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// The candidate was accepted and published.
    Pushed {
        /// Promotion decision.
        evaluation: ModelEvaluationArtifact,
        /// Published location.
        pusher: ModelPusherArtifact,
    },
    /// The data failed schema validation.
    ValidationRejected {
        /// Every violation, joined.
        reason: String,
        /// Persisted validation report.
        report_path: PathBuf,
    },
    /// The candidate did not beat the deployed model.
    PromotionRejected {
        /// Why the candidate was declined.
        reason: String,
        /// Promotion decision.
        evaluation: ModelEvaluationArtifact,
    },
}

impl PipelineOutcome {
    /// Short, stable label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Pushed { .. } => "pushed",
            Self::ValidationRejected { .. } => "validation_rejected",
            Self::PromotionRejected { .. } => "promotion_rejected",
        }
    }

    /// Whether a new model was published.
    #[must_use]
    pub const fn is_pushed(&self) -> bool {
        matches!(self, Self::Pushed { .. })
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run identifier.
    pub run_id: Uuid,
    /// Timestamped artifact directory.
    pub artifact_dir: PathBuf,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Stages that returned an artifact, in order.
    pub stages_completed: Vec<Stage>,
    /// How the run ended.
    pub outcome: PipelineOutcome,
}

/// Runs the six stages in order, stopping at the first error or rejected gate.
///
/// Collaborators are injected and shared by every run of this pipeline. Each
/// run builds fresh stage objects and a fresh artifact directory; nothing is
/// resumed and partial artifacts are left on disk.
pub struct TrainingPipeline {
    config: PipelineConfig,
    documents: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    telemetry: PipelineTelemetry,
    cancel: CancelToken,
}

impl std::fmt::Debug for TrainingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingPipeline")
            .field("run_id", &self.telemetry.run_id())
            .field("artifact_root", &self.config.artifact_root)
            .finish_non_exhaustive()
    }
}

impl TrainingPipeline {
    /// Creates the pipeline. The run id is taken from `telemetry`.
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        documents: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        telemetry: PipelineTelemetry,
    ) -> Self {
        Self {
            config,
            documents,
            objects,
            telemetry: telemetry.for_module("training_pipeline"),
            cancel: CancelToken::new(),
        }
    }

    /// Forwards every log line of the run to `sender`.
    #[must_use]
    pub fn with_progress(self, sender: ProgressSender) -> Self {
        Self {
            telemetry: self.telemetry.with_progress(sender),
            ..self
        }
    }

    /// Token that cancels this pipeline between stages.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run identifier stamped on logs and events.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.telemetry.run_id()
    }

    /// Settings the pipeline was built with.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Executes one run.
    pub fn run(&self) -> Result<PipelineRun, PipelineError> {
        let started_at = Utc::now();
        let run_id = self.run_id();
        let simple = run_id.simple().to_string();
        let run_dir_name = format!(
            "{}_{}",
            started_at.format("%Y%m%d_%H%M%S"),
            &simple[..8]
        );
        let stages = self.config.stage_configs(&run_dir_name);
        let mut completed = Vec::with_capacity(Stage::ALL.len());
        let _ = self.telemetry.log(
            LogLevel::Info,
            "Entered the run_pipeline method of TrainPipeline class",
            json!({ "run_id": run_id, "artifact_dir": stages.artifact_dir }),
        );
        self.emit(
            "pipeline.run.started",
            json!({ "artifact_dir": stages.artifact_dir }),
        );

        let ingestion = self.stage(Stage::DataIngestion, &mut completed, || {
            DataIngestion::new(stages.ingestion.clone(), &self.telemetry)
                .initiate(self.documents.as_ref())
        })?;

        let validation = self.stage(Stage::DataValidation, &mut completed, || {
            DataValidation::new(stages.validation.clone(), ingestion.clone(), &self.telemetry)?
                .initiate()
        })?;
        if let GateOutcome::Rejected(reason) = validation.gate() {
            self.gate_rejected(Stage::DataValidation, &reason);
            return Ok(self.finish(
                run_id,
                stages.artifact_dir,
                started_at,
                completed,
                PipelineOutcome::ValidationRejected {
                    reason,
                    report_path: validation.validation_report_file_path,
                },
            ));
        }

        let transformation = self.stage(Stage::DataTransformation, &mut completed, || {
            DataTransformation::new(
                stages.transformation.clone(),
                ingestion.clone(),
                validation.clone(),
                &self.telemetry,
            )
            .initiate()
        })?;

        let trainer = self.stage(Stage::ModelTrainer, &mut completed, || {
            ModelTrainer::new(stages.trainer.clone(), transformation.clone(), &self.telemetry)
                .initiate()
        })?;

        let evaluation = self.stage(Stage::ModelEvaluation, &mut completed, || {
            ModelEvaluation::new(
                stages.evaluation.clone(),
                ingestion.clone(),
                trainer.clone(),
                &self.telemetry,
            )
            .initiate(self.objects.as_ref())
        })?;
        if let GateOutcome::Rejected(reason) = evaluation.gate() {
            self.gate_rejected(Stage::ModelEvaluation, &reason);
            return Ok(self.finish(
                run_id,
                stages.artifact_dir,
                started_at,
                completed,
                PipelineOutcome::PromotionRejected { reason, evaluation },
            ));
        }

        let pusher = self.stage(Stage::ModelPusher, &mut completed, || {
            ModelPusher::new(stages.pusher.clone(), evaluation.clone(), &self.telemetry)
                .initiate(self.objects.as_ref())
        })?;

        Ok(self.finish(
            run_id,
            stages.artifact_dir,
            started_at,
            completed,
            PipelineOutcome::Pushed { evaluation, pusher },
        ))
    }

    #[track_caller]
    fn stage<T: Serialize>(
        &self,
        stage: Stage,
        completed: &mut Vec<Stage>,
        body: impl FnOnce() -> anyhow::Result<T>,
    ) -> Result<T, PipelineError> {
        if self.cancel.is_cancelled() {
            let err = PipelineError::Cancelled(stage);
            self.telemetry.warn(&err.to_string());
            self.emit("pipeline.run.failed", json!({ "stage": stage, "cancelled": true }));
            return Err(err);
        }
        self.emit("pipeline.stage.started", json!({ "stage": stage }));
        match body() {
            Ok(artifact) => {
                completed.push(stage);
                let payload = serde_json::to_value(&artifact).unwrap_or(Value::Null);
                self.emit(
                    "pipeline.stage.completed",
                    json!({ "stage": stage, "artifact": payload }),
                );
                Ok(artifact)
            }
            Err(source) => {
                let err = PipelineError::stage(stage, source);
                let _ = self.telemetry.log(
                    LogLevel::Error,
                    &err.to_string(),
                    json!({ "stage": stage }),
                );
                self.emit(
                    "pipeline.run.failed",
                    json!({ "stage": stage, "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    fn gate_rejected(&self, stage: Stage, reason: &str) {
        let _ = self.telemetry.log(
            LogLevel::Warn,
            &format!("{stage} gate rejected the run: {reason}"),
            json!({ "stage": stage }),
        );
        self.emit(
            "pipeline.gate.rejected",
            json!({ "stage": stage, "reason": reason }),
        );
    }

    fn finish(
        &self,
        run_id: Uuid,
        artifact_dir: PathBuf,
        started_at: DateTime<Utc>,
        stages_completed: Vec<Stage>,
        outcome: PipelineOutcome,
    ) -> PipelineRun {
        let run = PipelineRun {
            run_id,
            artifact_dir,
            started_at,
            finished_at: Utc::now(),
            stages_completed,
            outcome,
        };
        let _ = self.telemetry.log(
            LogLevel::Info,
            &format!("Pipeline run finished: {}", run.outcome.label()),
            json!({ "outcome": run.outcome.label() }),
        );
        self.emit(
            "pipeline.run.completed",
            json!({ "outcome": run.outcome.label() }),
        );
        run
    }

    fn emit(&self, event_type: &str, payload: Value) {
        if let Err(err) = self.telemetry.event(event_type, payload) {
            self.telemetry
                .warn(&format!("failed to publish {event_type}: {err}"));
        }
    }
}
