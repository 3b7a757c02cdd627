use std::{fmt, panic::Location};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Document store snapshot and train/test split.
    DataIngestion,
    /// Schema conformance gate.
    DataValidation,
    /// Encoding, scaling and resampling.
    DataTransformation,
    /// Classifier fit and baseline check.
    ModelTrainer,
    /// Candidate vs incumbent comparison.
    ModelEvaluation,
    /// Upload of the accepted bundle.
    ModelPusher,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ALL: [Self; 6] = [
        Self::DataIngestion,
        Self::DataValidation,
        Self::DataTransformation,
        Self::ModelTrainer,
        Self::ModelEvaluation,
        Self::ModelPusher,
    ];

    /// Stable snake-case name, also used as the artifact sub-directory.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::DataIngestion => "data_ingestion",
            Self::DataValidation => "data_validation",
            Self::DataTransformation => "data_transformation",
            Self::ModelTrainer => "model_trainer",
            Self::ModelEvaluation => "model_evaluation",
            Self::ModelPusher => "model_pusher",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Structural failure that aborts a pipeline run.
///
/// Gate outcomes (validation rejected, promotion declined) are never reported
/// through this type.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stage raised. The location is where the orchestrator invoked the
    /// stage, not where inside the stage the failure originated; `source`
    /// carries that context.
    #[error("error in {stage} at stage boundary {boundary_file}:{boundary_line} - {source:#}")]
    Stage {
        /// Failing stage.
        stage: Stage,
        /// Source file of the call that ran the stage.
        boundary_file: &'static str,
        /// Line of the call that ran the stage.
        boundary_line: u32,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },
    /// Cancellation was requested before the named stage started.
    #[error("pipeline run cancelled before {0}")]
    Cancelled(Stage),
    /// The background worker running the pipeline panicked or was aborted.
    #[error("pipeline worker terminated abnormally: {0}")]
    Worker(String),
}

impl PipelineError {
    /// Wraps a stage failure, recording the caller's file and line as the
    /// stage boundary.
    #[track_caller]
    pub fn stage(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        let location = Location::caller();
        Self::Stage {
            stage,
            boundary_file: location.file(),
            boundary_line: location.line(),
            source: source.into(),
        }
    }

    /// Stage the failure is attributed to, if any.
    #[must_use]
    pub const fn failed_stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } | Self::Cancelled(stage) => Some(*stage),
            Self::Worker(_) => None,
        }
    }
}
