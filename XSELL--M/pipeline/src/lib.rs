#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Vehicle-insurance cross-sell pipeline: ingestion, validation, transformation,
//! training, evaluation against the deployed model, and promotion.

/// Stage identifiers and structural failures.
#[path = "../error.rs"]
pub mod error;

/// Immutable records handed from one stage to the next.
#[path = "../artifact.rs"]
pub mod artifact;

/// Pipeline settings and per-run stage configuration.
#[path = "../config.rs"]
pub mod config;

/// Declarative dataset schema.
#[path = "../schema.rs"]
pub mod schema;

/// In-memory tabular data with CSV persistence.
#[path = "../table.rs"]
pub mod table;

/// Document-store and object-store collaborators.
#[path = "../storage/main.rs"]
pub mod storage;

/// Feature transformer, classifier, resampling, metrics and model bundle.
#[path = "../estimator/main.rs"]
pub mod estimator;

/// The six pipeline stages.
#[path = "../components/main.rs"]
pub mod components;

/// Telemetry fan-out to log file, event bus and progress stream.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Training pipeline orchestrator.
#[path = "../training_pipeline.rs"]
pub mod training_pipeline;

/// Single-record inference path.
#[path = "../prediction.rs"]
pub mod prediction;

/// Progress channel between a background run and an interactive consumer.
#[path = "../progress.rs"]
pub mod progress;

#[cfg(test)]
#[path = "../test_support.rs"]
pub(crate) mod test_support;

pub use artifact::{
    ClassificationMetricArtifact, DataIngestionArtifact, DataTransformationArtifact,
    DataValidationArtifact, EvaluateModelResponse, GateOutcome, ModelEvaluationArtifact,
    ModelPusherArtifact, ModelTrainerArtifact, ValidationReport,
};
pub use config::PipelineConfig;
pub use error::{PipelineError, Stage};
pub use estimator::bundle::ModelBundle;
pub use prediction::{PredictionPipeline, PredictionResponse, VehicleCategories, VehicleData};
pub use progress::{ProgressMessage, ProgressStream};
pub use schema::Schema;
pub use storage::{
    DocumentStore, FsObjectStore, JsonlDocumentStore, MemoryDocumentStore, MemoryObjectStore,
    ObjectStore, StorageError,
};
pub use table::Table;
pub use telemetry::{PipelineTelemetry, PipelineTelemetryBuilder};
pub use training_pipeline::{CancelToken, PipelineOutcome, PipelineRun, TrainingPipeline};
