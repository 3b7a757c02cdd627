/// Document-store snapshot and train/test split.
#[path = "ingestion.rs"]
pub mod ingestion;

/// Schema conformance gate.
#[path = "validation.rs"]
pub mod validation;

/// Encoding, scaling and resampling.
#[path = "transformation.rs"]
pub mod transformation;

/// Classifier fit and baseline check.
#[path = "trainer.rs"]
pub mod trainer;

/// Candidate vs incumbent comparison.
#[path = "evaluation.rs"]
pub mod evaluation;

/// Publication of an accepted bundle.
#[path = "pusher.rs"]
pub mod pusher;

pub use evaluation::ModelEvaluation;
pub use ingestion::DataIngestion;
pub use pusher::ModelPusher;
pub use trainer::ModelTrainer;
pub use transformation::DataTransformation;
pub use validation::DataValidation;
