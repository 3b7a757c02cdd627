/// Feature-matrix persistence and label column helpers.
#[path = "arrays.rs"]
pub mod arrays;

/// Binary classification metrics.
#[path = "metrics.rs"]
pub mod metrics;

/// Random-forest classifier.
#[path = "forest.rs"]
pub mod forest;

/// k-d tree nearest-neighbour index over feature-matrix rows.
#[path = "neighbors.rs"]
pub mod neighbors;

/// SMOTE oversampling followed by edited-nearest-neighbours cleaning.
#[path = "resample.rs"]
pub mod resample;

/// Fitted raw-table to feature-matrix transformer.
#[path = "transformer.rs"]
pub mod transformer;

/// Versioned envelope of transformer and classifier.
#[path = "bundle.rs"]
pub mod bundle;

pub use bundle::{BundleError, ModelBundle};
pub use forest::{ForestParams, RandomForest, SplitCriterion, TrainingError};
pub use resample::SmoteEnn;
pub use transformer::{FeatureTransformer, TransformError};
