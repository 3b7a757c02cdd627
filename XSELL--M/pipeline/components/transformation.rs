use anyhow::Result;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    artifact::{DataIngestionArtifact, DataTransformationArtifact, DataValidationArtifact},
    config::DataTransformationConfig,
    error::Stage,
    estimator::{
        arrays::{append_label, save_array},
        FeatureTransformer, SmoteEnn, TransformError,
    },
    schema::Schema,
    table::Table,
    telemetry::PipelineTelemetry,
};

/// Fits the feature transformer on the training partition and produces the
/// numeric arrays consumed by the trainer.
#[derive(Debug)]
pub struct DataTransformation {
    config: DataTransformationConfig,
    ingestion: DataIngestionArtifact,
    validation: DataValidationArtifact,
    telemetry: PipelineTelemetry,
}

impl DataTransformation {
    /// Creates the stage.
    #[must_use]
    pub fn new(
        config: DataTransformationConfig,
        ingestion: DataIngestionArtifact,
        validation: DataValidationArtifact,
        telemetry: &PipelineTelemetry,
    ) -> Self {
        Self {
            config,
            ingestion,
            validation,
            telemetry: telemetry.for_module(Stage::DataTransformation.name()),
        }
    }

    /// Runs the stage. The test partition is transformed with the statistics
    /// learnt on the training partition and is never resampled.
    pub fn initiate(&self) -> Result<DataTransformationArtifact> {
        self.telemetry.info("Data Transformation Started !!!");
        if !self.validation.validation_status {
            return Err(TransformError::ValidationNotPassed(self.validation.message.join("; ")).into());
        }
        let schema = Schema::load(&self.config.schema_path)?;
        let train = Table::read_csv(&self.ingestion.trained_file_path)?;
        let test = Table::read_csv(&self.ingestion.test_file_path)?;
        self.telemetry.info("Train-Test data loaded");

        let transformer = FeatureTransformer::fit(&schema, &train)?;
        let train_features = transformer.transform(&train)?;
        let train_labels = transformer.target_labels(&train)?;
        let test_features = transformer.transform(&test)?;
        let test_labels = transformer.target_labels(&test)?;
        self.telemetry
            .info("Transformation done end to end to train-test df.");

        let (train_features, train_labels) = if self.config.resample {
            let resampler = SmoteEnn {
                smote_neighbors: self.config.smote_neighbors,
                enn_neighbors: self.config.enn_neighbors,
                seed: self.config.resample_seed,
            };
            let before = train_labels.len();
            let resampled = resampler.fit_resample(&train_features, &train_labels)?;
            let _ = self.telemetry.log(
                LogLevel::Info,
                "Applied SMOTEENN to the training partition",
                json!({ "rows_before": before, "rows_after": resampled.1.len() }),
            );
            resampled
        } else {
            (train_features, train_labels)
        };

        let train_array = append_label(&train_features, &train_labels)?;
        let test_array = append_label(&test_features, &test_labels)?;
        transformer.save(&self.config.transformed_object_file_path)?;
        save_array(&self.config.transformed_train_file_path, &train_array)?;
        save_array(&self.config.transformed_test_file_path, &test_array)?;
        let _ = self.telemetry.log(
            LogLevel::Info,
            "Saving transformation object and transformed files.",
            json!({
                "features": transformer.feature_names(),
                "train_rows": train_array.nrows(),
                "test_rows": test_array.nrows(),
            }),
        );
        Ok(DataTransformationArtifact {
            transformed_object_file_path: self.config.transformed_object_file_path.clone(),
            transformed_train_file_path: self.config.transformed_train_file_path.clone(),
            transformed_test_file_path: self.config.transformed_test_file_path.clone(),
        })
    }
}
