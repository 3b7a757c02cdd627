use anyhow::{Context, Result};
use ndarray::{Array1, Array2};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    artifact::{DataTransformationArtifact, ModelTrainerArtifact},
    config::ModelTrainerConfig,
    error::Stage,
    estimator::{
        arrays::{load_array, split_label},
        forest::binary_labels,
        metrics::{accuracy, classification_metrics},
        FeatureTransformer, ForestParams, ModelBundle, RandomForest, TrainingError,
    },
    telemetry::PipelineTelemetry,
};

/// Fits the classifier, checks it against the accuracy floor and writes the
/// model bundle.
#[derive(Debug)]
pub struct ModelTrainer {
    config: ModelTrainerConfig,
    transformation: DataTransformationArtifact,
    telemetry: PipelineTelemetry,
}

impl ModelTrainer {
    /// Creates the stage.
    #[must_use]
    pub fn new(
        config: ModelTrainerConfig,
        transformation: DataTransformationArtifact,
        telemetry: &PipelineTelemetry,
    ) -> Self {
        Self {
            config,
            transformation,
            telemetry: telemetry.for_module(Stage::ModelTrainer.name()),
        }
    }

    fn params(&self) -> ForestParams {
        ForestParams {
            n_estimators: self.config.n_estimators,
            min_samples_split: self.config.min_samples_split,
            min_samples_leaf: self.config.min_samples_leaf,
            max_depth: self.config.max_depth,
            criterion: self.config.criterion,
            random_state: self.config.random_state,
        }
    }

    /// Fits the forest and enforces the training-accuracy floor.
    ///
    /// A label vector holding a single class cannot yield a meaningful model
    /// and fails the same way.
    pub fn fit(
        &self,
        features: &Array2<f64>,
        labels: &Array1<f64>,
    ) -> Result<(RandomForest, f64), TrainingError> {
        let classes = binary_labels(labels)?;
        if let Some(first) = classes.first() {
            if classes.iter().all(|class| class == first) {
                return Err(TrainingError::DegenerateLabels(*first));
            }
        }
        let model = RandomForest::fit(&self.params(), features, labels)?;
        let training_accuracy = accuracy(&classes, &model.predict(features)?);
        if training_accuracy < self.config.expected_accuracy {
            return Err(TrainingError::BaselineNotMet {
                accuracy: training_accuracy,
                expected: self.config.expected_accuracy,
            });
        }
        Ok((model, training_accuracy))
    }

    /// Runs the stage.
    pub fn initiate(&self) -> Result<ModelTrainerArtifact> {
        self.telemetry
            .info("Entered initiate_model_trainer method of ModelTrainer class");
        let train = load_array(&self.transformation.transformed_train_file_path)?;
        let test = load_array(&self.transformation.transformed_test_file_path)?;
        let (train_features, train_labels) = split_label(&train)?;
        let (test_features, test_labels) = split_label(&test)?;
        self.telemetry
            .info("train-test data loaded, training RandomForestClassifier");

        let (model, training_accuracy) = self.fit(&train_features, &train_labels)?;
        let predicted = model.predict(&test_features)?;
        let metric_artifact = classification_metrics(&binary_labels(&test_labels)?, &predicted);
        let _ = self.telemetry.log(
            LogLevel::Info,
            "Model trained and evaluated on the test partition",
            json!({
                "training_accuracy": training_accuracy,
                "accuracy": metric_artifact.accuracy,
                "f1_score": metric_artifact.f1_score,
                "precision_score": metric_artifact.precision_score,
                "recall_score": metric_artifact.recall_score,
            }),
        );

        let transformer = FeatureTransformer::load(&self.transformation.transformed_object_file_path)?;
        let bundle = ModelBundle::new(transformer, model)?;
        bundle
            .save(&self.config.trained_model_file_path)
            .with_context(|| {
                format!(
                    "saving model bundle to {}",
                    self.config.trained_model_file_path.display()
                )
            })?;
        self.telemetry
            .info("Saved final model object that includes both preprocessing and the trained model");
        Ok(ModelTrainerArtifact {
            trained_model_file_path: self.config.trained_model_file_path.clone(),
            metric_artifact,
            training_accuracy,
        })
    }
}
