use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{error::Stage, estimator::forest::SplitCriterion};

/// Overrides the document store root.
pub const DOCUMENT_ROOT_ENV: &str = "XSELL_DOCUMENT_ROOT";
/// Overrides the object store root.
pub const OBJECT_ROOT_ENV: &str = "XSELL_OBJECT_ROOT";
/// Overrides the schema file.
pub const SCHEMA_PATH_ENV: &str = "XSELL_SCHEMA_PATH";

/// Top-level pipeline settings, usually loaded from `pipeline.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root under which each run creates a timestamped artifact directory.
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,
    /// Schema document describing the raw collection.
    #[serde(default = "default_schema_path")]
    pub schema_path: PathBuf,
    /// Directory for JSON-lines run logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Ingestion settings.
    #[serde(default)]
    pub ingestion: IngestionSettings,
    /// Transformation settings.
    #[serde(default)]
    pub transformation: TransformationSettings,
    /// Classifier settings.
    #[serde(default)]
    pub trainer: TrainerSettings,
    /// Promotion settings.
    #[serde(default)]
    pub evaluation: EvaluationSettings,
    /// Collaborator locations.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Progress stream settings.
    #[serde(default)]
    pub progress: ProgressSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            artifact_root: default_artifact_root(),
            schema_path: default_schema_path(),
            log_dir: default_log_dir(),
            ingestion: IngestionSettings::default(),
            transformation: TransformationSettings::default(),
            trainer: TrainerSettings::default(),
            evaluation: EvaluationSettings::default(),
            storage: StorageSettings::default(),
            progress: ProgressSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from a TOML file, resolves relative paths against the
    /// file's directory and applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config {}", path.display()))?;
        let mut config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.resolve_relative_to(&source_dir);
        config.apply_overrides(|key| std::env::var(key).ok());
        config.check()?;
        Ok(config)
    }

    /// Replaces collaborator locations with values returned by `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup(DOCUMENT_ROOT_ENV) {
            self.storage.document_root = PathBuf::from(root);
        }
        if let Some(root) = lookup(OBJECT_ROOT_ENV) {
            self.storage.object_root = PathBuf::from(root);
        }
        if let Some(schema) = lookup(SCHEMA_PATH_ENV) {
            self.schema_path = PathBuf::from(schema);
        }
    }

    /// Rejects settings no run could succeed with.
    pub fn check(&self) -> Result<()> {
        let ratio = self.ingestion.test_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            bail!("ingestion.test_ratio must be in (0, 1), got {ratio}");
        }
        if self.trainer.n_estimators == 0 {
            bail!("trainer.n_estimators must be positive");
        }
        if self.trainer.min_samples_split < 2 {
            bail!("trainer.min_samples_split must be at least 2");
        }
        if self.trainer.min_samples_leaf == 0 {
            bail!("trainer.min_samples_leaf must be positive");
        }
        if !(0.0..=1.0).contains(&self.trainer.expected_accuracy) {
            bail!("trainer.expected_accuracy must be in [0, 1]");
        }
        if self.evaluation.changed_threshold_score < 0.0 {
            bail!("evaluation.changed_threshold_score must not be negative");
        }
        if self.storage.bucket_name.trim().is_empty() || self.storage.model_key.trim().is_empty() {
            bail!("storage.bucket_name and storage.model_key are required");
        }
        Ok(())
    }

    /// Derives the immutable per-stage configuration for one run.
    #[must_use]
    pub fn stage_configs(&self, run_dir_name: &str) -> StageConfigs {
        let layout = ArtifactLayout::new(self.artifact_root.join(run_dir_name));
        StageConfigs {
            ingestion: DataIngestionConfig {
                collection_name: self.ingestion.collection_name.clone(),
                test_ratio: self.ingestion.test_ratio,
                split_seed: self.ingestion.split_seed,
                feature_store_file_path: layout.feature_store_file(),
                training_file_path: layout.train_file(),
                testing_file_path: layout.test_file(),
            },
            validation: DataValidationConfig {
                schema_path: self.schema_path.clone(),
                validation_report_file_path: layout.validation_report_file(),
            },
            transformation: DataTransformationConfig {
                schema_path: self.schema_path.clone(),
                resample: self.transformation.resample,
                smote_neighbors: self.transformation.smote_neighbors,
                enn_neighbors: self.transformation.enn_neighbors,
                resample_seed: self.transformation.resample_seed,
                transformed_object_file_path: layout.transformed_object_file(),
                transformed_train_file_path: layout.transformed_train_file(),
                transformed_test_file_path: layout.transformed_test_file(),
            },
            trainer: ModelTrainerConfig {
                n_estimators: self.trainer.n_estimators,
                min_samples_split: self.trainer.min_samples_split,
                min_samples_leaf: self.trainer.min_samples_leaf,
                max_depth: self.trainer.max_depth,
                criterion: self.trainer.criterion,
                random_state: self.trainer.random_state,
                expected_accuracy: self.trainer.expected_accuracy,
                trained_model_file_path: layout.trained_model_file(),
            },
            evaluation: ModelEvaluationConfig {
                changed_threshold_score: self.evaluation.changed_threshold_score,
                bucket_name: self.storage.bucket_name.clone(),
                model_key: self.storage.model_key.clone(),
            },
            pusher: ModelPusherConfig {
                bucket_name: self.storage.bucket_name.clone(),
                model_key: self.storage.model_key.clone(),
            },
            artifact_dir: layout.root,
        }
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        for path in [
            &mut self.artifact_root,
            &mut self.schema_path,
            &mut self.log_dir,
            &mut self.storage.document_root,
            &mut self.storage.object_root,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

/// `[ingestion]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionSettings {
    /// Document-store collection holding the raw records.
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    /// Fraction of rows assigned to the test partition.
    #[serde(default = "default_test_ratio")]
    pub test_ratio: f64,
    /// Seed for the split shuffle; entropy when absent.
    #[serde(default)]
    pub split_seed: Option<u64>,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            collection_name: default_collection_name(),
            test_ratio: default_test_ratio(),
            split_seed: None,
        }
    }
}

/// `[transformation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformationSettings {
    /// Whether SMOTEENN is applied to the training partition.
    #[serde(default = "default_true")]
    pub resample: bool,
    /// Neighbours used to synthesise minority samples.
    #[serde(default = "default_smote_neighbors")]
    pub smote_neighbors: usize,
    /// Neighbours used by the edited-nearest-neighbours cleaning pass.
    #[serde(default = "default_enn_neighbors")]
    pub enn_neighbors: usize,
    /// Seed for synthetic sample generation; entropy when absent.
    #[serde(default = "default_resample_seed")]
    pub resample_seed: Option<u64>,
}

impl Default for TransformationSettings {
    fn default() -> Self {
        Self {
            resample: true,
            smote_neighbors: default_smote_neighbors(),
            enn_neighbors: default_enn_neighbors(),
            resample_seed: default_resample_seed(),
        }
    }
}

/// `[trainer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerSettings {
    /// Number of trees.
    #[serde(default = "default_n_estimators")]
    pub n_estimators: usize,
    /// Minimum samples required to split a node.
    #[serde(default = "default_min_samples_split")]
    pub min_samples_split: usize,
    /// Minimum samples required in each leaf.
    #[serde(default = "default_min_samples_leaf")]
    pub min_samples_leaf: usize,
    /// Maximum tree depth; unbounded when absent.
    #[serde(default = "default_max_depth")]
    pub max_depth: Option<usize>,
    /// Impurity measure.
    #[serde(default = "default_criterion")]
    pub criterion: SplitCriterion,
    /// Seed for bootstrap and feature sampling.
    #[serde(default = "default_random_state")]
    pub random_state: u64,
    /// Training-set accuracy floor below which the fit is rejected.
    #[serde(default = "default_expected_accuracy")]
    pub expected_accuracy: f64,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            n_estimators: default_n_estimators(),
            min_samples_split: default_min_samples_split(),
            min_samples_leaf: default_min_samples_leaf(),
            max_depth: default_max_depth(),
            criterion: default_criterion(),
            random_state: default_random_state(),
            expected_accuracy: default_expected_accuracy(),
        }
    }
}

/// `[evaluation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSettings {
    /// Margin a candidate's F1 must exceed over the incumbent's.
    #[serde(default = "default_threshold")]
    pub changed_threshold_score: f64,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            changed_threshold_score: default_threshold(),
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory of `<collection>.jsonl` files.
    #[serde(default = "default_document_root")]
    pub document_root: PathBuf,
    /// Directory holding one sub-directory per bucket.
    #[serde(default = "default_object_root")]
    pub object_root: PathBuf,
    /// Bucket of the deployed model.
    #[serde(default = "default_bucket_name")]
    pub bucket_name: String,
    /// Key of the deployed model.
    #[serde(default = "default_model_key")]
    pub model_key: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            document_root: default_document_root(),
            object_root: default_object_root(),
            bucket_name: default_bucket_name(),
            model_key: default_model_key(),
        }
    }
}

/// `[progress]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSettings {
    /// Bound on waiting for the worker after the completion marker.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl ProgressSettings {
    /// Join timeout as a duration.
    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Per-stage configuration for one run.
#[derive(Debug, Clone)]
pub struct StageConfigs {
    /// Timestamped artifact directory of the run.
    pub artifact_dir: PathBuf,
    /// Ingestion.
    pub ingestion: DataIngestionConfig,
    /// Validation.
    pub validation: DataValidationConfig,
    /// Transformation.
    pub transformation: DataTransformationConfig,
    /// Training.
    pub trainer: ModelTrainerConfig,
    /// Evaluation.
    pub evaluation: ModelEvaluationConfig,
    /// Pusher.
    pub pusher: ModelPusherConfig,
}

/// Ingestion stage configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DataIngestionConfig {
    /// Source collection.
    pub collection_name: String,
    /// Test partition fraction.
    pub test_ratio: f64,
    /// Optional split seed.
    pub split_seed: Option<u64>,
    /// Snapshot destination.
    pub feature_store_file_path: PathBuf,
    /// Training partition destination.
    pub training_file_path: PathBuf,
    /// Test partition destination.
    pub testing_file_path: PathBuf,
}

/// Validation stage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataValidationConfig {
    /// Schema document.
    pub schema_path: PathBuf,
    /// Report destination.
    pub validation_report_file_path: PathBuf,
}

/// Transformation stage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTransformationConfig {
    /// Schema document.
    pub schema_path: PathBuf,
    /// Whether SMOTEENN runs on the training partition.
    pub resample: bool,
    /// SMOTE neighbour count.
    pub smote_neighbors: usize,
    /// ENN neighbour count.
    pub enn_neighbors: usize,
    /// Resampling seed.
    pub resample_seed: Option<u64>,
    /// Transformer destination.
    pub transformed_object_file_path: PathBuf,
    /// Training array destination.
    pub transformed_train_file_path: PathBuf,
    /// Test array destination.
    pub transformed_test_file_path: PathBuf,
}

/// Training stage configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTrainerConfig {
    /// Number of trees.
    pub n_estimators: usize,
    /// Minimum samples to split.
    pub min_samples_split: usize,
    /// Minimum samples per leaf.
    pub min_samples_leaf: usize,
    /// Maximum depth.
    pub max_depth: Option<usize>,
    /// Impurity measure.
    pub criterion: SplitCriterion,
    /// Seed.
    pub random_state: u64,
    /// Training accuracy floor.
    pub expected_accuracy: f64,
    /// Bundle destination.
    pub trained_model_file_path: PathBuf,
}

/// Evaluation stage configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEvaluationConfig {
    /// Promotion margin.
    pub changed_threshold_score: f64,
    /// Bucket of the incumbent.
    pub bucket_name: String,
    /// Key of the incumbent.
    pub model_key: String,
}

/// Pusher stage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPusherConfig {
    /// Destination bucket.
    pub bucket_name: String,
    /// Destination key.
    pub model_key: String,
}

struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    const fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.name())
    }

    fn feature_store_file(&self) -> PathBuf {
        self.stage_dir(Stage::DataIngestion)
            .join("feature_store")
            .join("data.csv")
    }

    fn train_file(&self) -> PathBuf {
        self.stage_dir(Stage::DataIngestion)
            .join("ingested")
            .join("train.csv")
    }

    fn test_file(&self) -> PathBuf {
        self.stage_dir(Stage::DataIngestion)
            .join("ingested")
            .join("test.csv")
    }

    fn validation_report_file(&self) -> PathBuf {
        self.stage_dir(Stage::DataValidation).join("report.json")
    }

    fn transformed_train_file(&self) -> PathBuf {
        self.stage_dir(Stage::DataTransformation)
            .join("transformed")
            .join("train.json")
    }

    fn transformed_test_file(&self) -> PathBuf {
        self.stage_dir(Stage::DataTransformation)
            .join("transformed")
            .join("test.json")
    }

    fn transformed_object_file(&self) -> PathBuf {
        self.stage_dir(Stage::DataTransformation)
            .join("transformed_object")
            .join("preprocessing.json")
    }

    fn trained_model_file(&self) -> PathBuf {
        self.stage_dir(Stage::ModelTrainer)
            .join("trained_model")
            .join("model.json")
    }
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("artifact")
}

fn default_schema_path() -> PathBuf {
    PathBuf::from("schema.toml")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_collection_name() -> String {
    "Proj1-Data".into()
}

const fn default_test_ratio() -> f64 {
    0.25
}

const fn default_true() -> bool {
    true
}

const fn default_smote_neighbors() -> usize {
    5
}

const fn default_enn_neighbors() -> usize {
    3
}

const fn default_resample_seed() -> Option<u64> {
    Some(42)
}

const fn default_n_estimators() -> usize {
    200
}

const fn default_min_samples_split() -> usize {
    7
}

const fn default_min_samples_leaf() -> usize {
    6
}

const fn default_max_depth() -> Option<usize> {
    Some(10)
}

const fn default_criterion() -> SplitCriterion {
    SplitCriterion::Entropy
}

const fn default_random_state() -> u64 {
    101
}

const fn default_expected_accuracy() -> f64 {
    0.6
}

const fn default_threshold() -> f64 {
    0.02
}

fn default_document_root() -> PathBuf {
    PathBuf::from("data/documents")
}

fn default_object_root() -> PathBuf {
    PathBuf::from("data/objects")
}

fn default_bucket_name() -> String {
    "my-model-mlopsproj".into()
}

fn default_model_key() -> String {
    "model-registry/model.json".into()
}

const fn default_join_timeout_ms() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_partial_file_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        fs::write(
            &path,
            r#"
schema_path = "schema.toml"

[ingestion]
test_ratio = 0.4
split_seed = 7

[trainer]
n_estimators = 25
criterion = "gini"
"#,
        )
        .unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert!((config.ingestion.test_ratio - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.ingestion.split_seed, Some(7));
        assert_eq!(config.trainer.n_estimators, 25);
        assert_eq!(config.trainer.criterion, SplitCriterion::Gini);
        assert_eq!(config.trainer.min_samples_leaf, 6);
        assert_eq!(config.schema_path, dir.path().join("schema.toml"));
        assert!(config.artifact_root.starts_with(dir.path()));
    }

    #[test]
    fn rejects_out_of_range_ratio() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        fs::write(&path, "[ingestion]\ntest_ratio = 1.5\n").unwrap();
        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("test_ratio"));
    }

    #[test]
    fn overrides_replace_storage_roots() {
        let mut config = PipelineConfig::default();
        config.apply_overrides(|key| match key {
            OBJECT_ROOT_ENV => Some("/srv/objects".into()),
            _ => None,
        });
        assert_eq!(config.storage.object_root, PathBuf::from("/srv/objects"));
        assert_eq!(config.storage.document_root, default_document_root());
    }

    #[test]
    fn stage_paths_live_under_run_directory() {
        let config = PipelineConfig::default();
        let stages = config.stage_configs("20260101_000000");
        assert!(stages
            .ingestion
            .training_file_path
            .starts_with(stages.artifact_dir.join("data_ingestion")));
        assert!(stages
            .trainer
            .trained_model_file_path
            .ends_with("model_trainer/trained_model/model.json"));
        assert_eq!(stages.pusher.model_key, stages.evaluation.model_key);
    }

    #[test]
    fn shipped_configuration_is_valid() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("config");
        let config = PipelineConfig::load(root.join("pipeline.toml")).unwrap();
        assert_eq!(config.schema_path, root.join("schema.toml"));
        assert_eq!(config.progress.join_timeout(), Duration::from_secs(1));
        let schema = crate::schema::Schema::load(&config.schema_path).unwrap();
        assert_eq!(schema.target_column, "Response");
    }
}
