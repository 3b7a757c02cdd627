//! Fixtures shared by unit tests.

use std::{
    fs,
    path::{Path, PathBuf},
};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde_json::{json, Value};

use crate::{
    artifact::{DataIngestionArtifact, ModelTrainerArtifact},
    components::{DataIngestion, DataTransformation, DataValidation, ModelTrainer},
    config::{PipelineConfig, StageConfigs},
    storage::{Document, MemoryDocumentStore},
    telemetry::PipelineTelemetry,
};

pub const COLLECTION: &str = "vehicle-records";

pub const SCHEMA_TOML: &str = r#"
target_column = "Response"
columns = [
    { name = "id", dtype = "int" },
    { name = "Gender", dtype = "category" },
    { name = "Age", dtype = "int" },
    { name = "Driving_License", dtype = "int" },
    { name = "Region_Code", dtype = "float" },
    { name = "Previously_Insured", dtype = "int" },
    { name = "Vehicle_Age", dtype = "category" },
    { name = "Vehicle_Damage", dtype = "category" },
    { name = "Annual_Premium", dtype = "float" },
    { name = "Policy_Sales_Channel", dtype = "float" },
    { name = "Vintage", dtype = "int" },
    { name = "Response", dtype = "int" },
]
categorical_columns = ["Gender", "Vehicle_Age", "Vehicle_Damage"]
numerical_columns = [
    "id", "Age", "Driving_License", "Region_Code", "Previously_Insured",
    "Annual_Premium", "Policy_Sales_Channel", "Vintage",
]
standard_scale_columns = ["Age", "Vintage"]
min_max_columns = ["Annual_Premium"]
drop_columns = ["id"]

[binary_mapping]
column = "Gender"
values = { Female = 0, Male = 1 }

[rename_columns]
"Vehicle_Age_< 1 Year" = "Vehicle_Age_lt_1_Year"
"Vehicle_Age_> 2 Years" = "Vehicle_Age_gt_2_Years"
"#;

pub fn write_schema(dir: &Path) -> PathBuf {
    let path = dir.join("schema.toml");
    fs::write(&path, SCHEMA_TOML).unwrap();
    path
}

/// Deterministic records where the label is recoverable from the features.
/// Roughly a third of the rows are positive.
pub fn synthetic_records(count: usize, seed: u64) -> Vec<Document> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..count)
        .map(|idx| {
            let positive = idx % 3 == 0;
            let gender = if rng.gen_bool(0.5) { "Male" } else { "Female" };
            let vehicle_age = if rng.gen_bool(0.5) {
                "1-2 Year"
            } else {
                "> 2 Years"
            };
            let record = if positive {
                json!({
                    "_id": format!("oid-{idx}"),
                    "id": idx + 1,
                    "Gender": gender,
                    "Age": rng.gen_range(40..50),
                    "Driving_License": 1,
                    "Region_Code": 28.0,
                    "Previously_Insured": 0,
                    "Vehicle_Age": vehicle_age,
                    "Vehicle_Damage": "Yes",
                    "Annual_Premium": rng.gen_range(30_000.0..40_000.0),
                    "Policy_Sales_Channel": 26.0,
                    "Vintage": rng.gen_range(200..260),
                    "Response": 1,
                })
            } else {
                json!({
                    "_id": format!("oid-{idx}"),
                    "id": idx + 1,
                    "Gender": gender,
                    "Age": rng.gen_range(20..30),
                    "Driving_License": 1,
                    "Region_Code": 8.0,
                    "Previously_Insured": 1,
                    "Vehicle_Age": "< 1 Year",
                    "Vehicle_Damage": "No",
                    "Annual_Premium": rng.gen_range(2_630.0..12_000.0),
                    "Policy_Sales_Channel": 152.0,
                    "Vintage": rng.gen_range(20..80),
                    "Response": 0,
                })
            };
            match record {
                Value::Object(map) => map,
                _ => unreachable!(),
            }
        })
        .collect()
}

/// Small, fast configuration rooted in `dir`.
pub fn test_config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.artifact_root = dir.join("artifact");
    config.schema_path = write_schema(dir);
    config.log_dir = dir.join("logs");
    config.ingestion.collection_name = COLLECTION.into();
    config.ingestion.test_ratio = 0.4;
    config.ingestion.split_seed = Some(7);
    config.trainer.n_estimators = 15;
    config.trainer.max_depth = Some(6);
    config.trainer.min_samples_split = 4;
    config.trainer.min_samples_leaf = 2;
    config.storage.document_root = dir.join("documents");
    config.storage.object_root = dir.join("objects");
    config
}

/// Artifacts of a run stopped after training.
pub struct TrainedRun {
    pub stages: StageConfigs,
    pub ingestion: DataIngestionArtifact,
    pub trainer: ModelTrainerArtifact,
}

/// Runs ingestion through training on synthetic data under `dir`.
pub fn trained_run(dir: &Path) -> TrainedRun {
    let stages = test_config(dir).stage_configs("run");
    let telemetry = PipelineTelemetry::disabled();
    let store = MemoryDocumentStore::new();
    store.insert_many(COLLECTION, synthetic_records(90, 21));
    let ingestion = DataIngestion::new(stages.ingestion.clone(), &telemetry)
        .initiate(&store)
        .unwrap();
    let validation = DataValidation::new(stages.validation.clone(), ingestion.clone(), &telemetry)
        .unwrap()
        .initiate()
        .unwrap();
    let transformation = DataTransformation::new(
        stages.transformation.clone(),
        ingestion.clone(),
        validation,
        &telemetry,
    )
    .initiate()
    .unwrap();
    let trainer = ModelTrainer::new(stages.trainer.clone(), transformation, &telemetry)
        .initiate()
        .unwrap();
    TrainedRun {
        stages,
        ingestion,
        trainer,
    }
}
