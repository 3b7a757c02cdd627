use std::fs;

use anyhow::{Context, Result};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    artifact::{DataIngestionArtifact, DataValidationArtifact},
    config::DataValidationConfig,
    error::Stage,
    schema::Schema,
    table::Table,
    telemetry::PipelineTelemetry,
};

/// Checks both partitions against the schema and records a report.
#[derive(Debug)]
pub struct DataValidation {
    config: DataValidationConfig,
    ingestion: DataIngestionArtifact,
    schema: Schema,
    telemetry: PipelineTelemetry,
}

impl DataValidation {
    /// Creates the stage, reading the schema.
    pub fn new(
        config: DataValidationConfig,
        ingestion: DataIngestionArtifact,
        telemetry: &PipelineTelemetry,
    ) -> Result<Self> {
        let schema = Schema::load(&config.schema_path)?;
        Ok(Self {
            config,
            ingestion,
            schema,
            telemetry: telemetry.for_module(Stage::DataValidation.name()),
        })
    }

    /// Every schema violation of `table`, each prefixed by `partition`.
    #[must_use]
    pub fn violations(&self, partition: &str, table: &Table) -> Vec<String> {
        let mut messages = Vec::new();
        let expected = self.schema.feature_column_count();
        let found = table
            .columns()
            .iter()
            .filter(|name| **name != self.schema.target_column)
            .count();
        if found != expected {
            messages.push(format!(
                "{partition}: expected {expected} columns, found {found}"
            ));
        }
        let missing_numerical = self
            .schema
            .numerical_columns
            .iter()
            .filter(|column| !table.has_column(column))
            .cloned()
            .collect::<Vec<_>>();
        if !missing_numerical.is_empty() {
            messages.push(format!(
                "{partition}: missing numerical columns: {}",
                missing_numerical.join(", ")
            ));
        }
        let missing_categorical = self
            .schema
            .categorical_columns
            .iter()
            .filter(|column| !table.has_column(column))
            .cloned()
            .collect::<Vec<_>>();
        if !missing_categorical.is_empty() {
            messages.push(format!(
                "{partition}: missing categorical columns: {}",
                missing_categorical.join(", ")
            ));
        }
        messages
    }

    /// Runs the stage. A failed check is reported in the artifact, not raised.
    pub fn initiate(&self) -> Result<DataValidationArtifact> {
        self.telemetry.info("Starting data validation");
        let train = Table::read_csv(&self.ingestion.trained_file_path)?;
        let test = Table::read_csv(&self.ingestion.test_file_path)?;
        let mut message = self.violations("train", &train);
        message.extend(self.violations("test", &test));

        let artifact = DataValidationArtifact {
            validation_status: message.is_empty(),
            message,
            validation_report_file_path: self.config.validation_report_file_path.clone(),
        };
        let path = &self.config.validation_report_file_path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(path, serde_json::to_vec_pretty(&artifact.report())?)
            .with_context(|| format!("writing {}", path.display()))?;

        let level = if artifact.validation_status {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let _ = self.telemetry.log(
            level,
            "Data validation completed",
            json!({
                "validation_status": artifact.validation_status,
                "violations": artifact.message.len(),
            }),
        );
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{artifact::ValidationReport, test_support};
    use tempfile::tempdir;

    fn write_partition(path: &std::path::Path, skip: &[&str]) {
        let table = Table::from_documents(&test_support::synthetic_records(12, 2));
        let keep = table
            .columns()
            .iter()
            .enumerate()
            .filter(|(_, name)| !skip.contains(&name.as_str()))
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();
        let columns = keep.iter().map(|idx| table.columns()[*idx].clone()).collect();
        let rows = table
            .rows()
            .iter()
            .map(|row| keep.iter().map(|idx| row[*idx].clone()).collect())
            .collect();
        Table::from_rows(columns, rows)
            .unwrap()
            .write_csv(path)
            .unwrap();
    }

    fn stage(dir: &std::path::Path, train_skip: &[&str], test_skip: &[&str]) -> DataValidation {
        let stages = test_support::test_config(dir).stage_configs("run");
        let ingestion = DataIngestionArtifact {
            feature_store_file_path: stages.ingestion.feature_store_file_path.clone(),
            trained_file_path: stages.ingestion.training_file_path.clone(),
            test_file_path: stages.ingestion.testing_file_path.clone(),
            train_rows: 12,
            test_rows: 12,
        };
        write_partition(&ingestion.trained_file_path, train_skip);
        write_partition(&ingestion.test_file_path, test_skip);
        DataValidation::new(stages.validation, ingestion, &PipelineTelemetry::disabled()).unwrap()
    }

    #[test]
    fn conforming_partitions_pass() {
        let dir = tempdir().unwrap();
        let artifact = stage(dir.path(), &[], &[]).initiate().unwrap();
        assert!(artifact.validation_status);
        assert!(artifact.message.is_empty());
        assert!(artifact.gate().is_passed());
    }

    #[test]
    fn reports_every_missing_column_in_both_partitions() {
        let dir = tempdir().unwrap();
        let artifact = stage(dir.path(), &["Age", "Vehicle_Damage"], &["Vintage"])
            .initiate()
            .unwrap();
        assert!(!artifact.validation_status);
        let joined = artifact.message.join("\n");
        assert!(joined.contains("train: expected 11 columns, found 9"));
        assert!(joined.contains("train: missing numerical columns: Age"));
        assert!(joined.contains("train: missing categorical columns: Vehicle_Damage"));
        assert!(joined.contains("test: missing numerical columns: Vintage"));
        let report: ValidationReport =
            serde_json::from_slice(&fs::read(&artifact.validation_report_file_path).unwrap())
                .unwrap();
        assert_eq!(report, artifact.report());
    }

    #[test]
    fn label_column_is_not_counted() {
        let dir = tempdir().unwrap();
        let artifact = stage(dir.path(), &["Response"], &[]).initiate().unwrap();
        assert!(artifact.validation_status);
    }
}
