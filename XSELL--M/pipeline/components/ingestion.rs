use anyhow::{bail, Context, Result};
use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    artifact::DataIngestionArtifact, config::DataIngestionConfig, error::Stage,
    storage::DocumentStore, table::Table, telemetry::PipelineTelemetry,
};

/// Snapshots a document-store collection and splits it into train and test.
#[derive(Debug)]
pub struct DataIngestion {
    config: DataIngestionConfig,
    telemetry: PipelineTelemetry,
}

impl DataIngestion {
    /// Creates the stage.
    #[must_use]
    pub fn new(config: DataIngestionConfig, telemetry: &PipelineTelemetry) -> Self {
        Self {
            config,
            telemetry: telemetry.for_module(Stage::DataIngestion.name()),
        }
    }

    /// Fetches the collection and writes the snapshot CSV.
    pub fn export_data_into_feature_store(&self, store: &dyn DocumentStore) -> Result<Table> {
        self.telemetry.info(&format!(
            "Exporting data from collection {}",
            self.config.collection_name
        ));
        let documents = store
            .fetch_all(&self.config.collection_name)
            .with_context(|| format!("fetching collection {}", self.config.collection_name))?;
        let table = Table::from_documents(&documents);
        table.write_csv(&self.config.feature_store_file_path)?;
        let _ = self.telemetry.log(
            LogLevel::Info,
            "Saved exported data into feature store",
            json!({
                "rows": table.len(),
                "columns": table.columns().len(),
                "path": self.config.feature_store_file_path,
            }),
        );
        Ok(table)
    }

    /// Shuffles rows and assigns `ceil(n * test_ratio)` of them to the test set.
    pub fn split_data_as_train_test(&self, table: &Table) -> Result<(Table, Table)> {
        let total = table.len();
        let test_rows = test_row_count(total, self.config.test_ratio);
        if test_rows == 0 || test_rows >= total {
            bail!(
                "cannot split {total} rows at test ratio {}: both partitions must be non-empty",
                self.config.test_ratio
            );
        }
        let mut order = (0..total).collect::<Vec<_>>();
        let mut rng = self
            .config
            .split_seed
            .map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
        order.shuffle(&mut rng);
        let (test_idx, train_idx) = order.split_at(test_rows);
        let train = table.select_rows(train_idx);
        let test = table.select_rows(test_idx);
        train.write_csv(&self.config.training_file_path)?;
        test.write_csv(&self.config.testing_file_path)?;
        self.telemetry
            .info("Performed train test split on the dataframe");
        Ok((train, test))
    }

    /// Runs the stage.
    pub fn initiate(&self, store: &dyn DocumentStore) -> Result<DataIngestionArtifact> {
        self.telemetry
            .info("Entered initiate_data_ingestion method of Data_Ingestion class");
        let table = self.export_data_into_feature_store(store)?;
        let (train, test) = self.split_data_as_train_test(&table)?;
        let artifact = DataIngestionArtifact {
            feature_store_file_path: self.config.feature_store_file_path.clone(),
            trained_file_path: self.config.training_file_path.clone(),
            test_file_path: self.config.testing_file_path.clone(),
            train_rows: train.len(),
            test_rows: test.len(),
        };
        let _ = self.telemetry.log(
            LogLevel::Info,
            "Data ingestion artifact created",
            json!({ "train_rows": artifact.train_rows, "test_rows": artifact.test_rows }),
        );
        Ok(artifact)
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn test_row_count(total: usize, ratio: f64) -> usize {
    (total as f64 * ratio).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage::MemoryDocumentStore, test_support};
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn stage(dir: &std::path::Path, seed: Option<u64>) -> DataIngestion {
        let mut config = test_support::test_config(dir);
        config.ingestion.split_seed = seed;
        DataIngestion::new(
            config.stage_configs("run").ingestion,
            &PipelineTelemetry::disabled(),
        )
    }

    fn store(rows: usize) -> MemoryDocumentStore {
        let store = MemoryDocumentStore::new();
        store.insert_many(
            test_support::COLLECTION,
            test_support::synthetic_records(rows, 5),
        );
        store
    }

    #[test]
    fn splits_one_hundred_rows_sixty_forty() {
        let dir = tempdir().unwrap();
        let artifact = stage(dir.path(), Some(7)).initiate(&store(100)).unwrap();
        assert_eq!(artifact.train_rows + artifact.test_rows, 100);
        assert_eq!(artifact.test_rows, 40);
        let train = Table::read_csv(&artifact.trained_file_path).unwrap();
        let test = Table::read_csv(&artifact.test_file_path).unwrap();
        assert_eq!(train.len(), 60);
        assert_eq!(test.len(), 40);
        assert!(!train.has_column("_id"));
        let snapshot = Table::read_csv(&artifact.feature_store_file_path).unwrap();
        assert_eq!(snapshot.len(), 100);
    }

    #[test]
    fn partitions_are_disjoint() {
        let dir = tempdir().unwrap();
        let artifact = stage(dir.path(), Some(1)).initiate(&store(50)).unwrap();
        let ids = |path: &std::path::Path| {
            let table = Table::read_csv(path).unwrap();
            let idx = table.column_index("id").unwrap();
            (0..table.len())
                .map(|row| table.cell(row, idx).unwrap().to_owned())
                .collect::<HashSet<_>>()
        };
        let train = ids(&artifact.trained_file_path);
        let test = ids(&artifact.test_file_path);
        assert!(train.is_disjoint(&test));
        assert_eq!(train.len() + test.len(), 50);
    }

    #[test]
    fn seeded_split_is_reproducible() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        let a = stage(first.path(), Some(3)).initiate(&store(30)).unwrap();
        let b = stage(second.path(), Some(3)).initiate(&store(30)).unwrap();
        assert_eq!(
            Table::read_csv(&a.test_file_path).unwrap(),
            Table::read_csv(&b.test_file_path).unwrap()
        );
    }

    #[test]
    fn missing_collection_is_structural() {
        let dir = tempdir().unwrap();
        let err = stage(dir.path(), None)
            .initiate(&MemoryDocumentStore::new())
            .unwrap_err();
        assert!(format!("{err:#}").contains("not found"));
    }

    #[test]
    fn rounds_test_rows_up() {
        assert_eq!(test_row_count(10, 0.25), 3);
        assert_eq!(test_row_count(100, 0.4), 40);
    }
}
