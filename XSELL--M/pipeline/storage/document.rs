use std::{
    collections::HashMap,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use parking_lot::RwLock;
use serde_json::Value;

use super::{Document, StorageError};

/// Read-only access to named collections of raw records.
pub trait DocumentStore: Send + Sync {
    /// Every record of `collection`, in storage order.
    fn fetch_all(&self, collection: &str) -> Result<Vec<Document>, StorageError>;
}

/// Collections stored as `<root>/<collection>.jsonl`, one object per line.
#[derive(Debug, Clone)]
pub struct JsonlDocumentStore {
    root: PathBuf,
}

impl JsonlDocumentStore {
    /// Store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the collection files.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.jsonl"))
    }
}

impl DocumentStore for JsonlDocumentStore {
    fn fetch_all(&self, collection: &str) -> Result<Vec<Document>, StorageError> {
        if collection.is_empty() || collection.contains(['/', '\\']) || collection.contains("..") {
            return Err(StorageError::InvalidKey(collection.to_owned()));
        }
        let path = self.collection_path(collection);
        if !path.exists() {
            return Err(StorageError::CollectionNotFound(collection.to_owned()));
        }
        let file = fs::File::open(&path).map_err(|err| StorageError::io(&path, err))?;
        let mut documents = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| StorageError::io(&path, err))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(Value::Object(map)) => documents.push(map),
                Ok(_) => {
                    return Err(StorageError::Json {
                        path,
                        line: idx + 1,
                        reason: "expected a JSON object".into(),
                    })
                }
                Err(err) => {
                    return Err(StorageError::Json {
                        path,
                        line: idx + 1,
                        reason: err.to_string(),
                    })
                }
            }
        }
        Ok(documents)
    }
}

/// In-memory store used by tests and demos.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryDocumentStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends records to a collection, creating it if needed.
    pub fn insert_many(&self, collection: &str, documents: impl IntoIterator<Item = Document>) {
        self.collections
            .write()
            .entry(collection.to_owned())
            .or_default()
            .extend(documents);
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn fetch_all(&self, collection: &str) -> Result<Vec<Document>, StorageError> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .ok_or_else(|| StorageError::CollectionNotFound(collection.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn jsonl_store_reads_every_line() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("Proj1-Data.jsonl"),
            "{\"_id\":\"a\",\"Age\":30}\n\n{\"_id\":\"b\",\"Age\":\"na\"}\n",
        )
        .unwrap();
        let store = JsonlDocumentStore::new(dir.path());
        let documents = store.fetch_all("Proj1-Data").unwrap();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[1]["Age"], json!("na"));
    }

    #[test]
    fn jsonl_store_reports_bad_lines() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("c.jsonl"), "{\"a\":1}\n[1,2]\n").unwrap();
        let err = JsonlDocumentStore::new(dir.path())
            .fetch_all("c")
            .unwrap_err();
        assert!(matches!(err, StorageError::Json { line: 2, .. }));
    }

    #[test]
    fn missing_collection_is_reported() {
        let dir = tempdir().unwrap();
        let store = JsonlDocumentStore::new(dir.path());
        assert!(matches!(
            store.fetch_all("absent"),
            Err(StorageError::CollectionNotFound(_))
        ));
        assert!(matches!(
            store.fetch_all("../etc"),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn memory_store_accumulates() {
        let store = MemoryDocumentStore::new();
        let record = json!({ "Age": 1 }).as_object().cloned().unwrap();
        store.insert_many("c", vec![record.clone()]);
        store.insert_many("c", vec![record]);
        assert_eq!(store.fetch_all("c").unwrap().len(), 2);
    }
}
