use std::path::PathBuf;

use serde_json::{Map, Value};
use thiserror::Error;

/// Document-store backends.
#[path = "document.rs"]
pub mod document;

/// Object-store backends.
#[path = "object.rs"]
pub mod object;

pub use document::{DocumentStore, JsonlDocumentStore, MemoryDocumentStore};
pub use object::{FsObjectStore, MemoryObjectStore, ObjectStore};

/// One raw record as returned by the document store.
pub type Document = Map<String, Value>;

/// Failures raised by the storage collaborators.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No object under the requested key.
    #[error("object {bucket}/{key} not found")]
    NotFound {
        /// Bucket searched.
        bucket: String,
        /// Key searched.
        key: String,
    },
    /// The collection does not exist.
    #[error("collection `{0}` not found")]
    CollectionNotFound(String),
    /// Bucket or key escapes the store root or is empty.
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    /// Filesystem failure.
    #[error("storage io on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A stored document is not a JSON object.
    #[error("malformed document in {path} at line {line}: {reason}")]
    Json {
        /// File holding the document.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// Parser message.
        reason: String,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
