use std::{fs, path::Path};

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    forest::{RandomForest, TrainingError},
    transformer::{FeatureTransformer, TransformError},
};
use crate::table::Table;

/// Format tag written into every bundle.
pub const BUNDLE_FORMAT: &str = "xsell-model-bundle";
/// Envelope version this build reads and writes.
pub const BUNDLE_VERSION: u32 = 1;

/// Failures while encoding, decoding or applying a bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    /// The bytes are not a model bundle.
    #[error("unexpected bundle format `{0}`")]
    Format(String),
    /// The bundle was written by an incompatible version.
    #[error("unsupported bundle version {found} (supported: {supported})")]
    Version {
        /// Version in the bundle.
        found: u32,
        /// Version this build understands.
        supported: u32,
    },
    /// Transformer and classifier disagree on the feature count.
    #[error("transformer yields {transformer} features but the classifier expects {model}")]
    FeatureMismatch {
        /// Transformer output width.
        transformer: usize,
        /// Classifier input width.
        model: usize,
    },
    /// JSON encoding or decoding failed.
    #[error("bundle json: {0}")]
    Json(#[from] serde_json::Error),
    /// Reading or writing the bundle file failed.
    #[error("bundle io: {0}")]
    Io(#[from] std::io::Error),
    /// The record could not be transformed.
    #[error(transparent)]
    Transform(#[from] TransformError),
    /// The classifier rejected its input.
    #[error(transparent)]
    Model(#[from] TrainingError),
}

#[derive(Deserialize)]
struct BundleHeader {
    format: String,
    version: u32,
}

/// Deployable unit: fitted transformer plus classifier, with a format tag and
/// version checked on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    format: String,
    version: u32,
    created_at: DateTime<Utc>,
    feature_names: Vec<String>,
    transformer: FeatureTransformer,
    model: RandomForest,
}

impl ModelBundle {
    /// Packs a transformer and the classifier fitted on its output.
    pub fn new(transformer: FeatureTransformer, model: RandomForest) -> Result<Self, BundleError> {
        if transformer.n_features() != model.n_features() {
            return Err(BundleError::FeatureMismatch {
                transformer: transformer.n_features(),
                model: model.n_features(),
            });
        }
        Ok(Self {
            format: BUNDLE_FORMAT.into(),
            version: BUNDLE_VERSION,
            created_at: Utc::now(),
            feature_names: transformer.feature_names(),
            transformer,
            model,
        })
    }

    /// Input feature names in matrix order.
    #[must_use]
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Number of features the classifier expects.
    #[must_use]
    pub const fn n_features(&self) -> usize {
        self.model.n_features()
    }

    /// Fitted transformer.
    #[must_use]
    pub const fn transformer(&self) -> &FeatureTransformer {
        &self.transformer
    }

    /// Transforms raw rows and predicts one class per row.
    pub fn predict(&self, table: &Table) -> Result<Vec<u8>, BundleError> {
        let features = self.transformer.transform(table)?;
        self.predict_array(&features)
    }

    /// Predicts on an already transformed matrix.
    pub fn predict_array(&self, features: &Array2<f64>) -> Result<Vec<u8>, BundleError> {
        Ok(self.model.predict(features)?)
    }

    /// Encodes the bundle.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BundleError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a bundle, checking the format tag and version before the body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BundleError> {
        let header: BundleHeader = serde_json::from_slice(bytes)?;
        if header.format != BUNDLE_FORMAT {
            return Err(BundleError::Format(header.format));
        }
        if header.version != BUNDLE_VERSION {
            return Err(BundleError::Version {
                found: header.version,
                supported: BUNDLE_VERSION,
            });
        }
        let bundle: Self = serde_json::from_slice(bytes)?;
        if bundle.transformer.n_features() != bundle.model.n_features() {
            return Err(BundleError::FeatureMismatch {
                transformer: bundle.transformer.n_features(),
                model: bundle.model.n_features(),
            });
        }
        Ok(bundle)
    }

    /// Writes the bundle, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), BundleError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Reads a bundle written by [`ModelBundle::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BundleError> {
        Self::from_bytes(&fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        estimator::forest::ForestParams, schema::Schema, test_support, test_support::SCHEMA_TOML,
    };
    use tempfile::tempdir;

    fn fitted_bundle() -> (ModelBundle, Table) {
        let schema = Schema::from_toml_str(SCHEMA_TOML).unwrap();
        let table = Table::from_documents(&test_support::synthetic_records(60, 3));
        let transformer = FeatureTransformer::fit(&schema, &table).unwrap();
        let features = transformer.transform(&table).unwrap();
        let labels = transformer.target_labels(&table).unwrap();
        let params = ForestParams {
            n_estimators: 5,
            max_depth: Some(4),
            ..ForestParams::default()
        };
        let model = RandomForest::fit(&params, &features, &labels).unwrap();
        (ModelBundle::new(transformer, model).unwrap(), table)
    }

    #[test]
    fn saved_bundle_predicts_like_the_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");
        let (bundle, table) = fitted_bundle();
        bundle.save(&path).unwrap();
        let loaded = ModelBundle::load(&path).unwrap();
        assert_eq!(loaded.predict(&table).unwrap(), bundle.predict(&table).unwrap());
        assert_eq!(loaded.feature_names().len(), loaded.n_features());
    }

    #[test]
    fn rejects_foreign_or_newer_envelopes() {
        let (bundle, _) = fitted_bundle();
        let mut value: serde_json::Value = serde_json::from_slice(&bundle.to_bytes().unwrap()).unwrap();
        value["version"] = serde_json::json!(2);
        let err = ModelBundle::from_bytes(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(matches!(err, BundleError::Version { found: 2, .. }));
        value["format"] = serde_json::json!("pickle");
        let err = ModelBundle::from_bytes(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(matches!(err, BundleError::Format(_)));
    }
}
