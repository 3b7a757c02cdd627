use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declared type of a raw column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Integer-valued.
    Int,
    /// Real-valued.
    Float,
    /// Free-text category.
    Category,
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub dtype: ColumnType,
}

/// Maps the labels of a two-valued categorical column to integer codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryMapping {
    /// Column to map.
    pub column: String,
    /// Label to code.
    pub values: IndexMap<String, i64>,
}

impl BinaryMapping {
    /// Code for a raw cell. Accepts either a declared label or one of the codes
    /// written as a number.
    #[must_use]
    pub fn code_for(&self, raw: &str) -> Option<i64> {
        let raw = raw.trim();
        if let Some(code) = self.values.get(raw) {
            return Some(*code);
        }
        let parsed = raw.parse::<f64>().ok()?;
        self.values
            .values()
            .copied()
            .find(|code| (*code as f64 - parsed).abs() < f64::EPSILON)
    }
}

/// Declarative description of the raw collection. Read-only once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Label column.
    pub target_column: String,
    /// Every expected column. The target, if listed, does not count.
    pub columns: Vec<ColumnSpec>,
    /// Columns that must be present and are treated as categories.
    #[serde(default)]
    pub categorical_columns: Vec<String>,
    /// Columns that must be present and are numeric.
    #[serde(default)]
    pub numerical_columns: Vec<String>,
    /// Columns scaled to zero mean and unit variance.
    #[serde(default)]
    pub standard_scale_columns: Vec<String>,
    /// Columns scaled into `[0, 1]`.
    #[serde(default)]
    pub min_max_columns: Vec<String>,
    /// Columns removed before encoding.
    #[serde(default)]
    pub drop_columns: Vec<String>,
    /// Optional two-valued categorical mapped to `{0, 1}`.
    #[serde(default)]
    pub binary_mapping: Option<BinaryMapping>,
    /// Generated dummy name to canonical name.
    #[serde(default)]
    pub rename_columns: IndexMap<String, String>,
}

impl Schema {
    /// Reads and checks a schema document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|err| match err {
            SchemaError::Parse { source, .. } => SchemaError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses and checks a schema from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self, SchemaError> {
        let schema: Self = toml::from_str(raw).map_err(|source| SchemaError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        schema.check()?;
        Ok(schema)
    }

    /// Number of declared columns excluding the label.
    #[must_use]
    pub fn feature_column_count(&self) -> usize {
        self.columns
            .iter()
            .filter(|column| column.name != self.target_column)
            .count()
    }

    /// Canonical name of a generated dummy column.
    #[must_use]
    pub fn canonical_dummy_name(&self, column: &str, level: &str) -> String {
        let generated = format!("{column}_{level}");
        self.rename_columns
            .get(&generated)
            .cloned()
            .unwrap_or(generated)
    }

    fn check(&self) -> Result<(), SchemaError> {
        if self.target_column.trim().is_empty() {
            return Err(SchemaError::Invalid("target_column is empty".into()));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(SchemaError::Invalid(format!(
                    "column `{}` declared twice",
                    column.name
                )));
            }
        }
        if let Some(shared) = self
            .standard_scale_columns
            .iter()
            .find(|name| self.min_max_columns.contains(name))
        {
            return Err(SchemaError::Invalid(format!(
                "column `{shared}` is in both scaling groups"
            )));
        }
        for name in self.standard_scale_columns.iter().chain(&self.min_max_columns) {
            if self.categorical_columns.contains(name) {
                return Err(SchemaError::Invalid(format!(
                    "categorical column `{name}` cannot be scaled"
                )));
            }
            if name == &self.target_column || self.drop_columns.contains(name) {
                return Err(SchemaError::Invalid(format!(
                    "scaled column `{name}` is not a feature"
                )));
            }
        }
        if let Some(mapping) = &self.binary_mapping {
            if mapping.values.len() != 2 {
                return Err(SchemaError::Invalid(format!(
                    "binary mapping for `{}` must have exactly two labels",
                    mapping.column
                )));
            }
        }
        Ok(())
    }
}

/// Errors raised while loading a schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The file could not be read.
    #[error("reading schema {path}: {source}")]
    Io {
        /// Schema location.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The document is not valid TOML for a schema.
    #[error("parsing schema {path}: {source}")]
    Parse {
        /// Schema location.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The document parsed but is inconsistent.
    #[error("invalid schema: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SCHEMA_TOML;

    #[test]
    fn parses_vehicle_schema() {
        let schema = Schema::from_toml_str(SCHEMA_TOML).unwrap();
        assert_eq!(schema.target_column, "Response");
        assert_eq!(schema.columns.len(), 12);
        assert_eq!(schema.feature_column_count(), 11);
        assert_eq!(
            schema.canonical_dummy_name("Vehicle_Age", "< 1 Year"),
            "Vehicle_Age_lt_1_Year"
        );
        assert_eq!(
            schema.canonical_dummy_name("Vehicle_Damage", "Yes"),
            "Vehicle_Damage_Yes"
        );
    }

    #[test]
    fn binary_mapping_accepts_labels_and_codes() {
        let schema = Schema::from_toml_str(SCHEMA_TOML).unwrap();
        let mapping = schema.binary_mapping.unwrap();
        assert_eq!(mapping.code_for("Male"), Some(1));
        assert_eq!(mapping.code_for("0"), Some(0));
        assert_eq!(mapping.code_for("1.0"), Some(1));
        assert_eq!(mapping.code_for("Other"), None);
    }

    #[test]
    fn rejects_overlapping_scaling_groups() {
        let raw = r#"
target_column = "y"
columns = [{ name = "a", dtype = "float" }]
numerical_columns = ["a"]
standard_scale_columns = ["a"]
min_max_columns = ["a"]
"#;
        let err = Schema::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, SchemaError::Invalid(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Schema::load("/nonexistent/schema.toml").unwrap_err();
        assert!(matches!(err, SchemaError::Io { .. }));
    }
}
