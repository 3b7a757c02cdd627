use std::{collections::BTreeSet, fs, path::Path};

use anyhow::Context;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    schema::{BinaryMapping, Schema},
    table::Table,
};

/// Failures while fitting or applying the transformer.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Transformation was requested for data that failed validation.
    #[error("data validation did not pass: {0}")]
    ValidationNotPassed(String),
    /// A required column is absent.
    #[error("column `{0}` is missing")]
    MissingColumn(String),
    /// A required cell is empty.
    #[error("missing value in column `{column}` at row {row}")]
    MissingValue {
        /// Column name.
        column: String,
        /// Zero-based row.
        row: usize,
    },
    /// A numeric cell does not parse.
    #[error("column `{column}` row {row}: `{value}` is not a number")]
    InvalidNumber {
        /// Column name.
        column: String,
        /// Zero-based row.
        row: usize,
        /// Offending text.
        value: String,
    },
    /// A categorical level never seen during fitting.
    #[error("column `{column}`: unknown category `{value}`")]
    UnknownCategory {
        /// Column name.
        column: String,
        /// Offending level.
        value: String,
    },
    /// A pre-encoded indicator cell is neither `0` nor `1`.
    #[error("indicator `{column}` row {row}: `{value}` is not 0 or 1")]
    InvalidIndicator {
        /// Indicator column name.
        column: String,
        /// Zero-based row.
        row: usize,
        /// Offending text.
        value: String,
    },
    /// More than one indicator of a categorical column is set in a row.
    #[error("column `{column}` row {row}: more than one level indicator is set")]
    ConflictingIndicators {
        /// Categorical column name.
        column: String,
        /// Zero-based row.
        row: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ColumnScaler {
    column: String,
    offset: f64,
    scale: f64,
}

impl ColumnScaler {
    fn standard(column: &str, values: &[f64]) -> Self {
        let count = to_f64(values.len().max(1));
        let mean = values.iter().sum::<f64>() / count;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
        Self {
            column: column.to_owned(),
            offset: mean,
            scale: non_zero(variance.sqrt()),
        }
    }

    fn min_max(column: &str, values: &[f64]) -> Self {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let (min, range) = if values.is_empty() {
            (0.0, 1.0)
        } else {
            (min, non_zero(max - min))
        };
        Self {
            column: column.to_owned(),
            offset: min,
            scale: range,
        }
    }

    fn apply(&self, value: f64) -> f64 {
        (value - self.offset) / self.scale
    }
}

/// One-hot encoding of a categorical column with its first level dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CategoryEncoding {
    column: String,
    baseline: String,
    levels: Vec<String>,
    names: Vec<String>,
}

/// Fitted mapping from a raw table to the numeric feature matrix.
///
/// Output columns: the standard-scaled group, the min-max group, the remaining
/// numeric columns in table order, then the dummy columns. Dropped columns are
/// excluded at fit time and ignored by [`FeatureTransformer::transform`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTransformer {
    target_column: String,
    binary_mapping: Option<BinaryMapping>,
    standard: Vec<ColumnScaler>,
    min_max: Vec<ColumnScaler>,
    passthrough: Vec<String>,
    encodings: Vec<CategoryEncoding>,
}

impl FeatureTransformer {
    /// Learns levels and scaling statistics from `table`.
    pub fn fit(schema: &Schema, table: &Table) -> Result<Self, TransformError> {
        let binary_column = schema.binary_mapping.as_ref().map(|m| m.column.as_str());
        let categorical = schema
            .categorical_columns
            .iter()
            .filter(|name| Some(name.as_str()) != binary_column)
            .collect::<Vec<_>>();

        let mut encodings = Vec::with_capacity(categorical.len());
        for column in &categorical {
            let idx = require_column(table, column)?;
            let mut levels = BTreeSet::new();
            for row in 0..table.len() {
                let value = table.cell(row, idx).ok_or_else(|| TransformError::MissingValue {
                    column: (*column).clone(),
                    row,
                })?;
                levels.insert(value.to_owned());
            }
            let mut levels = levels.into_iter();
            let baseline = levels.next().unwrap_or_default();
            let levels = levels.collect::<Vec<_>>();
            let names = levels
                .iter()
                .map(|level| schema.canonical_dummy_name(column, level))
                .collect();
            encodings.push(CategoryEncoding {
                column: (*column).clone(),
                baseline,
                levels,
                names,
            });
        }

        let mapping = schema.binary_mapping.clone();
        let mut standard = Vec::new();
        for column in &schema.standard_scale_columns {
            let values = numeric_column(table, column, mapping.as_ref())?;
            standard.push(ColumnScaler::standard(column, &values));
        }
        let mut min_max = Vec::new();
        for column in &schema.min_max_columns {
            let values = numeric_column(table, column, mapping.as_ref())?;
            min_max.push(ColumnScaler::min_max(column, &values));
        }

        let passthrough = table
            .columns()
            .iter()
            .filter(|name| {
                *name != &schema.target_column
                    && !schema.drop_columns.contains(name)
                    && !categorical.contains(name)
                    && !schema.standard_scale_columns.contains(name)
                    && !schema.min_max_columns.contains(name)
            })
            .cloned()
            .collect();

        Ok(Self {
            target_column: schema.target_column.clone(),
            binary_mapping: mapping,
            standard,
            min_max,
            passthrough,
            encodings,
        })
    }

    /// Output column names, in matrix order.
    #[must_use]
    pub fn feature_names(&self) -> Vec<String> {
        self.standard
            .iter()
            .chain(&self.min_max)
            .map(|scaler| scaler.column.clone())
            .chain(self.passthrough.iter().cloned())
            .chain(self.encodings.iter().flat_map(|enc| enc.names.iter().cloned()))
            .collect()
    }

    /// Width of the output matrix.
    #[must_use]
    pub fn n_features(&self) -> usize {
        self.standard.len()
            + self.min_max.len()
            + self.passthrough.len()
            + self.encodings.iter().map(|enc| enc.names.len()).sum::<usize>()
    }

    /// Label column name.
    #[must_use]
    pub fn target_column(&self) -> &str {
        &self.target_column
    }

    /// Applies the fitted mapping. Never updates the fitted statistics.
    ///
    /// Categorical columns may be supplied raw or already one-hot encoded under
    /// their canonical dummy names.
    pub fn transform(&self, table: &Table) -> Result<Array2<f64>, TransformError> {
        let mapping = self.binary_mapping.as_ref();
        let mut columns: Vec<Vec<f64>> = Vec::with_capacity(self.n_features());
        for scaler in self.standard.iter().chain(&self.min_max) {
            let values = numeric_column(table, &scaler.column, mapping)?;
            columns.push(values.into_iter().map(|v| scaler.apply(v)).collect());
        }
        for column in &self.passthrough {
            columns.push(numeric_column(table, column, mapping)?);
        }
        for encoding in &self.encodings {
            columns.extend(encode_category(table, encoding)?);
        }

        let rows = table.len();
        let width = columns.len();
        let mut matrix = Array2::zeros((rows, width));
        for (col, values) in columns.iter().enumerate() {
            for (row, value) in values.iter().enumerate() {
                matrix[[row, col]] = *value;
            }
        }
        Ok(matrix)
    }

    /// Label vector of `table`.
    pub fn target_labels(&self, table: &Table) -> Result<Array1<f64>, TransformError> {
        Ok(Array1::from(numeric_column(table, &self.target_column, None)?))
    }

    /// Writes the fitted transformer as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Reads a transformer written by [`FeatureTransformer::save`].
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("decoding {}", path.display()))
    }
}

fn encode_category(
    table: &Table,
    encoding: &CategoryEncoding,
) -> Result<Vec<Vec<f64>>, TransformError> {
    if let Some(idx) = table.column_index(&encoding.column) {
        let mut columns = vec![vec![0.0; table.len()]; encoding.levels.len()];
        for row in 0..table.len() {
            let value = table
                .cell(row, idx)
                .ok_or_else(|| TransformError::MissingValue {
                    column: encoding.column.clone(),
                    row,
                })?;
            if value == encoding.baseline {
                continue;
            }
            let level = encoding
                .levels
                .iter()
                .position(|level| level == value)
                .ok_or_else(|| TransformError::UnknownCategory {
                    column: encoding.column.clone(),
                    value: value.to_owned(),
                })?;
            columns[level][row] = 1.0;
        }
        return Ok(columns);
    }
    let prefix = format!("{}_", encoding.column);
    if let Some(unknown) = table
        .columns()
        .iter()
        .find(|name| name.starts_with(&prefix) && !encoding.names.contains(name))
    {
        return Err(TransformError::UnknownCategory {
            column: encoding.column.clone(),
            value: unknown.clone(),
        });
    }
    let columns = encoding
        .names
        .iter()
        .map(|name| indicator_column(table, name))
        .collect::<Result<Vec<_>, _>>()?;
    for row in 0..table.len() {
        if columns.iter().filter(|values| values[row] > 0.5).count() > 1 {
            return Err(TransformError::ConflictingIndicators {
                column: encoding.column.clone(),
                row,
            });
        }
    }
    Ok(columns)
}

fn indicator_column(table: &Table, column: &str) -> Result<Vec<f64>, TransformError> {
    let idx = require_column(table, column)?;
    (0..table.len())
        .map(|row| {
            let raw = table
                .cell(row, idx)
                .ok_or_else(|| TransformError::MissingValue {
                    column: column.to_owned(),
                    row,
                })?;
            match raw.trim().parse::<f64>() {
                Ok(value) if value.abs() < f64::EPSILON => Ok(0.0),
                Ok(value) if (value - 1.0).abs() < f64::EPSILON => Ok(1.0),
                _ => Err(TransformError::InvalidIndicator {
                    column: column.to_owned(),
                    row,
                    value: raw.to_owned(),
                }),
            }
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn numeric_column(
    table: &Table,
    column: &str,
    mapping: Option<&BinaryMapping>,
) -> Result<Vec<f64>, TransformError> {
    let idx = require_column(table, column)?;
    let mapping = mapping.filter(|m| m.column == column);
    (0..table.len())
        .map(|row| {
            let raw = table
                .cell(row, idx)
                .ok_or_else(|| TransformError::MissingValue {
                    column: column.to_owned(),
                    row,
                })?;
            if let Some(mapping) = mapping {
                return mapping.code_for(raw).map(|code| code as f64).ok_or_else(|| {
                    TransformError::UnknownCategory {
                        column: column.to_owned(),
                        value: raw.to_owned(),
                    }
                });
            }
            raw.trim()
                .parse::<f64>()
                .map_err(|_| TransformError::InvalidNumber {
                    column: column.to_owned(),
                    row,
                    value: raw.to_owned(),
                })
        })
        .collect()
}

fn require_column(table: &Table, column: &str) -> Result<usize, TransformError> {
    table
        .column_index(column)
        .ok_or_else(|| TransformError::MissingColumn(column.to_owned()))
}

fn non_zero(value: f64) -> f64 {
    if value.abs() < f64::EPSILON {
        1.0
    } else {
        value
    }
}

#[allow(clippy::cast_precision_loss)]
const fn to_f64(value: usize) -> f64 {
    value as f64
}
