use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use indexmap::IndexSet;
use serde_json::Value;

use crate::storage::Document;

/// Textual marker the document store uses for "not available".
pub const MISSING_MARKER: &str = "na";

/// Synthetic identity field added by the document store.
pub const DOCUMENT_ID_FIELD: &str = "_id";

/// Ordered columns and rows of optional string cells. `None` marks a missing
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl Table {
    /// Builds a table, checking that every row matches the header width.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Result<Self> {
        if let Some((idx, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            bail!(
                "row {idx} has {} cells, expected {}",
                row.len(),
                columns.len()
            );
        }
        Ok(Self { columns, rows })
    }

    /// Builds a table from document-store records. Columns appear in first-seen
    /// order; the synthetic `_id` field is stripped and the `na` marker becomes
    /// a missing value.
    #[must_use]
    pub fn from_documents(documents: &[Document]) -> Self {
        let mut columns = IndexSet::new();
        for document in documents {
            for key in document.keys() {
                if key != DOCUMENT_ID_FIELD {
                    columns.insert(key.clone());
                }
            }
        }
        let rows = documents
            .iter()
            .map(|document| {
                columns
                    .iter()
                    .map(|column| document.get(column).and_then(cell_from_value))
                    .collect()
            })
            .collect();
        Self {
            columns: columns.into_iter().collect(),
            rows,
        }
    }

    /// Column names in order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in order.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Whether the column exists.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Cell at `row` of `column`.
    #[must_use]
    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|cells| cells.get(column))
            .and_then(Option::as_deref)
    }

    /// New table holding the given rows, in the given order.
    #[must_use]
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        Self {
            columns: self.columns.clone(),
            rows: indices
                .iter()
                .filter_map(|idx| self.rows.get(*idx).cloned())
                .collect(),
        }
    }

    /// Reads a CSV file with a header row. Empty fields are missing values.
    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let columns = reader
            .headers()
            .with_context(|| format!("reading header of {}", path.display()))?
            .iter()
            .map(str::to_owned)
            .collect::<Vec<_>>();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("reading {}", path.display()))?;
            rows.push(
                record
                    .iter()
                    .map(|field| (!field.is_empty()).then(|| field.to_owned()))
                    .collect(),
            );
        }
        Self::from_rows(columns, rows)
    }

    /// Writes the table as CSV, creating parent directories.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut writer =
            csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(|cell| cell.as_deref().unwrap_or("")))?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn cell_from_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) if text.trim().eq_ignore_ascii_case(MISSING_MARKER) => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(u8::from(*flag).to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn document(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn documents_strip_identity_and_normalize_missing() {
        let table = Table::from_documents(&[
            document(json!({ "_id": "a1", "Age": 44, "Gender": "Male" })),
            document(json!({ "_id": "a2", "Age": "na", "Gender": "Female", "Vintage": 10 })),
        ]);
        assert_eq!(table.columns(), ["Age", "Gender", "Vintage"]);
        assert_eq!(table.cell(0, 0), Some("44"));
        assert_eq!(table.cell(1, 0), None);
        assert_eq!(table.cell(0, 2), None);
        assert_eq!(table.cell(1, 2), Some("10"));
    }

    #[test]
    fn csv_preserves_cells_and_missing_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("data.csv");
        let table = Table::from_rows(
            vec!["Vehicle_Age".into(), "Annual_Premium".into()],
            vec![
                vec![Some("< 1 Year".into()), Some("40454.0".into())],
                vec![Some("> 2 Years".into()), None],
            ],
        )
        .unwrap();
        table.write_csv(&path).unwrap();
        assert_eq!(Table::read_csv(&path).unwrap(), table);
    }

    #[test]
    fn rejects_ragged_rows() {
        let err = Table::from_rows(vec!["a".into()], vec![vec![None, None]]).unwrap_err();
        assert!(err.to_string().contains("row 0"));
    }

    #[test]
    fn select_rows_keeps_order() {
        let table = Table::from_rows(
            vec!["a".into()],
            (0..4).map(|idx| vec![Some(idx.to_string())]).collect(),
        )
        .unwrap();
        let picked = table.select_rows(&[3, 1]);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked.cell(0, 0), Some("3"));
        assert_eq!(picked.cell(1, 0), Some("1"));
    }
}
