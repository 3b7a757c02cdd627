use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use ndarray::{concatenate, s, Array1, Array2, Axis};

/// Writes a matrix as JSON, creating parent directories.
pub fn save_array(path: impl AsRef<Path>, array: &Array2<f64>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec(array)?;
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Reads a matrix written by [`save_array`].
pub fn load_array(path: impl AsRef<Path>) -> Result<Array2<f64>> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("decoding {}", path.display()))
}

/// Appends `labels` as the last column of `features`.
pub fn append_label(features: &Array2<f64>, labels: &Array1<f64>) -> Result<Array2<f64>> {
    if features.nrows() != labels.len() {
        bail!(
            "feature rows ({}) and labels ({}) differ",
            features.nrows(),
            labels.len()
        );
    }
    let column = labels.view().insert_axis(Axis(1));
    Ok(concatenate(Axis(1), &[features.view(), column])?)
}

/// Splits a matrix into features and its last column.
pub fn split_label(array: &Array2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
    let width = array.ncols();
    if width < 2 {
        bail!("array with {width} column(s) has no feature columns");
    }
    let features = array.slice(s![.., ..width - 1]).to_owned();
    let labels = array.column(width - 1).to_owned();
    Ok((features, labels))
}
