use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Axis};
use rand::{rngs::SmallRng, Rng, SeedableRng};

use super::{forest::binary_labels, neighbors::KdTree};

/// SMOTE oversampling of the minority class followed by edited nearest
/// neighbours cleaning over every class.
///
/// Neighbour searches go through a k-d tree built once per pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmoteEnn {
    /// Minority neighbours used to interpolate synthetic rows.
    pub smote_neighbors: usize,
    /// Neighbours consulted when deciding whether to drop a row.
    pub enn_neighbors: usize,
    /// Seed for sample generation; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for SmoteEnn {
    fn default() -> Self {
        Self {
            smote_neighbors: 5,
            enn_neighbors: 3,
            seed: Some(42),
        }
    }
}

impl SmoteEnn {
    /// Returns the resampled features and labels.
    ///
    /// Inputs with fewer than two classes or fewer than two minority rows are
    /// returned unchanged.
    pub fn fit_resample(
        &self,
        features: &Array2<f64>,
        labels: &Array1<f64>,
    ) -> Result<(Array2<f64>, Array1<f64>)> {
        if features.nrows() != labels.len() {
            bail!(
                "cannot resample {} rows with {} labels",
                features.nrows(),
                labels.len()
            );
        }
        let classes = binary_labels(labels)?;
        let positives = classes.iter().filter(|label| **label == 1).count();
        let negatives = classes.len() - positives;
        let (minority_class, minority, majority) = if positives <= negatives {
            (1_u8, positives, negatives)
        } else {
            (0_u8, negatives, positives)
        };
        if minority < 2 || positives == 0 || negatives == 0 {
            return Ok((features.clone(), labels.clone()));
        }

        let mut rng = self
            .seed
            .map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
        let (features, classes) =
            self.oversample(features, &classes, minority_class, majority - minority, &mut rng)?;
        let keep = self.edited_rows(&features, &classes);
        if keep.is_empty() {
            return Ok((features, to_labels(&classes)));
        }
        let kept_features = features.select(Axis(0), &keep);
        let kept_labels = keep.iter().map(|row| classes[*row]).collect::<Vec<_>>();
        Ok((kept_features, to_labels(&kept_labels)))
    }

    fn oversample(
        &self,
        features: &Array2<f64>,
        classes: &[u8],
        minority_class: u8,
        needed: usize,
        rng: &mut SmallRng,
    ) -> Result<(Array2<f64>, Vec<u8>)> {
        let mut features = features.clone();
        let mut classes = classes.to_vec();
        if needed == 0 {
            return Ok((features, classes));
        }
        let minority_rows = classes
            .iter()
            .enumerate()
            .filter_map(|(row, label)| (*label == minority_class).then_some(row))
            .collect::<Vec<_>>();
        let k = self.smote_neighbors.clamp(1, minority_rows.len() - 1);
        let neighbours = {
            let tree = KdTree::new(&features, minority_rows.clone());
            minority_rows
                .iter()
                .map(|row| tree.nearest(*row, k))
                .collect::<Vec<_>>()
        };
        for _ in 0..needed {
            let pick = rng.gen_range(0..minority_rows.len());
            let origin = features.row(minority_rows[pick]).to_owned();
            let partner_row = neighbours[pick][rng.gen_range(0..neighbours[pick].len())];
            let partner = features.row(partner_row).to_owned();
            let gap: f64 = rng.gen();
            let synthetic = &origin + &((&partner - &origin) * gap);
            features.push_row(synthetic.view())?;
            classes.push(minority_class);
        }
        Ok((features, classes))
    }

    /// Rows whose nearest neighbours all share their class.
    fn edited_rows(&self, features: &Array2<f64>, classes: &[u8]) -> Vec<usize> {
        let rows = features.nrows();
        let k = self.enn_neighbors.clamp(1, rows.saturating_sub(1).max(1));
        let tree = KdTree::new(features, (0..rows).collect());
        (0..rows)
            .filter(|row| {
                tree.nearest(*row, k)
                    .iter()
                    .all(|neighbour| classes[*neighbour] == classes[*row])
            })
            .collect()
    }
}

fn to_labels(classes: &[u8]) -> Array1<f64> {
    classes.iter().map(|label| f64::from(*label)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn imbalanced() -> (Array2<f64>, Array1<f64>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for idx in 0..30 {
            let positive = idx % 5 == 0;
            let spread = f64::from(idx) * 0.01;
            if positive {
                rows.extend([10.0 + spread, 10.0 - spread]);
            } else {
                rows.extend([-spread, spread]);
            }
            labels.push(if positive { 1.0 } else { 0.0 });
        }
        (
            Array2::from_shape_vec((30, 2), rows).unwrap(),
            Array1::from(labels),
        )
    }

    #[test]
    fn balances_separable_classes() {
        let (features, labels) = imbalanced();
        let (resampled, new_labels) = SmoteEnn::default()
            .fit_resample(&features, &labels)
            .unwrap();
        assert_eq!(resampled.nrows(), new_labels.len());
        let positives = new_labels.iter().filter(|l| **l == 1.0).count();
        assert_eq!(positives, 24);
        assert_eq!(new_labels.len(), 48);
    }

    #[test]
    fn synthetic_rows_stay_between_minority_samples() {
        let (features, labels) = imbalanced();
        let (resampled, new_labels) = SmoteEnn::default()
            .fit_resample(&features, &labels)
            .unwrap();
        for (row, label) in resampled.rows().into_iter().zip(new_labels.iter()) {
            if *label == 1.0 {
                assert!(row[0] >= 10.0 && row[0] <= 10.3);
            }
        }
    }

    #[test]
    fn single_class_is_untouched() {
        let features = array![[1.0], [2.0], [3.0]];
        let labels = array![0.0, 0.0, 0.0];
        let (same, same_labels) = SmoteEnn::default()
            .fit_resample(&features, &labels)
            .unwrap();
        assert_eq!(same, features);
        assert_eq!(same_labels, labels);
    }

    #[test]
    fn seeded_runs_agree() {
        let (features, labels) = imbalanced();
        let first = SmoteEnn::default().fit_resample(&features, &labels).unwrap();
        let second = SmoteEnn::default().fit_resample(&features, &labels).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn resamples_thousands_of_rows() {
        let mut rng = SmallRng::seed_from_u64(5);
        let rows = 6_000;
        let features = Array2::from_shape_fn((rows, 4), |_| rng.gen_range(0.0..1.0));
        let labels = (0..rows)
            .map(|row| if row % 8 == 0 { 1.0 } else { 0.0 })
            .collect::<Array1<f64>>();
        let started = std::time::Instant::now();
        let (resampled, new_labels) = SmoteEnn::default()
            .fit_resample(&features, &labels)
            .unwrap();
        assert_eq!(resampled.nrows(), new_labels.len());
        assert!(resampled.nrows() > 0);
        assert!(
            started.elapsed() < std::time::Duration::from_secs(30),
            "took {:?}",
            started.elapsed()
        );
    }
}
