use ndarray::{Array1, Array2, ArrayView1};
use rand::{rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Node impurity measure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitCriterion {
    /// Gini impurity.
    #[default]
    Gini,
    /// Shannon entropy.
    Entropy,
}

impl SplitCriterion {
    fn impurity(self, positives: usize, total: usize) -> f64 {
        if total == 0 {
            return 0.0;
        }
        let p = to_f64(positives) / to_f64(total);
        let q = 1.0 - p;
        match self {
            Self::Gini => 1.0 - p.mul_add(p, q * q),
            Self::Entropy => -(plogp(p) + plogp(q)),
        }
    }
}

/// Forest hyper-parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestParams {
    /// Number of trees.
    pub n_estimators: usize,
    /// Minimum samples a node needs before it may split.
    pub min_samples_split: usize,
    /// Minimum samples each child of a split must keep.
    pub min_samples_leaf: usize,
    /// Depth limit; unbounded when `None`.
    pub max_depth: Option<usize>,
    /// Impurity measure.
    pub criterion: SplitCriterion,
    /// Seed for bootstrap and feature sampling.
    pub random_state: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_depth: None,
            criterion: SplitCriterion::Gini,
            random_state: 0,
        }
    }
}

/// Failures while fitting or applying the classifier.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// No training rows.
    #[error("training set is empty")]
    EmptyTrainingSet,
    /// Labels and rows disagree, or the input width differs from the fit.
    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch {
        /// Expected length.
        expected: usize,
        /// Actual length.
        found: usize,
    },
    /// A label other than 0 or 1.
    #[error("label {0} is not binary")]
    NonBinaryLabel(f64),
    /// The fitted model does not reach the accuracy floor on its own data.
    #[error("No best model found with score more than base score: training accuracy {accuracy:.4} < expected {expected:.4}")]
    BaselineNotMet {
        /// Training-set accuracy.
        accuracy: f64,
        /// Configured floor.
        expected: f64,
    },
    /// Every training label is the same class.
    #[error("No best model found with score more than base score: every training label is {0}")]
    DegenerateLabels(u8),
}

impl TrainingError {
    /// Whether the model was rejected for not beating the baseline.
    #[must_use]
    pub const fn is_baseline_failure(&self) -> bool {
        matches!(self, Self::BaselineNotMet { .. } | Self::DegenerateLabels(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Leaf {
        probability: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// Binary decision tree stored as a flat node arena; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn probability(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(Node::Leaf { probability }) => return *probability,
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    idx = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
                None => return 0.0,
            }
        }
    }
}

struct SplitChoice {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

struct TreeBuilder<'a> {
    features: &'a Array2<f64>,
    labels: &'a [u8],
    params: &'a ForestParams,
    max_features: usize,
}

impl TreeBuilder<'_> {
    fn build(&self, sample_rows: Vec<usize>, rng: &mut SmallRng) -> Tree {
        let mut nodes = vec![Node::Leaf { probability: 0.0 }];
        let mut pending = vec![(0_usize, sample_rows, 0_usize)];
        while let Some((slot, rows, depth)) = pending.pop() {
            let positives = rows.iter().filter(|row| self.labels[**row] == 1).count();
            let probability = to_f64(positives) / to_f64(rows.len().max(1));
            nodes[slot] = Node::Leaf { probability };

            let depth_open = self.params.max_depth.map_or(true, |limit| depth < limit);
            let pure = positives == 0 || positives == rows.len();
            if !depth_open
                || pure
                || rows.len() < self.params.min_samples_split
                || rows.len() < 2 * self.params.min_samples_leaf
            {
                continue;
            }
            let Some(choice) = self.best_split(&rows, positives, rng) else {
                continue;
            };
            let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
                .into_iter()
                .partition(|row| self.features[[*row, choice.feature]] <= choice.threshold);
            let left = nodes.len();
            let right = left + 1;
            nodes.push(Node::Leaf { probability: 0.0 });
            nodes.push(Node::Leaf { probability: 0.0 });
            nodes[slot] = Node::Split {
                feature: choice.feature,
                threshold: choice.threshold,
                left,
                right,
            };
            pending.push((left, left_rows, depth + 1));
            pending.push((right, right_rows, depth + 1));
        }
        Tree { nodes }
    }

    fn best_split(
        &self,
        rows: &[usize],
        positives: usize,
        rng: &mut SmallRng,
    ) -> Option<SplitChoice> {
        let total = rows.len();
        let parent = self.params.criterion.impurity(positives, total);
        let min_leaf = self.params.min_samples_leaf.max(1);
        let mut best: Option<SplitChoice> = None;
        let mut candidates = (0..self.features.ncols()).collect::<Vec<_>>();
        candidates.shuffle(rng);
        let mut ordered = rows.to_vec();
        // Keeps drawing features past the budget until a valid split exists.
        for (inspected, feature) in candidates.into_iter().enumerate() {
            if inspected >= self.max_features && best.is_some() {
                break;
            }
            ordered.sort_by(|a, b| {
                self.features[[*a, feature]].total_cmp(&self.features[[*b, feature]])
            });
            let mut left_pos = 0_usize;
            for split_at in 1..total {
                let prev = ordered[split_at - 1];
                if self.labels[prev] == 1 {
                    left_pos += 1;
                }
                if split_at < min_leaf || total - split_at < min_leaf {
                    continue;
                }
                let low = self.features[[prev, feature]];
                let high = self.features[[ordered[split_at], feature]];
                if high <= low {
                    continue;
                }
                let left = self.params.criterion.impurity(left_pos, split_at);
                let right = self
                    .params
                    .criterion
                    .impurity(positives - left_pos, total - split_at);
                let weighted =
                    (to_f64(split_at) * left + to_f64(total - split_at) * right) / to_f64(total);
                if weighted < parent - 1e-12
                    && best.as_ref().map_or(true, |choice| weighted < choice.impurity)
                {
                    best = Some(SplitChoice {
                        feature,
                        threshold: low + (high - low) / 2.0,
                        impurity: weighted,
                    });
                }
            }
        }
        best
    }
}

/// Bagged ensemble of CART trees over binary labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    params: ForestParams,
    n_features: usize,
    trees: Vec<Tree>,
}

impl RandomForest {
    /// Fits a forest on `features` (one row per sample) and `labels` in `{0, 1}`.
    ///
    /// Each tree sees a bootstrap sample of the rows and considers
    /// `sqrt(n_features)` randomly chosen features at every split.
    pub fn fit(
        params: &ForestParams,
        features: &Array2<f64>,
        labels: &Array1<f64>,
    ) -> Result<Self, TrainingError> {
        let rows = features.nrows();
        if rows == 0 || features.ncols() == 0 {
            return Err(TrainingError::EmptyTrainingSet);
        }
        if labels.len() != rows {
            return Err(TrainingError::ShapeMismatch {
                expected: rows,
                found: labels.len(),
            });
        }
        let labels = binary_labels(labels)?;
        let n_features = features.ncols();
        let builder = TreeBuilder {
            features,
            labels: &labels,
            params,
            max_features: max_features(n_features),
        };
        let trees = (0..params.n_estimators.max(1))
            .map(|tree_idx| {
                let mut rng =
                    SmallRng::seed_from_u64(params.random_state.wrapping_add(tree_idx as u64));
                let bootstrap = (0..rows).map(|_| rng.gen_range(0..rows)).collect();
                builder.build(bootstrap, &mut rng)
            })
            .collect();
        Ok(Self {
            params: params.clone(),
            n_features,
            trees,
        })
    }

    /// Number of input features the forest was fitted on.
    #[must_use]
    pub const fn n_features(&self) -> usize {
        self.n_features
    }

    /// Mean positive-class probability per row.
    pub fn predict_proba(&self, features: &Array2<f64>) -> Result<Array1<f64>, TrainingError> {
        if features.ncols() != self.n_features {
            return Err(TrainingError::ShapeMismatch {
                expected: self.n_features,
                found: features.ncols(),
            });
        }
        let count = to_f64(self.trees.len().max(1));
        Ok(features
            .rows()
            .into_iter()
            .map(|row| {
                self.trees
                    .iter()
                    .map(|tree| tree.probability(row))
                    .sum::<f64>()
                    / count
            })
            .collect())
    }

    /// Class per row: `1` when the mean probability exceeds one half.
    pub fn predict(&self, features: &Array2<f64>) -> Result<Vec<u8>, TrainingError> {
        Ok(self
            .predict_proba(features)?
            .iter()
            .map(|probability| u8::from(*probability > 0.5))
            .collect())
    }
}

/// Converts a label vector to `{0, 1}` bytes.
pub fn binary_labels(labels: &Array1<f64>) -> Result<Vec<u8>, TrainingError> {
    labels
        .iter()
        .map(|label| {
            if label.abs() < f64::EPSILON {
                Ok(0)
            } else if (label - 1.0).abs() < f64::EPSILON {
                Ok(1)
            } else {
                Err(TrainingError::NonBinaryLabel(*label))
            }
        })
        .collect()
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn max_features(n_features: usize) -> usize {
    ((n_features as f64).sqrt() as usize).clamp(1, n_features)
}

#[allow(clippy::cast_precision_loss)]
const fn to_f64(value: usize) -> f64 {
    value as f64
}

fn plogp(p: f64) -> f64 {
    if p > 0.0 {
        p * p.log2()
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn separable() -> (Array2<f64>, Array1<f64>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for idx in 0..40 {
            let positive = idx % 2 == 0;
            let base = if positive { 5.0 } else { -5.0 };
            rows.extend([base + f64::from(idx % 7) * 0.1, f64::from(idx % 3)]);
            labels.push(if positive { 1.0 } else { 0.0 });
        }
        (
            Array2::from_shape_vec((40, 2), rows).unwrap(),
            Array1::from(labels),
        )
    }

    fn params() -> ForestParams {
        ForestParams {
            n_estimators: 10,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_depth: Some(4),
            criterion: SplitCriterion::Entropy,
            random_state: 101,
        }
    }

    #[test]
    fn learns_separable_data() {
        let (features, labels) = separable();
        let forest = RandomForest::fit(&params(), &features, &labels).unwrap();
        let predicted = forest.predict(&features).unwrap();
        let expected = binary_labels(&labels).unwrap();
        assert_eq!(predicted, expected);
        assert_eq!(forest.n_features(), 2);
    }

    #[test]
    fn fit_is_reproducible_for_a_seed() {
        let (features, labels) = separable();
        let first = RandomForest::fit(&params(), &features, &labels).unwrap();
        let second = RandomForest::fit(&params(), &features, &labels).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn survives_json_round_trip() {
        let (features, labels) = separable();
        let forest = RandomForest::fit(&params(), &features, &labels).unwrap();
        let decoded: RandomForest =
            serde_json::from_str(&serde_json::to_string(&forest).unwrap()).unwrap();
        assert_eq!(
            decoded.predict_proba(&features).unwrap(),
            forest.predict_proba(&features).unwrap()
        );
    }

    #[test]
    fn rejects_bad_inputs() {
        let features = array![[1.0], [2.0]];
        assert!(matches!(
            RandomForest::fit(&params(), &features, &array![0.0, 2.0]),
            Err(TrainingError::NonBinaryLabel(_))
        ));
        assert!(matches!(
            RandomForest::fit(&params(), &features, &array![0.0]),
            Err(TrainingError::ShapeMismatch { .. })
        ));
        let forest = RandomForest::fit(&params(), &features, &array![0.0, 1.0]).unwrap();
        assert!(forest.predict(&array![[1.0, 2.0]]).is_err());
    }

    #[test]
    fn impurity_is_zero_for_pure_nodes() {
        assert!(SplitCriterion::Entropy.impurity(5, 5).abs() < f64::EPSILON);
        assert!((SplitCriterion::Entropy.impurity(2, 4) - 1.0).abs() < 1e-12);
        assert!((SplitCriterion::Gini.impurity(2, 4) - 0.5).abs() < 1e-12);
    }
}
