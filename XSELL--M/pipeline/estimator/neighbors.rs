#[cfg(test)]
use std::cell::Cell;
use std::{cmp::Ordering, collections::BinaryHeap};

use ndarray::{Array2, ArrayView1};

const LEAF_SIZE: usize = 16;

enum Node {
    Leaf {
        start: usize,
        end: usize,
    },
    Split {
        axis: usize,
        value: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f64,
    row: usize,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.row.cmp(&other.row))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// k-d tree over a subset of the rows of a feature matrix.
///
/// Queries return the `k` closest rows by squared euclidean distance, ties
/// broken by row index, so results match an exhaustive scan exactly.
pub struct KdTree<'a> {
    features: &'a Array2<f64>,
    rows: Vec<usize>,
    nodes: Vec<Node>,
    #[cfg(test)]
    evaluations: Cell<usize>,
}

impl<'a> KdTree<'a> {
    /// Indexes `pool`, a list of row indices into `features`.
    pub fn new(features: &'a Array2<f64>, pool: Vec<usize>) -> Self {
        let len = pool.len();
        let mut tree = Self {
            features,
            rows: pool,
            nodes: Vec::new(),
            #[cfg(test)]
            evaluations: Cell::new(0),
        };
        if len > 0 {
            tree.build(0, len);
        }
        tree
    }

    fn build(&mut self, start: usize, end: usize) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node::Leaf { start, end });
        if end - start <= LEAF_SIZE {
            return index;
        }
        let Some(axis) = self.widest_axis(start, end) else {
            return index;
        };
        let features = self.features;
        let mid = start + (end - start) / 2;
        self.rows[start..end].select_nth_unstable_by(mid - start, |a, b| {
            features[[*a, axis]].total_cmp(&features[[*b, axis]])
        });
        let value = features[[self.rows[mid], axis]];
        let left = self.build(start, mid);
        let right = self.build(mid, end);
        self.nodes[index] = Node::Split {
            axis,
            value,
            left,
            right,
        };
        index
    }

    /// Axis with the largest spread, `None` when every row is identical.
    fn widest_axis(&self, start: usize, end: usize) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for axis in 0..self.features.ncols() {
            let (low, high) = self.rows[start..end].iter().fold(
                (f64::INFINITY, f64::NEG_INFINITY),
                |(low, high), row| {
                    let value = self.features[[*row, axis]];
                    (low.min(value), high.max(value))
                },
            );
            let spread = high - low;
            if spread > 0.0 && !matches!(best, Some((_, widest)) if widest >= spread) {
                best = Some((axis, spread));
            }
        }
        best.map(|(axis, _)| axis)
    }

    /// Up to `k` indexed rows closest to `row`, nearest first. `row` itself is
    /// never returned.
    pub fn nearest(&self, row: usize, k: usize) -> Vec<usize> {
        if k == 0 || self.nodes.is_empty() {
            return Vec::new();
        }
        let origin = self.features.row(row);
        let mut heap = BinaryHeap::with_capacity(k + 1);
        self.search(0, origin, row, k, &mut heap);
        heap.into_sorted_vec()
            .into_iter()
            .map(|candidate| candidate.row)
            .collect()
    }

    fn search(
        &self,
        node: usize,
        origin: ArrayView1<'_, f64>,
        exclude: usize,
        k: usize,
        heap: &mut BinaryHeap<Candidate>,
    ) {
        match &self.nodes[node] {
            Node::Leaf { start, end } => {
                for row in &self.rows[*start..*end] {
                    if *row == exclude {
                        continue;
                    }
                    #[cfg(test)]
                    self.evaluations.set(self.evaluations.get() + 1);
                    let candidate = Candidate {
                        distance: squared_distance(origin, self.features.row(*row)),
                        row: *row,
                    };
                    if heap.len() < k {
                        heap.push(candidate);
                    } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                        heap.pop();
                        heap.push(candidate);
                    }
                }
            }
            Node::Split {
                axis,
                value,
                left,
                right,
            } => {
                let diff = origin[*axis] - value;
                let (near, far) = if diff <= 0.0 {
                    (*left, *right)
                } else {
                    (*right, *left)
                };
                self.search(near, origin, exclude, k, heap);
                let bound = diff * diff;
                if heap.len() < k || heap.peek().is_some_and(|worst| bound <= worst.distance) {
                    self.search(far, origin, exclude, k, heap);
                }
            }
        }
    }

    #[cfg(test)]
    fn evaluations(&self) -> usize {
        self.evaluations.get()
    }
}

/// Squared euclidean distance between two rows.
fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(0.0..1.0))
    }

    fn exhaustive(features: &Array2<f64>, pool: &[usize], row: usize, k: usize) -> Vec<usize> {
        let mut all = pool
            .iter()
            .filter(|candidate| **candidate != row)
            .map(|candidate| Candidate {
                distance: squared_distance(features.row(row), features.row(*candidate)),
                row: *candidate,
            })
            .collect::<Vec<_>>();
        all.sort();
        all.into_iter().take(k).map(|c| c.row).collect()
    }

    #[test]
    fn matches_exhaustive_search() {
        let features = random_matrix(500, 6, 3);
        let pool = (0..500).filter(|row| row % 3 != 0).collect::<Vec<_>>();
        let tree = KdTree::new(&features, pool.clone());
        for row in [0, 1, 2, 250, 499] {
            assert_eq!(tree.nearest(row, 5), exhaustive(&features, &pool, row, 5));
        }
    }

    #[test]
    fn duplicate_rows_resolve_by_index() {
        let features = Array2::from_elem((40, 3), 1.0);
        let tree = KdTree::new(&features, (0..40).collect());
        assert_eq!(tree.nearest(7, 3), vec![0, 1, 2]);
        assert!(tree.nearest(7, 0).is_empty());
    }

    fn evaluations_for(rows: usize) -> usize {
        let features = random_matrix(rows, 4, 17);
        let tree = KdTree::new(&features, (0..rows).collect());
        for row in 0..rows {
            tree.nearest(row, 3);
        }
        tree.evaluations()
    }

    #[test]
    fn work_grows_far_below_quadratically() {
        let small = evaluations_for(1_000);
        let large = evaluations_for(8_000);
        // An exhaustive scan does 64 times more work for 8 times the rows.
        assert!(large < small * 16, "small={small} large={large}");
        assert!(large < 8_000 * 8_000 / 20);
    }
}
