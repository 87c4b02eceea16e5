//! Isolation Forest
//!
//! Unsupervised outlier model over behavior feature vectors. Anomalies are
//! isolated by fewer random splits, so a short mean path length across the
//! trees means a high score:
//!
//! ```text
//! score(x) = 2 ^ (-E[h(x)] / c(psi))
//! ```
//!
//! where `psi` is the per-tree subsample size and `c(n)` the average path
//! length of an unsuccessful binary search tree lookup over `n` points.
//! Scores near 1 are anomalous; around 0.5 or below is normal traffic.
//!
//! Trees are stored as flat node arenas so a trained forest serializes to a
//! plain JSON document.

use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::behavior::{FeatureVector, FEATURE_COUNT};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Tree node. Children are indices into the owning tree's node list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn build<R: Rng>(samples: &[FeatureVector], height_limit: usize, rng: &mut R) -> Self {
        let mut nodes = Vec::new();
        let mut indices: Vec<usize> = (0..samples.len()).collect();
        Self::grow(&mut nodes, samples, &mut indices, 0, height_limit, rng);
        Self { nodes }
    }

    /// Append the subtree for `indices` and return its root index
    fn grow<R: Rng>(
        nodes: &mut Vec<Node>,
        samples: &[FeatureVector],
        indices: &mut [usize],
        depth: usize,
        height_limit: usize,
        rng: &mut R,
    ) -> usize {
        let id = nodes.len();
        nodes.push(Node::Leaf { size: indices.len() });

        if depth >= height_limit || indices.len() <= 1 {
            return id;
        }

        // Only features that still vary can split this partition
        let candidates: Vec<(usize, f64, f64)> = (0..FEATURE_COUNT)
            .filter_map(|f| {
                let (min, max) = indices.iter().fold((f64::MAX, f64::MIN), |(lo, hi), &i| {
                    (lo.min(samples[i][f]), hi.max(samples[i][f]))
                });
                (max > min).then_some((f, min, max))
            })
            .collect();
        if candidates.is_empty() {
            return id;
        }

        let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(min..max);

        // Partition in place: values below the threshold go left
        let mut split = 0;
        for k in 0..indices.len() {
            if samples[indices[k]][feature] < threshold {
                indices.swap(k, split);
                split += 1;
            }
        }
        let (left_part, right_part) = indices.split_at_mut(split);

        let left = Self::grow(nodes, samples, left_part, depth + 1, height_limit, rng);
        let right = Self::grow(nodes, samples, right_part, depth + 1, height_limit, rng);
        nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    fn path_length(&self, x: &FeatureVector) -> f64 {
        let mut id = 0;
        let mut depth = 0.0;
        loop {
            match self.nodes.get(id) {
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    id = if x[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
                Some(Node::Leaf { size }) => return depth + average_path_length(*size),
                None => return depth,
            }
        }
    }

    /// Structural check for deserialized trees: every child index points
    /// forward to an existing node and every feature is in range.
    fn is_well_formed(&self) -> bool {
        if self.nodes.is_empty() {
            return false;
        }
        self.nodes.iter().enumerate().all(|(id, node)| match node {
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                *feature < FEATURE_COUNT
                    && threshold.is_finite()
                    && *left > id
                    && *right > id
                    && *left < self.nodes.len()
                    && *right < self.nodes.len()
            }
            Node::Leaf { .. } => true,
        })
    }
}

/// Trained isolation forest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    subsample_size: usize,
}

impl IsolationForest {
    /// Fit `trees` isolation trees, each on a random subsample of `samples`
    pub fn train<R: Rng>(
        samples: &[FeatureVector],
        trees: usize,
        subsample_size: usize,
        rng: &mut R,
    ) -> Self {
        let psi = subsample_size.min(samples.len()).max(1);
        let height_limit = (psi as f64).log2().ceil() as usize;

        let trees = (0..trees)
            .map(|_| {
                let subsample: Vec<FeatureVector> = if samples.is_empty() {
                    Vec::new()
                } else {
                    index::sample(rng, samples.len(), psi)
                        .into_iter()
                        .map(|i| samples[i])
                        .collect()
                };
                IsolationTree::build(&subsample, height_limit, rng)
            })
            .collect();

        Self {
            trees,
            subsample_size: psi,
        }
    }

    /// Anomaly score in [0, 1]
    pub fn score(&self, x: &FeatureVector) -> f64 {
        let c = average_path_length(self.subsample_size);
        if self.trees.is_empty() || c <= 0.0 {
            return 0.5;
        }
        let mean: f64 =
            self.trees.iter().map(|t| t.path_length(x)).sum::<f64>() / self.trees.len() as f64;
        2f64.powf(-mean / c).clamp(0.0, 1.0)
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn subsample_size(&self) -> usize {
        self.subsample_size
    }

    pub(crate) fn is_well_formed(&self) -> bool {
        !self.trees.is_empty() && self.trees.iter().all(IsolationTree::is_well_formed)
    }
}

/// c(n): average path length of an unsuccessful BST search over n points
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}
