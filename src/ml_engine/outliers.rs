//! Outlier rejection with an isolation forest
//!
//! Samples that random axis-aligned splits isolate quickly get a high anomaly
//! score. The most anomalous `contamination` share is dropped before training.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

struct IsolationTree {
    root: Node,
}

impl IsolationTree {
    fn build(rows: &[Vec<f64>], indices: Vec<usize>, max_depth: usize, rng: &mut StdRng) -> Self {
        Self {
            root: Self::build_node(rows, indices, 0, max_depth, rng),
        }
    }

    fn build_node(
        rows: &[Vec<f64>],
        indices: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> Node {
        let n = indices.len();
        if depth >= max_depth || n <= 1 {
            return Node::Leaf { size: n };
        }

        let n_features = rows[indices[0]].len();
        let feature = rng.gen_range(0..n_features);
        let (min_val, max_val) = indices
            .iter()
            .map(|&i| rows[i][feature])
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));

        if !(max_val - min_val).is_finite() || (max_val - min_val).abs() < 1e-10 {
            return Node::Leaf { size: n };
        }

        let threshold = rng.gen_range(min_val..max_val);
        let (left, right): (Vec<usize>, Vec<usize>) =
            indices.into_iter().partition(|&i| rows[i][feature] < threshold);

        if left.is_empty() || right.is_empty() {
            return Node::Leaf { size: n };
        }

        Node::Split {
            feature,
            threshold,
            left: Box::new(Self::build_node(rows, left, depth + 1, max_depth, rng)),
            right: Box::new(Self::build_node(rows, right, depth + 1, max_depth, rng)),
        }
    }

    fn path_length(&self, sample: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0usize;
        loop {
            match node {
                Node::Leaf { size } => return depth as f64 + average_path(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if sample[*feature] < *threshold { left } else { right };
                    depth += 1;
                }
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` items
fn average_path(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + 0.577_215_664_9) - 2.0 * (n - 1.0) / n
        }
    }
}

pub struct IsolationForest {
    pub n_estimators: usize,
    pub max_samples: usize,
    pub contamination: f64,
    pub seed: u64,
}

impl IsolationForest {
    pub fn new(contamination: f64, seed: u64) -> Self {
        Self {
            n_estimators: 100,
            max_samples: 256,
            contamination,
            seed,
        }
    }

    /// Anomaly score per row in (0, 1]; higher is more anomalous
    pub fn score(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        let n = rows.len();
        if n < 2 {
            return vec![0.0; n];
        }
        let sample_size = self.max_samples.min(n);
        let max_depth = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let all: Vec<usize> = (0..n).collect();

        let trees: Vec<IsolationTree> = (0..self.n_estimators)
            .map(|_| {
                let subset: Vec<usize> = all
                    .choose_multiple(&mut rng, sample_size)
                    .copied()
                    .collect();
                IsolationTree::build(rows, subset, max_depth, &mut rng)
            })
            .collect();

        let norm = average_path(sample_size);
        rows.iter()
            .map(|row| {
                let mean_path =
                    trees.iter().map(|t| t.path_length(row)).sum::<f64>() / trees.len() as f64;
                if norm > 0.0 {
                    2f64.powf(-mean_path / norm)
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// `true` for rows kept as inliers. Exactly `floor(n * contamination)` rows are rejected.
    pub fn inlier_mask(&self, rows: &[Vec<f64>]) -> Vec<bool> {
        let n = rows.len();
        let reject = ((n as f64) * self.contamination).floor() as usize;
        let mut mask = vec![true; n];
        if reject == 0 {
            return mask;
        }

        let scores = self.score(rows);
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
        for &i in order.iter().take(reject) {
            mask[i] = false;
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_obvious_outlier() {
        let mut rows: Vec<Vec<f64>> = (0..49)
            .map(|i| vec![(i % 7) as f64 * 0.1, (i % 5) as f64 * 0.1])
            .collect();
        rows.push(vec![50.0, -50.0]);

        let forest = IsolationForest::new(0.1, 42);
        let scores = forest.score(&rows);
        let max_idx = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(max_idx, 49);

        let mask = forest.inlier_mask(&rows);
        assert!(!mask[49]);
        assert_eq!(mask.iter().filter(|keep| !**keep).count(), 5);
    }

    #[test]
    fn test_seeded_is_deterministic() {
        let rows: Vec<Vec<f64>> = (0..40).map(|i| vec![i as f64, (i * i) as f64]).collect();
        let forest = IsolationForest::new(0.1, 7);
        assert_eq!(forest.score(&rows), forest.score(&rows));
    }
}
