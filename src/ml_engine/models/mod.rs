//! ML Models - Bagged decision trees on SmartCore
//!
//! Each tree is fit on a bootstrap resample drawn with probability proportional
//! to the sample weights, so recency weighting shapes the ensemble. Class
//! probabilities are the share of tree votes.

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_classifier::{
    DecisionTreeClassifier, DecisionTreeClassifierParameters,
};

use crate::error::{EngineError, EngineResult};

type Tree = DecisionTreeClassifier<f64, i64, DenseMatrix<f64>, Vec<i64>>;

/// Attempts at drawing a bootstrap sample that contains two classes
const RESAMPLE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct BaggingParams {
    pub n_estimators: usize,
    pub max_depth: u16,
    pub seed: u64,
}

#[derive(Serialize, Deserialize)]
pub struct BaggedTreeClassifier {
    trees: Vec<Tree>,
    /// Sorted class ids seen in training; probability vectors follow this order
    classes: Vec<i64>,
    n_features: usize,
    max_depth: u16,
}

impl std::fmt::Debug for BaggedTreeClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaggedTreeClassifier")
            .field("trees", &self.trees.len())
            .field("classes", &self.classes)
            .field("n_features", &self.n_features)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

fn to_matrix(rows: &[Vec<f64>]) -> EngineResult<DenseMatrix<f64>> {
    let refs: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
    DenseMatrix::from_2d_array(&refs)
        .map_err(|e| EngineError::Training(format!("matrix construction failed: {:?}", e)))
}

impl BaggedTreeClassifier {
    pub fn fit(
        x: &[Vec<f64>],
        y: &[i64],
        weights: &[f64],
        params: &BaggingParams,
    ) -> EngineResult<Self> {
        if x.is_empty() || x.len() != y.len() || y.len() != weights.len() {
            return Err(EngineError::Training(format!(
                "shape mismatch: {} rows, {} labels, {} weights",
                x.len(),
                y.len(),
                weights.len()
            )));
        }

        let mut classes: Vec<i64> = y.to_vec();
        classes.sort_unstable();
        classes.dedup();
        if classes.len() < 2 {
            return Err(EngineError::Training(
                "need at least two outcome classes".to_string(),
            ));
        }

        let sampler = WeightedIndex::new(weights)
            .map_err(|e| EngineError::Training(format!("invalid sample weights: {}", e)))?;
        let n = x.len();
        let tree_params = DecisionTreeClassifierParameters::default()
            .with_max_depth(params.max_depth)
            .with_min_samples_split(2)
            .with_min_samples_leaf(1);

        let mut trees = Vec::with_capacity(params.n_estimators);
        for t in 0..params.n_estimators {
            let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(t as u64));

            let mut drawn = None;
            for _ in 0..RESAMPLE_ATTEMPTS {
                let idx: Vec<usize> = (0..n).map(|_| sampler.sample(&mut rng)).collect();
                let first = y[idx[0]];
                if idx.iter().any(|&i| y[i] != first) {
                    drawn = Some(idx);
                    break;
                }
            }
            let Some(idx) = drawn else {
                continue;
            };

            let rows: Vec<Vec<f64>> = idx.iter().map(|&i| x[i].clone()).collect();
            let labels: Vec<i64> = idx.iter().map(|&i| y[i]).collect();
            let matrix = to_matrix(&rows)?;
            let tree = DecisionTreeClassifier::fit(&matrix, &labels, tree_params.clone())
                .map_err(|e| EngineError::Training(format!("tree {} failed: {:?}", t, e)))?;
            trees.push(tree);
        }

        if trees.is_empty() {
            return Err(EngineError::Training(
                "no bootstrap sample contained two classes".to_string(),
            ));
        }

        Ok(Self {
            trees,
            classes,
            n_features: x[0].len(),
            max_depth: params.max_depth,
        })
    }

    /// Vote shares per row, aligned with `classes()`
    pub fn predict_proba(&self, rows: &[Vec<f64>]) -> EngineResult<Vec<Vec<f64>>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(bad) = rows.iter().find(|r| r.len() != self.n_features) {
            return Err(EngineError::ModelBundle(format!(
                "expected {} features, got {}",
                self.n_features,
                bad.len()
            )));
        }

        let matrix = to_matrix(rows)?;
        let mut votes = vec![vec![0.0; self.classes.len()]; rows.len()];
        for tree in &self.trees {
            let predicted = tree
                .predict(&matrix)
                .map_err(|e| EngineError::Training(format!("tree prediction failed: {:?}", e)))?;
            for (row_votes, label) in votes.iter_mut().zip(predicted.iter()) {
                if let Ok(pos) = self.classes.binary_search(label) {
                    row_votes[pos] += 1.0;
                }
            }
        }

        let n_trees = self.trees.len() as f64;
        for row_votes in votes.iter_mut() {
            row_votes.iter_mut().for_each(|v| *v /= n_trees);
        }
        Ok(votes)
    }

    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}
