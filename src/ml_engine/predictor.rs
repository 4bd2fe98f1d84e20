//! Model bundle and the handle the engine predicts through
//!
//! `ModelState` carries every fitted transform together with the classifier so
//! they can only be swapped as a unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::features::FeatureVector;
use crate::ml_engine::models::BaggedTreeClassifier;
use crate::ml_engine::pca::PcaReducer;
use crate::ml_engine::preprocessing::{MedianImputer, StandardScaler};
use crate::types::OutcomeLabel;

/// Bundle format version
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Classifier output for one feature vector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub class: OutcomeLabel,
    /// Probability of the profit class
    pub confidence: f64,
    /// Indexed by `OutcomeLabel::class_id`
    pub probabilities: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub holdout_accuracy: f64,
    pub total_samples: usize,
    pub train_samples: usize,
    pub validation_samples: usize,
    pub outliers_removed: usize,
    pub class_counts: BTreeMap<String, usize>,
    pub pca_applied: bool,
    pub pca_components: usize,
    pub tree_depth: u16,
    pub n_trees: usize,
    /// Outcome store size when this model was trained
    pub outcome_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelState {
    pub version: u32,
    /// Increments with every installed model
    pub generation: u64,
    pub feature_names: Vec<String>,
    pub imputer: MedianImputer,
    pub scaler: StandardScaler,
    pub reducer: Option<PcaReducer>,
    pub classifier: BaggedTreeClassifier,
    pub metrics: ModelMetrics,
    pub trained_at: DateTime<Utc>,
}

impl ModelState {
    /// Apply imputation, scaling and the optional reduction to one raw row
    pub fn transform(&self, raw: &[f64]) -> Vec<f64> {
        let mut row = raw.to_vec();
        self.imputer.transform_row(&mut row);
        self.scaler.transform_row(&mut row);
        match &self.reducer {
            Some(pca) => pca.transform_row(&row),
            None => row,
        }
    }

    pub fn predict(&self, features: &FeatureVector) -> EngineResult<Prediction> {
        let row = self.transform(&features.to_vec());
        let proba = self.classifier.predict_proba(&[row])?;
        let row_proba = proba
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ModelBundle("empty prediction".to_string()))?;

        let mut probabilities = [0.0; 3];
        for (class_id, p) in self.classifier.classes().iter().zip(row_proba.iter()) {
            if let Some(label) = OutcomeLabel::from_class_id(*class_id) {
                probabilities[label.class_id() as usize] = *p;
            }
        }

        // Ties resolve toward the more conservative class
        let mut class = OutcomeLabel::Loss;
        for label in OutcomeLabel::ALL {
            if probabilities[label.class_id() as usize] > probabilities[class.class_id() as usize] {
                class = label;
            }
        }

        Ok(Prediction {
            class,
            confidence: probabilities[OutcomeLabel::Profit.class_id() as usize],
            probabilities,
        })
    }

    /// Check that the bundled parts fit together
    pub fn validate(&self) -> EngineResult<()> {
        if self.version != MODEL_FORMAT_VERSION {
            return Err(EngineError::ModelBundle(format!(
                "unsupported format version {}",
                self.version
            )));
        }
        let width = self.feature_names.len();
        if width != FeatureVector::NUM_FEATURES {
            return Err(EngineError::ModelBundle(format!(
                "bundle has {} features, extractor produces {}",
                width,
                FeatureVector::NUM_FEATURES
            )));
        }
        if self.imputer.n_features() != width || self.scaler.n_features() != width {
            return Err(EngineError::ModelBundle(format!(
                "imputer/scaler width {}/{} does not match {} features",
                self.imputer.n_features(),
                self.scaler.n_features(),
                width
            )));
        }
        let classifier_width = match (&self.reducer, self.metrics.pca_applied) {
            (Some(pca), true) => {
                if pca.input_dim() != width {
                    return Err(EngineError::ModelBundle(format!(
                        "reducer expects {} inputs, scaler produces {}",
                        pca.input_dim(),
                        width
                    )));
                }
                pca.output_dim()
            }
            (None, false) => width,
            (Some(_), false) => {
                return Err(EngineError::ModelBundle(
                    "reducer present but metrics say PCA was not applied".to_string(),
                ))
            }
            (None, true) => {
                return Err(EngineError::ModelBundle(
                    "metrics say PCA was applied but reducer is missing".to_string(),
                ))
            }
        };
        if self.classifier.n_features() != classifier_width {
            return Err(EngineError::ModelBundle(format!(
                "classifier expects {} inputs, transforms produce {}",
                self.classifier.n_features(),
                classifier_width
            )));
        }
        if !self.metrics.holdout_accuracy.is_finite() {
            return Err(EngineError::ModelBundle(
                "held-out accuracy is not finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared, atomically replaced model
#[derive(Default)]
pub struct ModelHandle {
    current: RwLock<Option<Arc<ModelState>>>,
}

impl ModelHandle {
    pub fn new(initial: Option<ModelState>) -> Self {
        Self {
            current: RwLock::new(initial.map(Arc::new)),
        }
    }

    /// Snapshot of the installed model; stays valid across a concurrent swap
    pub fn current(&self) -> Option<Arc<ModelState>> {
        self.current.read().ok().and_then(|m| m.clone())
    }

    pub fn is_trained(&self) -> bool {
        self.current().is_some()
    }

    /// Validate and swap in a new model. The previous one keeps serving on failure.
    pub fn install(&self, state: ModelState) -> EngineResult<Arc<ModelState>> {
        state.validate()?;
        let state = Arc::new(state);
        let mut guard = self
            .current
            .write()
            .map_err(|_| EngineError::ModelBundle("model lock poisoned".to_string()))?;
        *guard = Some(state.clone());
        info!(
            generation = state.generation,
            accuracy = state.metrics.holdout_accuracy,
            samples = state.metrics.total_samples,
            "🧠 Model installed"
        );
        Ok(state)
    }

    pub fn predict(&self, features: &FeatureVector) -> EngineResult<Prediction> {
        let model = self.current().ok_or(EngineError::ModelNotTrained)?;
        model.predict(features)
    }

    pub fn generation(&self) -> u64 {
        self.current().map(|m| m.generation).unwrap_or(0)
    }
}
