//! Training Pipeline
//!
//! impute -> reject outliers -> stratified split -> scale (train only)
//! -> PCA when data is scarce -> bagged trees -> held-out accuracy.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::LearningConfig;
use crate::error::{EngineError, EngineResult};
use crate::features::FeatureVector;
use crate::ml_engine::dataset::{Dataset, Sample};
use crate::ml_engine::models::{BaggedTreeClassifier, BaggingParams};
use crate::ml_engine::outliers::IsolationForest;
use crate::ml_engine::pca::PcaReducer;
use crate::ml_engine::predictor::{ModelMetrics, ModelState, MODEL_FORMAT_VERSION};
use crate::ml_engine::preprocessing::{MedianImputer, StandardScaler};
use crate::types::OutcomeLabel;

pub struct TrainingPipeline {
    config: LearningConfig,
}

/// Train/validation index split
#[derive(Debug)]
struct Split {
    train: Vec<usize>,
    validation: Vec<usize>,
    stratified: bool,
}

impl TrainingPipeline {
    pub fn new(config: LearningConfig) -> Self {
        Self { config }
    }

    /// Fit a complete bundle. `generation` and `outcome_count` are recorded in it.
    pub fn train(
        &self,
        dataset: &Dataset,
        generation: u64,
        outcome_count: usize,
        now: DateTime<Utc>,
    ) -> EngineResult<ModelState> {
        let cfg = &self.config;
        if dataset.len() < cfg.min_training_samples {
            return Err(EngineError::InsufficientData {
                required: cfg.min_training_samples,
                available: dataset.len(),
            });
        }
        // A single class leaves nothing outside the majority to learn from
        if dataset.class_counts().len() < 2 {
            return Err(EngineError::InsufficientData {
                required: 1,
                available: 0,
            });
        }

        let width = FeatureVector::NUM_FEATURES;
        let raw_rows: Vec<Vec<f64>> = dataset.samples.iter().map(|s| s.features.clone()).collect();
        let imputer = MedianImputer::fit(&raw_rows, width);

        let mut samples: Vec<Sample> = dataset.samples.clone();
        for s in samples.iter_mut() {
            imputer.transform_row(&mut s.features);
        }

        let mut outliers_removed = 0;
        if samples.len() >= cfg.outlier_min_samples {
            let rows: Vec<Vec<f64>> = samples.iter().map(|s| s.features.clone()).collect();
            let mask = IsolationForest::new(cfg.outlier_contamination, cfg.seed).inlier_mask(&rows);
            let before = samples.len();
            samples = samples
                .into_iter()
                .zip(mask)
                .filter_map(|(s, keep)| keep.then_some(s))
                .collect();
            outliers_removed = before - samples.len();
        }

        let split = split_indices(&samples, cfg.validation_fraction, cfg.seed);
        let train: Vec<&Sample> = split.train.iter().map(|&i| &samples[i]).collect();
        let validation: Vec<&Sample> = split.validation.iter().map(|&i| &samples[i]).collect();

        let mut train_classes: Vec<OutcomeLabel> = train.iter().map(|s| s.label).collect();
        train_classes.sort();
        train_classes.dedup();
        if train_classes.len() < 2 {
            return Err(EngineError::InsufficientData {
                required: 1,
                available: 0,
            });
        }

        let train_rows: Vec<Vec<f64>> = train.iter().map(|s| s.features.clone()).collect();
        let scaler = StandardScaler::fit(&train_rows, width);
        let scale = |s: &Sample| {
            let mut row = s.features.clone();
            scaler.transform_row(&mut row);
            row
        };
        let mut x_train: Vec<Vec<f64>> = train.iter().map(|s| scale(s)).collect();
        let mut x_val: Vec<Vec<f64>> = validation.iter().map(|s| scale(s)).collect();

        let small = train.len() < cfg.small_sample_limit;
        let reducer = if small {
            PcaReducer::fit(&x_train, cfg.pca_variance)
        } else {
            None
        };
        if let Some(pca) = &reducer {
            x_train = x_train.iter().map(|r| pca.transform_row(r)).collect();
            x_val = x_val.iter().map(|r| pca.transform_row(r)).collect();
        }

        let depth = if small { cfg.shallow_depth } else { cfg.deep_depth };
        let y_train: Vec<i64> = train.iter().map(|s| s.label.class_id()).collect();
        let w_train: Vec<f64> = train.iter().map(|s| s.weight).collect();
        let classifier = BaggedTreeClassifier::fit(
            &x_train,
            &y_train,
            &w_train,
            &BaggingParams {
                n_estimators: cfg.n_estimators,
                max_depth: depth,
                seed: cfg.seed,
            },
        )?;

        let holdout_accuracy = if x_val.is_empty() {
            0.0
        } else {
            let proba = classifier.predict_proba(&x_val)?;
            let correct = proba
                .iter()
                .zip(validation.iter())
                .filter(|(p, s)| {
                    argmax_class(classifier.classes(), p) == Some(s.label.class_id())
                })
                .count();
            correct as f64 / x_val.len() as f64
        };

        let class_counts: BTreeMap<String, usize> = dataset
            .class_counts()
            .into_iter()
            .map(|(label, count)| (label.to_string(), count))
            .collect();

        debug!(
            stratified = split.stratified,
            train = train.len(),
            validation = validation.len(),
            outliers_removed,
            "Training split prepared"
        );

        let metrics = ModelMetrics {
            holdout_accuracy,
            total_samples: dataset.len(),
            train_samples: train.len(),
            validation_samples: validation.len(),
            outliers_removed,
            class_counts,
            pca_applied: reducer.is_some(),
            pca_components: reducer.as_ref().map(|p| p.output_dim()).unwrap_or(0),
            tree_depth: depth,
            n_trees: classifier.n_trees(),
            outcome_count,
        };

        let state = ModelState {
            version: MODEL_FORMAT_VERSION,
            generation,
            feature_names: FeatureVector::feature_names()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            imputer,
            scaler,
            reducer,
            classifier,
            metrics,
            trained_at: now,
        };
        state.validate()?;

        info!(
            accuracy = holdout_accuracy,
            samples = dataset.len(),
            pca = state.metrics.pca_applied,
            depth,
            "🎓 Model trained"
        );
        Ok(state)
    }
}

fn argmax_class(classes: &[i64], proba: &[f64]) -> Option<i64> {
    proba
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(&a.0)))
        .map(|(i, _)| classes[i])
}

/// Stratified split when every class has at least two samples, seeded random split otherwise
fn split_indices(samples: &[Sample], validation_fraction: f64, seed: u64) -> Split {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut by_class: BTreeMap<OutcomeLabel, Vec<usize>> = BTreeMap::new();
    for (i, s) in samples.iter().enumerate() {
        by_class.entry(s.label).or_default().push(i);
    }

    let stratified = by_class.values().all(|idx| idx.len() >= 2);
    let mut train = Vec::new();
    let mut validation = Vec::new();

    if stratified {
        for idx in by_class.values_mut() {
            idx.shuffle(&mut rng);
            let n_val = ((idx.len() as f64) * validation_fraction).round() as usize;
            let n_val = n_val.clamp(1, idx.len() - 1);
            validation.extend_from_slice(&idx[..n_val]);
            train.extend_from_slice(&idx[n_val..]);
        }
    } else {
        let mut idx: Vec<usize> = (0..samples.len()).collect();
        idx.shuffle(&mut rng);
        let n_val = ((samples.len() as f64) * validation_fraction).round() as usize;
        let n_val = n_val.clamp(1, samples.len().saturating_sub(1).max(1));
        validation.extend_from_slice(&idx[..n_val]);
        train.extend_from_slice(&idx[n_val..]);
    }

    train.sort_unstable();
    validation.sort_unstable();
    Split {
        train,
        validation,
        stratified,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Profit when feature 0 is high, loss when low, neutral in between
    pub(crate) fn synthetic_dataset(n: usize) -> Dataset {
        let now = Utc::now();
        let samples = (0..n)
            .map(|i| {
                let x = (i % 30) as f64;
                let label = if x < 10.0 {
                    OutcomeLabel::Loss
                } else if x < 20.0 {
                    OutcomeLabel::Neutral
                } else {
                    OutcomeLabel::Profit
                };
                let mut features = vec![0.0; FeatureVector::NUM_FEATURES];
                features[0] = x;
                features[1] = (i % 7) as f64;
                features[2] = if i % 11 == 0 { f64::NAN } else { x * 0.5 };
                Sample {
                    features,
                    label,
                    weight: 1.0,
                    timestamp: now,
                }
            })
            .collect();
        Dataset { samples }
    }

    #[test]
    fn test_too_few_samples() {
        let pipeline = TrainingPipeline::new(LearningConfig::default());
        let err = pipeline
            .train(&synthetic_dataset(20), 1, 20, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientData {
                required: 30,
                available: 20
            }
        ));
    }

    #[test]
    fn test_single_class_is_insufficient_data() {
        let mut ds = synthetic_dataset(60);
        for s in ds.samples.iter_mut() {
            s.label = OutcomeLabel::Neutral;
        }
        let pipeline = TrainingPipeline::new(LearningConfig::default());
        let err = pipeline.train(&ds, 1, 60, Utc::now()).unwrap_err();
        assert!(
            matches!(err, EngineError::InsufficientData { available: 0, .. }),
            "Expected InsufficientData, got {:?}",
            err
        );
        assert!(err.to_string().contains("samples"));
    }

    #[test]
    fn test_small_dataset_uses_pca_and_shallow_trees() {
        let pipeline = TrainingPipeline::new(LearningConfig::default());
        let state = pipeline
            .train(&synthetic_dataset(60), 1, 60, Utc::now())
            .unwrap();
        assert!(state.metrics.pca_applied);
        assert_eq!(state.metrics.tree_depth, 3);
        assert_eq!(state.metrics.outliers_removed, 6);
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_large_dataset_skips_pca_and_learns() {
        let pipeline = TrainingPipeline::new(LearningConfig::default());
        let state = pipeline
            .train(&synthetic_dataset(300), 2, 300, Utc::now())
            .unwrap();
        assert!(!state.metrics.pca_applied);
        assert_eq!(state.metrics.tree_depth, 5);
        assert!(
            state.metrics.holdout_accuracy > 0.8,
            "Expected >0.8 accuracy, got {}",
            state.metrics.holdout_accuracy
        );

        let mut fv = vec![0.0; FeatureVector::NUM_FEATURES];
        fv[0] = 28.0;
        fv[2] = 14.0;
        let prediction = state
            .predict(&FeatureVector::from_slice(&fv).unwrap())
            .unwrap();
        assert_eq!(prediction.class, OutcomeLabel::Profit);
        assert!(prediction.confidence > 0.5);
    }

    #[test]
    fn test_stratified_split_keeps_every_class_in_validation() {
        let ds = synthetic_dataset(90);
        let split = split_indices(&ds.samples, 0.2, 42);
        assert!(split.stratified);
        assert_eq!(split.train.len() + split.validation.len(), 90);
        for label in OutcomeLabel::ALL {
            assert!(split
                .validation
                .iter()
                .any(|&i| ds.samples[i].label == label));
        }
    }

    #[test]
    fn test_random_split_when_class_is_singleton() {
        let mut ds = synthetic_dataset(40);
        for s in ds.samples.iter_mut() {
            if s.label == OutcomeLabel::Neutral {
                s.label = OutcomeLabel::Loss;
            }
        }
        ds.samples[0].label = OutcomeLabel::Neutral;
        let split = split_indices(&ds.samples, 0.2, 42);
        assert!(!split.stratified);
        assert_eq!(split.validation.len(), 8);
    }
}
