//! ML Engine - Self-learning outcome classifier
//!
//! This module implements:
//! - Weighted datasets from closed trades (and a cold-start set from candles)
//! - Median imputation, isolation-forest outlier rejection, scaling and PCA
//! - Bagged decision trees with vote-share probabilities
//! - A single versioned `ModelState` bundle, persisted and swapped as a unit
//! - The adaptive retraining scheduler

pub mod dataset;
pub mod models;
pub mod outliers;
pub mod pca;
pub mod persistence;
pub mod predictor;
pub mod preprocessing;
pub mod scheduler;
pub mod training;

pub use dataset::{recency_weight, Dataset, Sample};
pub use models::{BaggedTreeClassifier, BaggingParams};
pub use persistence::ModelStore;
pub use predictor::{ModelHandle, ModelMetrics, ModelState, Prediction};
pub use scheduler::{InstalledModel, LearningSnapshot, RetrainScheduler, RetrainTrigger};
pub use training::TrainingPipeline;
