//! Dataset - Weighted training samples built from closed trades
//!
//! Recent trades weigh more: `w = max(exp(-decay * age_days), floor)`, with age
//! measured from the newest record in the window.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::config::LearningConfig;
use crate::features::{extract_features, FeatureVector, MIN_CANDLES};
use crate::types::{Candle, OutcomeLabel, TradeRecord};

/// One labeled, weighted sample
#[derive(Debug, Clone)]
pub struct Sample {
    pub features: Vec<f64>,
    pub label: OutcomeLabel,
    pub weight: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub samples: Vec<Sample>,
}

/// Recency weight for a sample `age_days` old. Non-increasing in age, never below `floor`.
pub fn recency_weight(age_days: f64, decay: f64, floor: f64) -> f64 {
    (-decay * age_days.max(0.0)).exp().max(floor)
}

impl Dataset {
    /// Build from the outcome store window. Records without entry features are skipped.
    pub fn from_trades(records: &[TradeRecord], cfg: &LearningConfig) -> Self {
        let newest = match records.iter().map(|r| r.timestamp).max() {
            Some(ts) => ts,
            None => return Self::default(),
        };

        let samples = records
            .iter()
            .filter_map(|r| {
                let features = r.features.as_ref()?;
                let age_days = (newest - r.timestamp).num_seconds() as f64 / 86_400.0;
                Some(Sample {
                    features: features.to_vec(),
                    label: r.label,
                    weight: recency_weight(age_days, cfg.recency_decay, cfg.recency_floor),
                    timestamp: r.timestamp,
                })
            })
            .collect();

        Self { samples }
    }

    /// Cold-start dataset from candle history: each window is labeled by the
    /// return of the candle that follows it. All weights are 1.
    pub fn from_candle_history(candles: &[Candle], window: usize, cfg: &LearningConfig) -> Self {
        let window = window.max(MIN_CANDLES);
        let mut samples = Vec::new();

        for end in MIN_CANDLES..candles.len() {
            let start = end.saturating_sub(window);
            let Ok(features) = extract_features(&candles[start..end]) else {
                continue;
            };
            let prev_close = candles[end - 1].close;
            if prev_close <= 0.0 {
                continue;
            }
            let forward_return = (candles[end].close - prev_close) / prev_close;
            samples.push(Sample {
                features: features.to_vec(),
                label: OutcomeLabel::from_return(forward_return, cfg.label_threshold),
                weight: 1.0,
                timestamp: candles[end].timestamp,
            });
        }

        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn class_counts(&self) -> BTreeMap<OutcomeLabel, usize> {
        let mut counts = BTreeMap::new();
        for s in &self.samples {
            *counts.entry(s.label).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExitReason;
    use chrono::Duration;

    fn record(days_ago: i64, ret: f64, now: DateTime<Utc>) -> TradeRecord {
        let ts = now - Duration::days(days_ago);
        TradeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            instrument: "ETH".into(),
            entry_price: 100.0,
            exit_price: 100.0 * (1.0 + ret),
            entry_time: ts,
            exit_time: ts,
            quantity: 1.0,
            realized_return: ret,
            features: FeatureVector::from_slice(&[1.0; FeatureVector::NUM_FEATURES]),
            label: OutcomeLabel::from_return(ret, 0.005),
            exit_reason: ExitReason::TargetProfit,
            predicted: None,
            confidence: 0.0,
            timestamp: ts,
        }
    }

    #[test]
    fn test_recency_weight_monotone_and_floored() {
        let mut prev = f64::INFINITY;
        for day in 0..400 {
            let w = recency_weight(day as f64, 0.02, 0.1);
            assert!(w <= prev, "weight increased at day {}", day);
            assert!(w >= 0.1);
            prev = w;
        }
        assert_eq!(recency_weight(0.0, 0.02, 0.1), 1.0);
        assert_eq!(recency_weight(1000.0, 0.02, 0.1), 0.1);
    }

    #[test]
    fn test_weights_relative_to_newest() {
        let now = Utc::now();
        let records = vec![record(10, 0.01, now), record(0, -0.01, now)];
        let ds = Dataset::from_trades(&records, &LearningConfig::default());
        assert_eq!(ds.len(), 2);
        assert!((ds.samples[1].weight - 1.0).abs() < 1e-12);
        let expected = (-0.02f64 * 10.0).exp();
        assert!((ds.samples[0].weight - expected).abs() < 1e-9);
    }

    #[test]
    fn test_records_without_features_skipped() {
        let now = Utc::now();
        let mut r = record(1, 0.02, now);
        r.features = None;
        let ds = Dataset::from_trades(&[r, record(0, 0.02, now)], &LearningConfig::default());
        assert_eq!(ds.len(), 1);
    }
}
