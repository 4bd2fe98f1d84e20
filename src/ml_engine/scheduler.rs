//! Adaptive Retraining Scheduler
//!
//! Decides when the outcome store has drifted far enough from the installed
//! model to refit. Pure: the engine gathers a `LearningSnapshot` and asks.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::LearningConfig;
use crate::types::TradeRecord;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RetrainTrigger {
    /// No model installed and enough outcomes to train one
    ColdStart { samples: usize },
    AccuracyDrop { baseline: f64, live: f64 },
    WinRateDrop { all_time: f64, recent: f64 },
    ModelAge { hours: i64 },
    /// A historical replay cleared its win rate and payoff floors
    BacktestValidated { trades: usize },
    Manual,
}

impl std::fmt::Display for RetrainTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrainTrigger::ColdStart { samples } => write!(f, "cold start ({} samples)", samples),
            RetrainTrigger::AccuracyDrop { baseline, live } => {
                write!(f, "accuracy drop {:.3} -> {:.3}", baseline, live)
            }
            RetrainTrigger::WinRateDrop { all_time, recent } => {
                write!(f, "win rate drop {:.3} -> {:.3}", all_time, recent)
            }
            RetrainTrigger::ModelAge { hours } => write!(f, "model age {}h", hours),
            RetrainTrigger::BacktestValidated { trades } => {
                write!(f, "backtest validated over {} trades", trades)
            }
            RetrainTrigger::Manual => write!(f, "manual"),
        }
    }
}

/// What the scheduler needs to know about the installed model
#[derive(Debug, Clone)]
pub struct InstalledModel {
    pub trained_at: DateTime<Utc>,
    pub holdout_accuracy: f64,
    /// Outcome store size when the model was trained
    pub outcome_count: usize,
}

#[derive(Debug, Clone)]
pub struct LearningSnapshot<'a> {
    pub model: Option<InstalledModel>,
    /// All closed trades, oldest first
    pub records: &'a [TradeRecord],
}

pub struct RetrainScheduler {
    config: LearningConfig,
    win_threshold: f64,
}

impl RetrainScheduler {
    pub fn new(config: LearningConfig, win_threshold: f64) -> Self {
        Self {
            config,
            win_threshold,
        }
    }

    pub fn evaluate(&self, snapshot: &LearningSnapshot<'_>, now: DateTime<Utc>) -> Option<RetrainTrigger> {
        let cfg = &self.config;
        let total = snapshot.records.len();

        let Some(model) = &snapshot.model else {
            return (total >= cfg.min_training_samples)
                .then_some(RetrainTrigger::ColdStart { samples: total });
        };

        let new_trades = &snapshot.records[model.outcome_count.min(total)..];
        if new_trades.len() < cfg.min_new_trades {
            return None;
        }

        if let Some(live) = live_accuracy(new_trades) {
            if model.holdout_accuracy - live >= cfg.accuracy_drop {
                return Some(RetrainTrigger::AccuracyDrop {
                    baseline: model.holdout_accuracy,
                    live,
                });
            }
        }

        if total >= cfg.recent_window {
            let all_time = win_rate(snapshot.records, self.win_threshold);
            let recent = win_rate(&snapshot.records[total - cfg.recent_window..], self.win_threshold);
            if all_time - recent >= cfg.win_rate_drop {
                return Some(RetrainTrigger::WinRateDrop { all_time, recent });
            }
        }

        let hours = (now - model.trained_at).num_hours();
        if hours >= cfg.max_model_age_hours {
            return Some(RetrainTrigger::ModelAge { hours });
        }

        None
    }
}

/// Share of trades whose predicted class at entry matched the realized label
pub fn live_accuracy(records: &[TradeRecord]) -> Option<f64> {
    let scored: Vec<bool> = records
        .iter()
        .filter_map(|r| r.predicted.map(|p| p == r.label))
        .collect();
    if scored.is_empty() {
        return None;
    }
    Some(scored.iter().filter(|hit| **hit).count() as f64 / scored.len() as f64)
}

pub fn win_rate(records: &[TradeRecord], win_threshold: f64) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    records.iter().filter(|r| r.is_win(win_threshold)).count() as f64 / records.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, OutcomeLabel};
    use chrono::Duration;

    fn record(ret: f64, predicted: Option<OutcomeLabel>) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            instrument: "SOL".into(),
            entry_price: 100.0,
            exit_price: 100.0,
            entry_time: now,
            exit_time: now,
            quantity: 1.0,
            realized_return: ret,
            features: None,
            label: OutcomeLabel::from_return(ret, 0.005),
            exit_reason: ExitReason::StopLoss,
            predicted,
            confidence: 0.5,
            timestamp: now,
        }
    }

    fn scheduler() -> RetrainScheduler {
        RetrainScheduler::new(LearningConfig::default(), 0.001)
    }

    fn model(outcome_count: usize, accuracy: f64, age_hours: i64) -> InstalledModel {
        InstalledModel {
            trained_at: Utc::now() - Duration::hours(age_hours),
            holdout_accuracy: accuracy,
            outcome_count,
        }
    }

    #[test]
    fn test_cold_start_needs_minimum_samples() {
        let records: Vec<TradeRecord> = (0..29).map(|_| record(0.01, None)).collect();
        let snap = LearningSnapshot { model: None, records: &records };
        assert_eq!(scheduler().evaluate(&snap, Utc::now()), None);

        let records: Vec<TradeRecord> = (0..30).map(|_| record(0.01, None)).collect();
        let snap = LearningSnapshot { model: None, records: &records };
        assert_eq!(
            scheduler().evaluate(&snap, Utc::now()),
            Some(RetrainTrigger::ColdStart { samples: 30 })
        );
    }

    #[test]
    fn test_requires_thirty_new_trades() {
        // 29 new trades, every trigger condition otherwise true
        let records: Vec<TradeRecord> = (0..129)
            .map(|_| record(-0.02, Some(OutcomeLabel::Profit)))
            .collect();
        let snap = LearningSnapshot {
            model: Some(model(100, 0.9, 48)),
            records: &records,
        };
        assert_eq!(scheduler().evaluate(&snap, Utc::now()), None);
    }

    #[test]
    fn test_accuracy_drop_triggers() {
        let mut records: Vec<TradeRecord> = (0..50).map(|_| record(0.01, None)).collect();
        // 30 new trades, 15 predicted correctly
        for i in 0..30 {
            let predicted = if i % 2 == 0 { OutcomeLabel::Profit } else { OutcomeLabel::Loss };
            records.push(record(0.01, Some(predicted)));
        }
        let snap = LearningSnapshot {
            model: Some(model(50, 0.6, 1)),
            records: &records,
        };
        match scheduler().evaluate(&snap, Utc::now()) {
            Some(RetrainTrigger::AccuracyDrop { baseline, live }) => {
                assert_eq!(baseline, 0.6);
                assert!((live - 0.5).abs() < 1e-12);
            }
            other => panic!("expected accuracy drop, got {:?}", other),
        }
    }

    #[test]
    fn test_win_rate_drop_triggers() {
        let mut records: Vec<TradeRecord> = (0..60).map(|_| record(0.01, None)).collect();
        records.extend((0..20).map(|_| record(-0.01, None)));
        let snap = LearningSnapshot {
            model: Some(model(50, 0.6, 1)),
            records: &records,
        };
        assert!(matches!(
            scheduler().evaluate(&snap, Utc::now()),
            Some(RetrainTrigger::WinRateDrop { .. })
        ));
    }

    #[test]
    fn test_model_age_triggers() {
        let records: Vec<TradeRecord> = (0..80).map(|_| record(0.01, None)).collect();
        let snap = LearningSnapshot {
            model: Some(model(40, 0.6, 25)),
            records: &records,
        };
        assert_eq!(
            scheduler().evaluate(&snap, Utc::now()),
            Some(RetrainTrigger::ModelAge { hours: 25 })
        );

        let snap = LearningSnapshot {
            model: Some(model(40, 0.6, 2)),
            records: &records,
        };
        assert_eq!(scheduler().evaluate(&snap, Utc::now()), None);
    }
}
