//! Mutable trading state and the status snapshot built from it

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::backtesting::BacktestMetrics;
use crate::config::TradingConfig;
use crate::discovery::Watchlist;
use crate::persistence::TradeStats;
use crate::risk::DrawdownGovernor;
use crate::strategy::{Cooldown, CooldownTracker};
use crate::types::{Position, TradeRecord};

/// Alerts kept for status
const MAX_ALERTS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub level: AlertLevel,
    pub message: String,
}

/// Counters since process start
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub started_at: DateTime<Utc>,
    pub ticks: u64,
    pub entries_rejected: u64,
    pub trades_opened: u64,
    pub trades_closed: u64,
    pub wins: u64,
    pub losses: u64,
    /// Sum of realized quote PnL
    pub realized_pnl: f64,
    pub discovery_scans: u64,
}

impl SessionStats {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            ticks: 0,
            entries_rejected: 0,
            trades_opened: 0,
            trades_closed: 0,
            wins: 0,
            losses: 0,
            realized_pnl: 0.0,
            discovery_scans: 0,
        }
    }

    pub fn record_close(&mut self, record: &TradeRecord, cost: f64, win: bool) {
        self.trades_closed += 1;
        if win {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        self.realized_pnl += record.realized_return * cost;
    }
}

/// Everything the trading loop mutates, behind one lock
pub struct TradingState {
    pub positions: HashMap<String, Position>,
    pub watchlist: Watchlist,
    pub cooldowns: CooldownTracker,
    pub governor: DrawdownGovernor,
    pub session: SessionStats,
    pub alerts: Vec<Alert>,
    pub last_backtest: Option<BacktestMetrics>,
}

impl TradingState {
    pub fn push_alert(&mut self, level: AlertLevel, message: String) {
        self.alerts.push(Alert {
            timestamp: Utc::now(),
            level,
            message,
        });
        if self.alerts.len() > MAX_ALERTS {
            let excess = self.alerts.len() - MAX_ALERTS;
            self.alerts.drain(..excess);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub generation: u64,
    pub holdout_accuracy: f64,
    pub total_samples: usize,
    pub pca_applied: bool,
    pub trained_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub halted: bool,
    pub retraining: bool,
    pub positions: Vec<Position>,
    pub watchlist: Vec<String>,
    pub cooldowns: HashMap<String, Cooldown>,
    pub model: Option<ModelSummary>,
    pub all_time: TradeStats,
    /// Win rate over the scheduler's recent window
    pub recent_win_rate: f64,
    pub session: SessionStats,
    pub peak_equity: f64,
    pub config: TradingConfig,
    pub alerts: Vec<Alert>,
    pub last_backtest: Option<BacktestMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;

    #[test]
    fn test_alerts_are_bounded() {
        let mut state = TradingState {
            positions: HashMap::new(),
            watchlist: Watchlist::default(),
            cooldowns: CooldownTracker::new(),
            governor: DrawdownGovernor::new(RiskConfig::default()),
            session: SessionStats::new(Utc::now()),
            alerts: Vec::new(),
            last_backtest: None,
        };
        for i in 0..60 {
            state.push_alert(AlertLevel::Warning, format!("alert {}", i));
        }
        assert_eq!(state.alerts.len(), MAX_ALERTS);
        assert_eq!(state.alerts[0].message, "alert 10");
    }
}
