//! Rebuy cooldowns
//!
//! After a loss an instrument stays blocked until price recovers past the exit
//! or the loss window expires. Wins and failed buys block for a fixed time.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::config::EntryConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CooldownKind {
    /// Blocked until price > `rebuy_above` or the window ends
    AfterLoss { rebuy_above: f64 },
    AfterWin,
    FailedBuy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cooldown {
    pub kind: CooldownKind,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CooldownTracker {
    entries: HashMap<String, Cooldown>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a close. `exit_price` is the fill price of the sell.
    pub fn record_exit(
        &mut self,
        instrument: &str,
        exit_price: f64,
        win: bool,
        rebuy_threshold: f64,
        cfg: &EntryConfig,
        now: DateTime<Utc>,
    ) {
        let cooldown = if win {
            Cooldown {
                kind: CooldownKind::AfterWin,
                until: now + Duration::seconds(cfg.win_cooldown_secs),
            }
        } else {
            Cooldown {
                kind: CooldownKind::AfterLoss {
                    rebuy_above: exit_price * (1.0 + rebuy_threshold),
                },
                until: now + Duration::seconds(cfg.loss_cooldown_secs),
            }
        };
        self.entries.insert(instrument.to_string(), cooldown);
    }

    pub fn record_failed_buy(&mut self, instrument: &str, cfg: &EntryConfig, now: DateTime<Utc>) {
        self.entries.insert(
            instrument.to_string(),
            Cooldown {
                kind: CooldownKind::FailedBuy,
                until: now + Duration::seconds(cfg.failed_buy_cooldown_secs),
            },
        );
    }

    /// True while the instrument may not be bought. Expired or released
    /// entries are dropped. `price` is only needed to release a loss cooldown.
    pub fn is_blocked(&mut self, instrument: &str, price: Option<f64>, now: DateTime<Utc>) -> bool {
        let Some(cooldown) = self.entries.get(instrument) else {
            return false;
        };
        let released = now >= cooldown.until
            || matches!(
                (&cooldown.kind, price),
                (CooldownKind::AfterLoss { rebuy_above }, Some(p)) if p > *rebuy_above
            );
        if released {
            self.entries.remove(instrument);
        }
        !released
    }

    /// Read-only check for callers without a price (discovery)
    pub fn is_cooling(&self, instrument: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .get(instrument)
            .map(|c| now < c.until)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> HashMap<String, Cooldown> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_cooldown_released_by_recovery() {
        let cfg = EntryConfig::default();
        let now = Utc::now();
        let mut tracker = CooldownTracker::new();
        tracker.record_exit("ETH", 2000.0, false, 0.015, &cfg, now);

        assert!(tracker.is_blocked("ETH", Some(2020.0), now));
        // 2000 * 1.015 = 2030
        assert!(tracker.is_blocked("ETH", Some(2030.0), now));
        assert!(!tracker.is_blocked("ETH", Some(2031.0), now));
        assert!(!tracker.snapshot().contains_key("ETH"));
    }

    #[test]
    fn test_loss_cooldown_released_by_time() {
        let cfg = EntryConfig::default();
        let now = Utc::now();
        let mut tracker = CooldownTracker::new();
        tracker.record_exit("ETH", 2000.0, false, 0.015, &cfg, now);
        assert!(tracker.is_blocked("ETH", Some(1900.0), now + Duration::seconds(1799)));
        assert!(!tracker.is_blocked("ETH", Some(1900.0), now + Duration::seconds(1800)));
    }

    #[test]
    fn test_win_and_failed_buy_windows() {
        let cfg = EntryConfig::default();
        let now = Utc::now();
        let mut tracker = CooldownTracker::new();
        tracker.record_exit("SOL", 150.0, true, 0.015, &cfg, now);
        tracker.record_failed_buy("BNB", &cfg, now);

        // Price recovery does not release a win cooldown
        assert!(tracker.is_blocked("SOL", Some(500.0), now + Duration::seconds(299)));
        assert!(!tracker.is_blocked("SOL", None, now + Duration::seconds(300)));

        assert!(tracker.is_cooling("BNB", now + Duration::seconds(59)));
        assert!(!tracker.is_blocked("BNB", None, now + Duration::seconds(60)));
        assert!(!tracker.is_blocked("ADA", None, now));
    }
}
