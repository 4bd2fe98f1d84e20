//! Drawdown governor
//!
//! Tracks peak equity and latches a halt once drawdown reaches the limit.
//! Only `reset` (an explicit restart) clears the latch.

use serde::Serialize;
use std::collections::HashMap;
use tracing::error;

use crate::config::RiskConfig;
use crate::types::Position;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GovernorReading {
    pub equity: f64,
    pub peak: f64,
    pub drawdown: f64,
    /// True only on the reading that tripped the halt
    pub tripped: bool,
    pub halted: bool,
}

#[derive(Debug, Clone)]
pub struct DrawdownGovernor {
    config: RiskConfig,
    peak: f64,
    halted: bool,
}

impl DrawdownGovernor {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            peak: 0.0,
            halted: false,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn peak(&self) -> f64 {
        self.peak
    }

    pub fn drawdown(&self, equity: f64) -> f64 {
        if self.peak > 0.0 {
            ((self.peak - equity) / self.peak).max(0.0)
        } else {
            0.0
        }
    }

    /// Fold in a new equity mark
    pub fn observe(&mut self, equity: f64) -> GovernorReading {
        if equity > self.peak {
            self.peak = equity;
        }
        let drawdown = self.drawdown(equity);
        let tripped = !self.halted && drawdown >= self.config.max_drawdown;
        if tripped {
            self.halted = true;
            error!(
                equity,
                peak = self.peak,
                drawdown,
                "🛑 Drawdown limit reached, halting"
            );
        }
        GovernorReading {
            equity,
            peak: self.peak,
            drawdown,
            tripped,
            halted: self.halted,
        }
    }

    /// Clear the latch and restart peak tracking from `equity`
    pub fn reset(&mut self, equity: f64) {
        self.halted = false;
        self.peak = equity;
    }
}

/// Cash plus every position at its mark. A position without a price
/// is marked at entry.
pub fn mark_equity(cash: f64, positions: &HashMap<String, Position>, prices: &HashMap<String, f64>) -> f64 {
    cash + positions
        .values()
        .map(|p| {
            let mark = prices.get(&p.instrument).copied().unwrap_or(p.entry_price);
            p.market_value(mark)
        })
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fill, Side};
    use chrono::Utc;

    #[test]
    fn test_six_percent_drawdown_halts() {
        let mut governor = DrawdownGovernor::new(RiskConfig::default());
        assert!(!governor.observe(100_000.0).halted);
        let reading = governor.observe(94_000.0);
        assert!(reading.tripped && reading.halted);
        assert!((reading.drawdown - 0.06).abs() < 1e-12);

        // Latched even after recovery, and only trips once
        let later = governor.observe(101_000.0);
        assert!(later.halted && !later.tripped);

        governor.reset(94_000.0);
        assert!(!governor.is_halted());
        assert_eq!(governor.peak(), 94_000.0);
    }

    #[test]
    fn test_below_limit_keeps_running() {
        let mut governor = DrawdownGovernor::new(RiskConfig::default());
        governor.observe(100_000.0);
        assert!(!governor.observe(95_500.0).halted);
        assert!(governor.observe(95_000.0).halted);
    }

    #[test]
    fn test_equity_marks_missing_price_at_entry() {
        let fill = |instrument: &str, price: f64| Fill {
            instrument: instrument.into(),
            side: Side::Buy,
            price,
            quantity: 2.0,
            quote_amount: price * 2.0,
            fee: 0.0,
            timestamp: Utc::now(),
        };
        let mut positions = HashMap::new();
        positions.insert("ETH".into(), Position::from_fill(&fill("ETH", 2_000.0), None, None, 0.0));
        positions.insert("SOL".into(), Position::from_fill(&fill("SOL", 150.0), None, None, 0.0));
        let prices = HashMap::from([("ETH".to_string(), 1_900.0)]);

        let equity = mark_equity(10_000.0, &positions, &prices);
        assert!((equity - (10_000.0 + 3_800.0 + 300.0)).abs() < 1e-9);
    }
}
