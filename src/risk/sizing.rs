//! Position Sizer
//!
//! Fixed stake by default. With enough history and `use_dynamic_sizing`, a
//! fractional Kelly stake scaled by model confidence.

use serde::Serialize;

use crate::config::{SizingConfig, TradingConfig};
use crate::persistence::TradeStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SizingMode {
    Fixed,
    Kelly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizeDecision {
    /// Quote amount to spend
    pub amount: f64,
    pub mode: SizingMode,
    /// Fraction of balance after the multiplier and cap, 0 in fixed mode
    pub kelly_fraction: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KellyQuote {
    pub p: f64,
    pub b: f64,
    pub f_raw: f64,
    pub f_fractional: f64,
}

/// `f* = (p*b - (1-p)) / b`, scaled by `multiplier` and clamped to `[0, cap]`
pub fn compute_kelly_fraction(p: f64, b: f64, multiplier: f64, cap: f64) -> KellyQuote {
    let f_raw = if b > 0.0 { (p * b - (1.0 - p)) / b } else { 0.0 };
    let f_fractional = (f_raw * multiplier.max(0.0)).clamp(0.0, cap.max(0.0));
    KellyQuote {
        p,
        b,
        f_raw,
        f_fractional,
    }
}

pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn fixed_amount(&self, trading: &TradingConfig) -> f64 {
        trading.trade_amount.max(self.config.min_order_amount)
    }

    pub fn size(
        &self,
        trading: &TradingConfig,
        stats: &TradeStats,
        confidence: f64,
        balance: f64,
    ) -> SizeDecision {
        let fixed = SizeDecision {
            amount: self.fixed_amount(trading),
            mode: SizingMode::Fixed,
            kelly_fraction: 0.0,
        };
        if !trading.use_dynamic_sizing || stats.total_trades < self.config.min_trades_for_kelly {
            return fixed;
        }
        // No losing trades leaves the payoff ratio undefined
        if stats.avg_loss <= 0.0 {
            return fixed;
        }

        let quote = compute_kelly_fraction(
            stats.win_rate,
            stats.avg_win / stats.avg_loss,
            self.config.kelly_multiplier,
            self.config.max_kelly_fraction,
        );
        let raw = quote.f_fractional * confidence.clamp(0.0, 1.0) * balance;
        let amount = raw
            .min(balance * self.config.max_balance_fraction)
            .max(self.config.min_order_amount);

        SizeDecision {
            amount,
            mode: SizingMode::Kelly,
            kelly_fraction: quote.f_fractional,
        }
    }
}
