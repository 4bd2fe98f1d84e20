//! Runtime trading configuration
//!
//! `TradingConfig` is the part of the configuration an operator may change while
//! the engine runs. Updates arrive as a partial `ConfigUpdate`, are applied to a
//! copy, validated, and only then swapped in whole.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Fixed quote amount per entry
    pub trade_amount: f64,
    /// Target return for the take-profit exit (0.01 = 1%)
    pub target_profit: f64,
    /// Stop-loss distance as a positive fraction
    pub stop_loss: f64,
    /// Price distance a losing exit must recover before re-entry
    pub rebuy_threshold: f64,
    /// Compare the target against the fee-adjusted return
    pub use_net_profit: bool,
    /// Derive the target from volatility instead of `target_profit`
    pub use_dynamic_target: bool,
    /// Kelly sizing once enough trades exist
    pub use_dynamic_sizing: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            trade_amount: 10_000.0,
            target_profit: 0.01,
            stop_loss: 0.02,
            rebuy_threshold: 0.015,
            use_net_profit: true,
            use_dynamic_target: false,
            use_dynamic_sizing: false,
        }
    }
}

impl TradingConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.trade_amount.is_finite() || self.trade_amount <= 0.0 {
            return Err(EngineError::ConfigInvalid(format!(
                "trade_amount must be positive, got {}",
                self.trade_amount
            )));
        }
        if !(self.target_profit > 0.0 && self.target_profit < 1.0) {
            return Err(EngineError::ConfigInvalid(format!(
                "target_profit must be in (0, 1), got {}",
                self.target_profit
            )));
        }
        if !(self.stop_loss > 0.0 && self.stop_loss < 1.0) {
            return Err(EngineError::ConfigInvalid(format!(
                "stop_loss must be in (0, 1), got {}",
                self.stop_loss
            )));
        }
        if !(self.rebuy_threshold >= 0.0 && self.rebuy_threshold < 1.0) {
            return Err(EngineError::ConfigInvalid(format!(
                "rebuy_threshold must be in [0, 1), got {}",
                self.rebuy_threshold
            )));
        }
        Ok(())
    }
}

/// Partial update submitted through the control surface
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub trade_amount: Option<f64>,
    pub target_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub rebuy_threshold: Option<f64>,
    pub use_net_profit: Option<bool>,
    pub use_dynamic_target: Option<bool>,
    pub use_dynamic_sizing: Option<bool>,
}

impl ConfigUpdate {
    /// Apply on top of `base`, returning the validated result. `base` is untouched.
    pub fn apply(&self, base: &TradingConfig) -> EngineResult<TradingConfig> {
        let mut next = base.clone();
        if let Some(v) = self.trade_amount {
            next.trade_amount = v;
        }
        if let Some(v) = self.target_profit {
            next.target_profit = v;
        }
        if let Some(v) = self.stop_loss {
            next.stop_loss = v;
        }
        if let Some(v) = self.rebuy_threshold {
            next.rebuy_threshold = v;
        }
        if let Some(v) = self.use_net_profit {
            next.use_net_profit = v;
        }
        if let Some(v) = self.use_dynamic_target {
            next.use_dynamic_target = v;
        }
        if let Some(v) = self.use_dynamic_sizing {
            next.use_dynamic_sizing = v;
        }
        next.validate()?;
        Ok(next)
    }
}
