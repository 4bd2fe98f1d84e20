//! Exit State Machine
//!
//! Ladder, highest priority first: flash crash, target profit, stop loss,
//! trailing stop, overbought. The trailing peak is updated before the ladder
//! runs. A fired trigger moves the position to `Closing`.

use crate::config::{ExitConfig, TradingConfig};
use crate::features::FeatureVector;
use crate::types::{ExitReason, Position, PositionStatus};

/// Market view of one position for this tick
#[derive(Debug, Clone, Copy)]
pub struct ExitContext<'a> {
    pub price: f64,
    /// Open of the candle in progress
    pub candle_open: Option<f64>,
    pub features: Option<&'a FeatureVector>,
}

pub struct ExitStateMachine {
    config: ExitConfig,
}

impl ExitStateMachine {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    /// Return after fees on both legs at `price`
    pub fn net_return(&self, position: &Position, price: f64) -> f64 {
        let fee = self.config.fee_rate;
        let cost = position.entry_price * position.quantity * (1.0 + fee);
        let proceeds = price * position.quantity * (1.0 - fee);
        if cost > 0.0 {
            (proceeds - cost) / cost
        } else {
            0.0
        }
    }

    /// Profit target for this tick. The dynamic target needs features and
    /// falls back to the static one without them.
    pub fn target(&self, trading: &TradingConfig, ctx: &ExitContext<'_>) -> f64 {
        match ctx.features {
            Some(f) if trading.use_dynamic_target => self
                .config
                .dynamic_target_floor
                .max(f.atr_ratio(ctx.price) * self.config.dynamic_target_weight),
            _ => trading.target_profit,
        }
    }

    /// Update trailing state, then walk the ladder. Only open positions are
    /// evaluated.
    pub fn evaluate(
        &self,
        position: &mut Position,
        ctx: &ExitContext<'_>,
        trading: &TradingConfig,
    ) -> Option<ExitReason> {
        if position.status != PositionStatus::Open {
            return None;
        }
        self.update_trailing(position, ctx.price);

        let reason = self.first_trigger(position, ctx, trading)?;
        position.status = PositionStatus::Closing;
        position.exit_reason = Some(reason);
        Some(reason)
    }

    fn update_trailing(&self, position: &mut Position, price: f64) {
        if position.trailing_active {
            position.peak_price = position.peak_price.max(price);
        } else if position.raw_return(price) >= self.config.trailing_activation {
            position.trailing_active = true;
            position.peak_price = position.peak_price.max(price);
        }
    }

    fn first_trigger(
        &self,
        position: &Position,
        ctx: &ExitContext<'_>,
        trading: &TradingConfig,
    ) -> Option<ExitReason> {
        let cfg = &self.config;
        let price = ctx.price;

        if let Some(open) = ctx.candle_open.filter(|o| *o > 0.0) {
            if (price - open) / open < cfg.flash_crash_threshold {
                return Some(ExitReason::FlashCrash);
            }
        }

        let raw = position.raw_return(price);
        let profit = if trading.use_net_profit {
            self.net_return(position, price)
        } else {
            raw
        };
        if profit >= self.target(trading, ctx) {
            return Some(ExitReason::TargetProfit);
        }

        if raw <= -trading.stop_loss {
            return Some(ExitReason::StopLoss);
        }

        if position.trailing_active && price < position.peak_price * (1.0 - cfg.trailing_distance) {
            return Some(ExitReason::TrailingStop);
        }

        if ctx.features.map(|f| f.bb_position > cfg.overbought_bb).unwrap_or(false) {
            return Some(ExitReason::Overbought);
        }

        None
    }
}
