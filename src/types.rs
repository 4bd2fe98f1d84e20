//! Core types for EvoBot
//!
//! Candles, positions, fills and the immutable trade records the model learns from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::features::FeatureVector;

/// OHLCV candle. Ordered per instrument, immutable once closed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time of the period
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Three-way outcome class used as the training label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeLabel {
    Loss,
    Neutral,
    Profit,
}

impl OutcomeLabel {
    pub const ALL: [OutcomeLabel; 3] = [OutcomeLabel::Loss, OutcomeLabel::Neutral, OutcomeLabel::Profit];

    /// Label a realized return. Strictly beyond `threshold` on either side, otherwise neutral.
    pub fn from_return(realized_return: f64, threshold: f64) -> Self {
        if realized_return > threshold {
            OutcomeLabel::Profit
        } else if realized_return < -threshold {
            OutcomeLabel::Loss
        } else {
            OutcomeLabel::Neutral
        }
    }

    /// Integer class id used by the classifier
    pub fn class_id(self) -> i64 {
        match self {
            OutcomeLabel::Loss => 0,
            OutcomeLabel::Neutral => 1,
            OutcomeLabel::Profit => 2,
        }
    }

    pub fn from_class_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(OutcomeLabel::Loss),
            1 => Some(OutcomeLabel::Neutral),
            2 => Some(OutcomeLabel::Profit),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutcomeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeLabel::Loss => write!(f, "loss"),
            OutcomeLabel::Neutral => write!(f, "neutral"),
            OutcomeLabel::Profit => write!(f, "profit"),
        }
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    FlashCrash,
    TargetProfit,
    StopLoss,
    TrailingStop,
    Overbought,
    DrawdownHalt,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::FlashCrash => write!(f, "FLASH_CRASH"),
            ExitReason::TargetProfit => write!(f, "TARGET_PROFIT"),
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::TrailingStop => write!(f, "TRAILING_STOP"),
            ExitReason::Overbought => write!(f, "OVERBOUGHT"),
            ExitReason::DrawdownHalt => write!(f, "DRAWDOWN_HALT"),
            ExitReason::Manual => write!(f, "MANUAL"),
        }
    }
}

/// Fill returned by order execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub instrument: String,
    pub side: Side,
    /// Average execution price
    pub price: f64,
    /// Base quantity filled
    pub quantity: f64,
    /// Gross quote value (price * quantity)
    pub quote_amount: f64,
    /// Fee charged in quote currency
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
}

/// Open position owned by the trading engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub instrument: String,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub quantity: f64,
    /// Quote spent including the entry fee
    pub cost: f64,
    pub status: PositionStatus,
    /// Highest price seen since the trailing stop activated
    pub peak_price: f64,
    pub trailing_active: bool,
    pub exit_reason: Option<ExitReason>,
    pub entry_features: Option<FeatureVector>,
    pub predicted: Option<OutcomeLabel>,
    pub confidence: f64,
    /// Set when a close could not be confirmed and needs reconciliation
    #[serde(default)]
    pub reconcile_required: bool,
}

impl Position {
    pub fn from_fill(
        fill: &Fill,
        entry_features: Option<FeatureVector>,
        predicted: Option<OutcomeLabel>,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            instrument: fill.instrument.clone(),
            entry_price: fill.price,
            entry_time: fill.timestamp,
            quantity: fill.quantity,
            cost: fill.quote_amount + fill.fee,
            status: PositionStatus::Open,
            peak_price: fill.price,
            trailing_active: false,
            exit_reason: None,
            entry_features,
            predicted,
            confidence,
            reconcile_required: false,
        }
    }

    /// Raw (fee-free) return at `price`
    pub fn raw_return(&self, price: f64) -> f64 {
        if self.entry_price > 0.0 {
            (price - self.entry_price) / self.entry_price
        } else {
            0.0
        }
    }

    pub fn market_value(&self, price: f64) -> f64 {
        self.quantity * price
    }
}

/// Immutable record of a closed trade, appended to the outcome store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub instrument: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub quantity: f64,
    /// Net return after fees on both legs
    pub realized_return: f64,
    pub features: Option<FeatureVector>,
    pub label: OutcomeLabel,
    pub exit_reason: ExitReason,
    pub predicted: Option<OutcomeLabel>,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl TradeRecord {
    /// Build the record for a position closed by `exit`
    pub fn close(position: &Position, exit: &Fill, reason: ExitReason, label_threshold: f64) -> Self {
        let proceeds = exit.quote_amount - exit.fee;
        let realized_return = if position.cost > 0.0 {
            (proceeds - position.cost) / position.cost
        } else {
            0.0
        };

        Self {
            id: position.id.clone(),
            instrument: position.instrument.clone(),
            entry_price: position.entry_price,
            exit_price: exit.price,
            entry_time: position.entry_time,
            exit_time: exit.timestamp,
            quantity: exit.quantity,
            realized_return,
            features: position.entry_features.clone(),
            label: OutcomeLabel::from_return(realized_return, label_threshold),
            exit_reason: reason,
            predicted: position.predicted,
            confidence: position.confidence,
            timestamp: exit.timestamp,
        }
    }

    /// Profitable after fees
    pub fn is_win(&self, win_threshold: f64) -> bool {
        self.realized_return > win_threshold
    }
}
