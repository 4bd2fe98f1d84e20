//! Feature Engine - Technical indicators and market features
//!
//! Pure mapping from a candle window to the 16-value `FeatureVector` used
//! both for training and for live prediction:
//! - RSI (Wilder's smoothing)
//! - MACD line and signal
//! - Bollinger band position
//! - Volume ratio and volume trend
//! - Short and medium price change
//! - EMA(9), EMA(21), ATR(14)
//! - Calendar features from the last candle
//! - Lagged RSI / band position and RSI change

pub mod indicators;

use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::Candle;

use indicators::{
    atr, bollinger_position_series, change_over, ema_series, macd_series, rsi_series,
    trailing_mean,
};

/// Minimum candle window for extraction
pub const MIN_CANDLES: usize = 30;

const RSI_PERIOD: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const BB_PERIOD: usize = 20;
const BB_STD: f64 = 2.0;
const VOLUME_MA_PERIOD: usize = 20;
const EMA_SHORT: usize = 9;
const EMA_MEDIUM: usize = 21;
const ATR_PERIOD: usize = 14;
const SHORT_LOOKBACK: usize = 4;
const MEDIUM_LOOKBACK: usize = 14;
/// Offset of the lagged RSI / band position
const LAG: usize = 4;
const VOLUME_TREND_SPAN: usize = 5;

/// Feature vector in fixed order. `NaN` marks a value that is undefined for
/// this window and gets imputed by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub bb_position: f64,
    pub volume_ratio: f64,
    pub price_change_short: f64,
    pub price_change_medium: f64,
    pub ema_short: f64,
    pub ema_medium: f64,
    pub atr: f64,
    pub hour_of_day: f64,
    pub day_of_week: f64,
    pub rsi_change: f64,
    pub volume_trend: f64,
    pub rsi_prev: f64,
    pub bb_position_prev: f64,
}

impl FeatureVector {
    pub const NUM_FEATURES: usize = 16;

    pub fn feature_names() -> [&'static str; Self::NUM_FEATURES] {
        [
            "rsi",
            "macd",
            "macd_signal",
            "bb_position",
            "volume_ratio",
            "price_change_short",
            "price_change_medium",
            "ema_short",
            "ema_medium",
            "atr",
            "hour_of_day",
            "day_of_week",
            "rsi_change",
            "volume_trend",
            "rsi_prev",
            "bb_position_prev",
        ]
    }

    pub fn to_vec(&self) -> Vec<f64> {
        vec![
            self.rsi,
            self.macd,
            self.macd_signal,
            self.bb_position,
            self.volume_ratio,
            self.price_change_short,
            self.price_change_medium,
            self.ema_short,
            self.ema_medium,
            self.atr,
            self.hour_of_day,
            self.day_of_week,
            self.rsi_change,
            self.volume_trend,
            self.rsi_prev,
            self.bb_position_prev,
        ]
    }

    /// Rebuild from a slice in `feature_names()` order
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        if values.len() != Self::NUM_FEATURES {
            return None;
        }
        Some(Self {
            rsi: values[0],
            macd: values[1],
            macd_signal: values[2],
            bb_position: values[3],
            volume_ratio: values[4],
            price_change_short: values[5],
            price_change_medium: values[6],
            ema_short: values[7],
            ema_medium: values[8],
            atr: values[9],
            hour_of_day: values[10],
            day_of_week: values[11],
            rsi_change: values[12],
            volume_trend: values[13],
            rsi_prev: values[14],
            bb_position_prev: values[15],
        })
    }

    /// ATR relative to `price`, 0 when undefined
    pub fn atr_ratio(&self, price: f64) -> f64 {
        if price > 0.0 && self.atr.is_finite() {
            self.atr / price
        } else {
            0.0
        }
    }
}

/// Extract the feature vector for the last candle of `candles`.
///
/// Windows shorter than `MIN_CANDLES` fail with `InsufficientData`.
pub fn extract_features(candles: &[Candle]) -> EngineResult<FeatureVector> {
    let n = candles.len();
    if n < MIN_CANDLES {
        return Err(EngineError::InsufficientData {
            required: MIN_CANDLES,
            available: n,
        });
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let last = n - 1;

    let rsi = rsi_series(&closes, RSI_PERIOD);
    let (macd, macd_signal) = macd_series(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
    let bb = bollinger_position_series(&closes, BB_PERIOD, BB_STD);
    let ema_short = ema_series(&closes, EMA_SHORT);
    let ema_medium = ema_series(&closes, EMA_MEDIUM);

    let volume_ratio = match trailing_mean(&volumes, VOLUME_MA_PERIOD) {
        Some(ma) if ma > 0.0 => volumes[last] / ma,
        _ => f64::NAN,
    };

    let recent_vol = trailing_mean(&volumes, VOLUME_TREND_SPAN);
    let prev_vol = trailing_mean(&volumes[..n - VOLUME_TREND_SPAN], VOLUME_TREND_SPAN);
    let volume_trend = match (recent_vol, prev_vol) {
        (Some(recent), Some(prev)) if prev > 0.0 => (recent - prev) / prev,
        _ => f64::NAN,
    };

    let ts = candles[last].timestamp;
    let rsi_now = rsi[last];
    let rsi_prev = rsi[last - LAG];

    Ok(FeatureVector {
        rsi: rsi_now,
        macd: macd[last],
        macd_signal: macd_signal[last],
        bb_position: bb[last],
        volume_ratio,
        price_change_short: change_over(&closes, SHORT_LOOKBACK).unwrap_or(f64::NAN),
        price_change_medium: change_over(&closes, MEDIUM_LOOKBACK).unwrap_or(f64::NAN),
        ema_short: ema_short[last],
        ema_medium: ema_medium[last],
        atr: atr(candles, ATR_PERIOD).unwrap_or(f64::NAN),
        hour_of_day: ts.hour() as f64,
        day_of_week: ts.weekday().num_days_from_monday() as f64,
        rsi_change: rsi_now - rsi_prev,
        volume_trend,
        rsi_prev,
        bb_position_prev: bb[last - LAG],
    })
}
