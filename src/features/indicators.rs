//! Indicator series over candle closes
//!
//! Every function is pure and returns one value per input element, with
//! `NaN` where the indicator is not yet defined.

use crate::types::Candle;

/// EMA seeded with the first value (span-style multiplier)
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    if values.is_empty() || period == 0 {
        return out;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = values[0];
    out.push(ema);
    for v in values.iter().skip(1) {
        ema = (v - ema) * multiplier + ema;
        out.push(ema);
    }
    out
}

/// RSI with Wilder's smoothing, seeded by the simple average of the first `period` changes
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period + 1 {
        return out;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let change = closes[i] - closes[i - 1];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let p = period as f64;
    let mut avg_gain = gains / p;
    let mut avg_loss = losses / p;
    out[period] = rsi_from_averages(avg_gain, avg_loss);

    for i in (period + 1)..n {
        let change = closes[i] - closes[i - 1];
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
        out[i] = rsi_from_averages(avg_gain, avg_loss);
    }
    out
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss < 1e-12 && avg_gain < 1e-12 {
        return 50.0; // No movement = neutral
    }
    if avg_loss < 1e-12 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// MACD line and its signal line
pub fn macd_series(closes: &[f64], fast: usize, slow: usize, signal: usize) -> (Vec<f64>, Vec<f64>) {
    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);
    let macd: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| f - s)
        .collect();
    let signal_line = ema_series(&macd, signal);
    (macd, signal_line)
}

/// Position of the close inside the Bollinger band, 0 = lower, 1 = upper.
/// 0.5 when the band has zero width.
pub fn bollinger_position_series(closes: &[f64], period: usize, std_mult: f64) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    for i in (period - 1)..n {
        let window = &closes[i + 1 - period..=i];
        let sma = window.iter().sum::<f64>() / period as f64;
        let variance = window.iter().map(|p| (p - sma).powi(2)).sum::<f64>() / period as f64;
        let std = variance.sqrt();
        let upper = sma + std_mult * std;
        let lower = sma - std_mult * std;
        out[i] = if (upper - lower).abs() < f64::EPSILON {
            0.5
        } else {
            (closes[i] - lower) / (upper - lower)
        };
    }
    out
}

/// Average true range with Wilder smoothing; `None` with fewer than `period + 1` candles
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let tr: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let (prev, curr) = (&w[0], &w[1]);
            (curr.high - curr.low)
                .max((curr.high - prev.close).abs())
                .max((curr.low - prev.close).abs())
        })
        .collect();

    let p = period as f64;
    let mut value = tr[..period].iter().sum::<f64>() / p;
    for t in tr.iter().skip(period) {
        value = (value * (p - 1.0) + t) / p;
    }
    Some(value)
}

/// Mean of the last `period` values
pub fn trailing_mean(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Relative change from `values[len-1-lookback]` to the last value
pub fn change_over(values: &[f64], lookback: usize) -> Option<f64> {
    if values.len() <= lookback {
        return None;
    }
    let last = values[values.len() - 1];
    let base = values[values.len() - 1 - lookback];
    if base.abs() < f64::EPSILON {
        return None;
    }
    Some((last - base) / base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_converges_to_constant() {
        let values = vec![10.0; 50];
        let ema = ema_series(&values, 9);
        assert!((ema[49] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_rsi_uptrend_high() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let rsi = rsi_series(&closes, 14);
        assert!(rsi[13].is_nan());
        assert!((rsi[39] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_flat_is_neutral() {
        let closes = vec![100.0; 30];
        let rsi = rsi_series(&closes, 14);
        assert_eq!(rsi[29], 50.0);
    }

    #[test]
    fn test_rsi_mixed_in_range() {
        let closes: Vec<f64> = (0..60)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        let rsi = rsi_series(&closes, 14);
        let last = rsi[59];
        assert!(last > 0.0 && last < 100.0, "Expected RSI in (0,100), got {}", last);
    }

    #[test]
    fn test_bollinger_flat_is_midpoint() {
        let closes = vec![50.0; 25];
        let bb = bollinger_position_series(&closes, 20, 2.0);
        assert_eq!(bb[24], 0.5);
        assert!(bb[18].is_nan());
    }

    #[test]
    fn test_change_over() {
        let values = vec![100.0, 101.0, 102.0, 103.0, 110.0];
        let change = change_over(&values, 4).unwrap();
        assert!((change - 0.10).abs() < 1e-12);
        assert!(change_over(&values, 5).is_none());
    }
}
