//! Entry Filter Pipeline
//!
//! Cheap market gates run first, the model runs last. The first failing gate
//! rejects; a rejection is an ordinary outcome, not an error.

use serde::Serialize;
use tracing::debug;

use crate::config::EntryConfig;
use crate::features::FeatureVector;
use crate::ml_engine::{ModelState, Prediction};
use crate::types::{Candle, OutcomeLabel};

/// Which admission scenario let the entry through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryScenario {
    /// Model says profit and the instrument is oversold
    OversoldProfit,
    HighConfidence,
    /// Oversold, momentum turning, volume confirming
    MomentumRecovery,
}

impl std::fmt::Display for EntryScenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryScenario::OversoldProfit => write!(f, "oversold_profit"),
            EntryScenario::HighConfidence => write!(f, "high_confidence"),
            EntryScenario::MomentumRecovery => write!(f, "momentum_recovery"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RejectReason {
    PriceTooLow,
    InsufficientLiquidity,
    BenchmarkFalling,
    Downtrend,
    ModelNotTrained,
    PredictionFailed(String),
    NoScenario,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::PriceTooLow => write!(f, "price_too_low"),
            RejectReason::InsufficientLiquidity => write!(f, "insufficient_liquidity"),
            RejectReason::BenchmarkFalling => write!(f, "benchmark_falling"),
            RejectReason::Downtrend => write!(f, "downtrend"),
            RejectReason::ModelNotTrained => write!(f, "model_not_trained"),
            RejectReason::PredictionFailed(e) => write!(f, "prediction_failed: {}", e),
            RejectReason::NoScenario => write!(f, "no_scenario"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryDecision {
    Admit {
        scenario: EntryScenario,
        prediction: Prediction,
    },
    Reject(RejectReason),
}

/// Everything the gates look at for one candidate
pub struct EntryContext<'a> {
    pub instrument: &'a str,
    pub price: f64,
    pub candles: &'a [Candle],
    pub features: &'a FeatureVector,
    pub is_benchmark: bool,
    /// Benchmark candles for this tick, when they could be fetched
    pub benchmark: Option<&'a [Candle]>,
}

pub struct EntryPipeline {
    config: EntryConfig,
}

impl EntryPipeline {
    pub fn new(config: EntryConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, ctx: &EntryContext<'_>, model: Option<&ModelState>) -> EntryDecision {
        let decision = self.run_gates(ctx, model);
        if let EntryDecision::Reject(reason) = &decision {
            debug!(instrument = ctx.instrument, %reason, "Entry rejected");
        }
        decision
    }

    fn run_gates(&self, ctx: &EntryContext<'_>, model: Option<&ModelState>) -> EntryDecision {
        if ctx.price < self.config.min_price {
            return EntryDecision::Reject(RejectReason::PriceTooLow);
        }
        if !self.check_liquidity(ctx) {
            return EntryDecision::Reject(RejectReason::InsufficientLiquidity);
        }
        if !self.check_correlation(ctx) {
            return EntryDecision::Reject(RejectReason::BenchmarkFalling);
        }
        if !self.check_trend(ctx.features) {
            return EntryDecision::Reject(RejectReason::Downtrend);
        }

        let Some(model) = model else {
            return EntryDecision::Reject(RejectReason::ModelNotTrained);
        };
        let prediction = match model.predict(ctx.features) {
            Ok(p) => p,
            Err(e) => return EntryDecision::Reject(RejectReason::PredictionFailed(e.to_string())),
        };

        match self.scenario(ctx.features, &prediction) {
            Some(scenario) => EntryDecision::Admit {
                scenario,
                prediction,
            },
            None => EntryDecision::Reject(RejectReason::NoScenario),
        }
    }

    /// Quote volume over the lookback. Skipped on short histories.
    fn check_liquidity(&self, ctx: &EntryContext<'_>) -> bool {
        let lookback = self.config.liquidity_lookback;
        if ctx.candles.len() < lookback {
            return true;
        }
        let volume: f64 = ctx.candles[ctx.candles.len() - lookback..]
            .iter()
            .map(|c| c.volume)
            .sum();
        volume * ctx.price >= self.config.min_liquidity
    }

    fn check_correlation(&self, ctx: &EntryContext<'_>) -> bool {
        if ctx.is_benchmark {
            return true;
        }
        let Some(benchmark) = ctx.benchmark else {
            debug!(instrument = ctx.instrument, "Benchmark unavailable, correlation gate skipped");
            return true;
        };
        match benchmark_return(benchmark, self.config.correlation_lookback) {
            Some(ret) => ret >= self.config.benchmark_drop_limit,
            None => true,
        }
    }

    fn check_trend(&self, f: &FeatureVector) -> bool {
        f.ema_short > f.ema_medium || f.price_change_medium > self.config.trend_floor
    }

    fn scenario(&self, f: &FeatureVector, p: &Prediction) -> Option<EntryScenario> {
        let cfg = &self.config;
        let oversold = f.rsi < cfg.oversold_rsi || f.bb_position < cfg.oversold_bb;

        if p.class == OutcomeLabel::Profit && oversold {
            return Some(EntryScenario::OversoldProfit);
        }
        if p.confidence > cfg.high_confidence {
            return Some(EntryScenario::HighConfidence);
        }
        let momentum = f.rsi < cfg.momentum_rsi && f.rsi_change > cfg.momentum_rsi_change;
        let volume = f.volume_trend > cfg.volume_trend_min;
        if oversold && momentum && volume && p.confidence > cfg.confirmation_confidence {
            return Some(EntryScenario::MomentumRecovery);
        }
        None
    }
}

/// Close-to-close return over the last `lookback` candles
pub fn benchmark_return(candles: &[Candle], lookback: usize) -> Option<f64> {
    if candles.len() <= lookback {
        return None;
    }
    let last = candles[candles.len() - 1].close;
    let base = candles[candles.len() - 1 - lookback].close;
    (base > 0.0).then(|| (last - base) / base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LearningConfig;
    use crate::ml_engine::training::tests::synthetic_dataset;
    use crate::ml_engine::TrainingPipeline;
    use chrono::{Duration, TimeZone, Utc};

    fn candles(closes: &[f64], volume: f64) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                timestamp: start + Duration::minutes(i as i64),
                open: c,
                high: c * 1.001,
                low: c * 0.999,
                close: c,
                volume,
            })
            .collect()
    }

    fn flat(n: usize, price: f64) -> Vec<Candle> {
        candles(&vec![price; n], 1_000_000.0)
    }

    fn uptrend_features() -> FeatureVector {
        let mut f = FeatureVector::from_slice(&[0.0; FeatureVector::NUM_FEATURES]).unwrap();
        f.rsi = 25.0;
        f.bb_position = 0.1;
        f.ema_short = 101.0;
        f.ema_medium = 100.0;
        f
    }

    fn trained_model() -> ModelState {
        TrainingPipeline::new(LearningConfig::default())
            .train(&synthetic_dataset(300), 1, 300, Utc::now())
            .unwrap()
    }

    fn pipeline() -> EntryPipeline {
        EntryPipeline::new(EntryConfig::default())
    }

    #[test]
    fn test_price_floor_rejects_first() {
        let c = flat(40, 50.0);
        let f = uptrend_features();
        let ctx = EntryContext {
            instrument: "DOGE",
            price: 50.0,
            candles: &c,
            features: &f,
            is_benchmark: false,
            benchmark: None,
        };
        assert_eq!(
            pipeline().evaluate(&ctx, None),
            EntryDecision::Reject(RejectReason::PriceTooLow)
        );
    }

    #[test]
    fn test_liquidity_gate() {
        let thin = candles(&[200.0; 30], 10.0);
        let f = uptrend_features();
        let ctx = EntryContext {
            instrument: "ETH",
            price: 200.0,
            candles: &thin,
            features: &f,
            is_benchmark: false,
            benchmark: None,
        };
        assert_eq!(
            pipeline().evaluate(&ctx, None),
            EntryDecision::Reject(RejectReason::InsufficientLiquidity)
        );

        // Fewer candles than the lookback skips the gate
        let short = candles(&[200.0; 20], 10.0);
        let ctx = EntryContext { candles: &short, ..ctx };
        assert_eq!(
            pipeline().evaluate(&ctx, None),
            EntryDecision::Reject(RejectReason::ModelNotTrained)
        );
    }

    #[test]
    fn test_benchmark_drop_blocks_others_not_benchmark() {
        // Benchmark falls 3.5% over the last 10 candles
        let mut closes = vec![100_000.0; 30];
        for (i, c) in closes.iter_mut().enumerate().skip(20) {
            *c = 100_000.0 * (1.0 - 0.0035 * (i - 19) as f64);
        }
        let bench = candles(&closes, 10_000.0);
        let ret = benchmark_return(&bench, 10).unwrap();
        assert!((ret + 0.035).abs() < 1e-9, "Expected ~-0.035, got {}", ret);

        let alt = flat(40, 2_000.0);
        let f = uptrend_features();
        let alt_ctx = EntryContext {
            instrument: "ETH",
            price: 2_000.0,
            candles: &alt,
            features: &f,
            is_benchmark: false,
            benchmark: Some(&bench),
        };
        assert_eq!(
            pipeline().evaluate(&alt_ctx, None),
            EntryDecision::Reject(RejectReason::BenchmarkFalling)
        );

        let bench_ctx = EntryContext {
            instrument: "BTC",
            price: 96_500.0,
            candles: &bench,
            features: &f,
            is_benchmark: true,
            benchmark: Some(&bench),
        };
        assert_eq!(
            pipeline().evaluate(&bench_ctx, None),
            EntryDecision::Reject(RejectReason::ModelNotTrained)
        );
    }

    #[test]
    fn test_missing_benchmark_passes_gate() {
        let alt = flat(40, 2_000.0);
        let f = uptrend_features();
        let ctx = EntryContext {
            instrument: "ETH",
            price: 2_000.0,
            candles: &alt,
            features: &f,
            is_benchmark: false,
            benchmark: None,
        };
        assert_eq!(
            pipeline().evaluate(&ctx, None),
            EntryDecision::Reject(RejectReason::ModelNotTrained)
        );
    }

    #[test]
    fn test_trend_gate() {
        let alt = flat(40, 2_000.0);
        let mut f = uptrend_features();
        f.ema_short = 99.0;
        f.price_change_medium = -0.025;
        let ctx = EntryContext {
            instrument: "ETH",
            price: 2_000.0,
            candles: &alt,
            features: &f,
            is_benchmark: false,
            benchmark: None,
        };
        assert_eq!(
            pipeline().evaluate(&ctx, None),
            EntryDecision::Reject(RejectReason::Downtrend)
        );
    }

    #[test]
    fn test_scenarios() {
        let p = pipeline();
        let mut f = uptrend_features();
        let profit = Prediction {
            class: OutcomeLabel::Profit,
            confidence: 0.55,
            probabilities: [0.2, 0.25, 0.55],
        };
        assert_eq!(p.scenario(&f, &profit), Some(EntryScenario::OversoldProfit));

        let neutral_sure = Prediction {
            class: OutcomeLabel::Neutral,
            confidence: 0.95,
            probabilities: [0.0, 0.05, 0.95],
        };
        f.rsi = 50.0;
        f.bb_position = 0.5;
        assert_eq!(p.scenario(&f, &neutral_sure), Some(EntryScenario::HighConfidence));

        let confirmed = Prediction {
            class: OutcomeLabel::Neutral,
            confidence: 0.75,
            probabilities: [0.1, 0.15, 0.75],
        };
        f.rsi = 35.0;
        f.bb_position = 0.15;
        f.rsi_change = 3.0;
        f.volume_trend = 0.3;
        assert_eq!(p.scenario(&f, &confirmed), Some(EntryScenario::MomentumRecovery));

        f.volume_trend = f64::NAN;
        assert_eq!(p.scenario(&f, &confirmed), None);
    }

    #[test]
    fn test_model_decides_after_gates() {
        let model = trained_model();
        let alt = flat(40, 2_000.0);
        let mut f = uptrend_features();
        // Feature layout the synthetic model reads as profit
        f.rsi = 28.0;
        f.macd_signal = 14.0;
        let ctx = EntryContext {
            instrument: "ETH",
            price: 2_000.0,
            candles: &alt,
            features: &f,
            is_benchmark: false,
            benchmark: None,
        };
        match pipeline().evaluate(&ctx, Some(&model)) {
            EntryDecision::Admit { scenario, prediction } => {
                assert_eq!(scenario, EntryScenario::OversoldProfit);
                assert_eq!(prediction.class, OutcomeLabel::Profit);
            }
            other => panic!("expected admission, got {:?}", other),
        }
    }
}
