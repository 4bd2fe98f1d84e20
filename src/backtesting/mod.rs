//! Backtesting
//!
//! Replays candle history through a model and the fixed target/stop exits:
//! - one simulated position per instrument at a time
//! - capital carried from one instrument to the next
//! - win rate, profit factor, max drawdown and Sharpe over the closed trades

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{BacktestConfig, TradingConfig};
use crate::error::EngineResult;
use crate::features::{extract_features, FeatureVector, MIN_CANDLES};
use crate::ml_engine::{ModelState, Prediction};
use crate::types::{Candle, ExitReason, OutcomeLabel};

/// Anything that can score a feature vector
pub trait SignalModel {
    fn predict(&self, features: &FeatureVector) -> EngineResult<Prediction>;
}

impl SignalModel for ModelState {
    fn predict(&self, features: &FeatureVector) -> EngineResult<Prediction> {
        ModelState::predict(self, features)
    }
}

/// One simulated round trip
#[derive(Debug, Clone, Serialize)]
pub struct BacktestTrade {
    pub instrument: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Quote amount committed at entry
    pub amount: f64,
    /// Net of fees on both legs
    pub return_rate: f64,
    pub pnl: f64,
    pub confidence: f64,
    pub exit_reason: ExitReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_return: f64,
    pub final_capital: f64,
    /// Mean return of winning trades
    pub avg_win: f64,
    /// Mean loss magnitude of the remaining trades
    pub avg_loss: f64,
    pub profit_loss_ratio: f64,
    /// Gross profit over gross loss
    pub profit_factor: f64,
    pub max_drawdown: f64,
    /// Mean over population deviation of per-trade returns
    pub sharpe_ratio: f64,
    /// Average PnL per trade
    pub expectancy: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub finished_at: DateTime<Utc>,
    pub instruments: Vec<String>,
    /// Instruments whose history could not be fetched
    pub skipped: Vec<String>,
    /// Positions still open when their history ran out, left unscored
    pub open_at_end: usize,
    pub metrics: BacktestMetrics,
    pub validated: bool,
    pub trades: Vec<BacktestTrade>,
}

struct OpenTrade {
    entry_time: DateTime<Utc>,
    entry_price: f64,
    quantity: f64,
    amount: f64,
    confidence: f64,
}

pub struct Backtester {
    config: BacktestConfig,
    trading: TradingConfig,
    /// Profit-class probability an entry needs
    min_confidence: f64,
    min_order_amount: f64,
    fee_rate: f64,
    win_threshold: f64,
    /// Candles handed to feature extraction, as in live trading
    window: usize,
    capital: f64,
    capital_history: Vec<f64>,
    trades: Vec<BacktestTrade>,
    instruments: Vec<String>,
    open_at_end: usize,
}

impl Backtester {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BacktestConfig,
        trading: TradingConfig,
        min_confidence: f64,
        min_order_amount: f64,
        fee_rate: f64,
        win_threshold: f64,
        window: usize,
    ) -> Self {
        let capital = config.initial_capital;
        Self {
            config,
            trading,
            min_confidence,
            min_order_amount,
            fee_rate,
            win_threshold,
            window: window.max(MIN_CANDLES),
            capital,
            capital_history: vec![capital],
            trades: Vec::new(),
            instruments: Vec::new(),
            open_at_end: 0,
        }
    }

    pub fn capital(&self) -> f64 {
        self.capital
    }

    pub fn trades(&self) -> &[BacktestTrade] {
        &self.trades
    }

    /// Walk one instrument's candles oldest first
    pub fn simulate(&mut self, instrument: &str, candles: &[Candle], model: &dyn SignalModel) {
        self.instruments.push(instrument.to_string());
        let mut position: Option<OpenTrade> = None;
        let before = self.trades.len();

        for i in (MIN_CANDLES - 1)..candles.len() {
            let candle = &candles[i];
            let price = candle.close;
            if price <= 0.0 {
                continue;
            }

            if let Some(open) = &position {
                let move_rate = (price - open.entry_price) / open.entry_price;
                let reason = if move_rate >= self.trading.target_profit {
                    Some(ExitReason::TargetProfit)
                } else if move_rate <= -self.trading.stop_loss {
                    Some(ExitReason::StopLoss)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    if let Some(open) = position.take() {
                        self.close(instrument, open, candle, reason);
                    }
                }
                continue;
            }

            let start = (i + 1).saturating_sub(self.window);
            let features = match extract_features(&candles[start..=i]) {
                Ok(f) => f,
                Err(e) => {
                    debug!(instrument, error = %e, "Backtest bar skipped");
                    continue;
                }
            };
            let prediction = match model.predict(&features) {
                Ok(p) => p,
                Err(e) => {
                    debug!(instrument, error = %e, "Backtest prediction failed");
                    continue;
                }
            };
            if prediction.class != OutcomeLabel::Profit || prediction.confidence < self.min_confidence {
                continue;
            }

            let amount = self
                .trading
                .trade_amount
                .min(self.capital * self.config.capital_fraction);
            if amount < self.min_order_amount {
                continue;
            }
            position = Some(OpenTrade {
                entry_time: candle.timestamp,
                entry_price: price,
                quantity: amount * (1.0 - self.fee_rate) / price,
                amount,
                confidence: prediction.confidence,
            });
        }

        if position.is_some() {
            self.open_at_end += 1;
        }
        info!(
            instrument,
            candles = candles.len(),
            trades = self.trades.len() - before,
            capital = self.capital,
            "📊 Backtest instrument done"
        );
    }

    fn close(&mut self, instrument: &str, open: OpenTrade, candle: &Candle, reason: ExitReason) {
        let proceeds = open.quantity * candle.close * (1.0 - self.fee_rate);
        let pnl = proceeds - open.amount;
        self.capital += pnl;
        self.capital_history.push(self.capital);
        self.trades.push(BacktestTrade {
            instrument: instrument.to_string(),
            entry_time: open.entry_time,
            exit_time: candle.timestamp,
            entry_price: open.entry_price,
            exit_price: candle.close,
            amount: open.amount,
            return_rate: pnl / open.amount,
            pnl,
            confidence: open.confidence,
            exit_reason: reason,
        });
    }

    pub fn metrics(&self) -> BacktestMetrics {
        let initial = self.config.initial_capital;
        if self.trades.is_empty() {
            return BacktestMetrics {
                final_capital: self.capital,
                ..BacktestMetrics::default()
            };
        }

        let total = self.trades.len();
        let (wins, losses): (Vec<&BacktestTrade>, Vec<&BacktestTrade>) = self
            .trades
            .iter()
            .partition(|t| t.return_rate > self.win_threshold);

        let avg_win = mean(wins.iter().map(|t| t.return_rate));
        let avg_loss = mean(losses.iter().map(|t| -t.return_rate)).max(0.0);
        let profit_loss_ratio = if avg_loss > 0.0 { avg_win / avg_loss } else { 0.0 };

        let gross_profit: f64 = self.trades.iter().map(|t| t.pnl.max(0.0)).sum();
        let gross_loss: f64 = self.trades.iter().map(|t| (-t.pnl).max(0.0)).sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let mut peak = initial;
        let mut max_drawdown: f64 = 0.0;
        for &capital in &self.capital_history {
            peak = peak.max(capital);
            if peak > 0.0 {
                max_drawdown = max_drawdown.max((peak - capital) / peak);
            }
        }

        let returns: Vec<f64> = self.trades.iter().map(|t| t.return_rate).collect();
        let avg_return = mean(returns.iter().copied());
        let variance = mean(returns.iter().map(|r| (r - avg_return).powi(2)));
        let std_dev = variance.sqrt();
        let sharpe_ratio = if returns.len() > 1 && std_dev > 0.0 {
            avg_return / std_dev
        } else {
            0.0
        };

        BacktestMetrics {
            total_trades: total,
            wins: wins.len(),
            losses: losses.len(),
            win_rate: wins.len() as f64 / total as f64,
            total_return: if initial > 0.0 { (self.capital - initial) / initial } else { 0.0 },
            final_capital: self.capital,
            avg_win,
            avg_loss,
            profit_loss_ratio,
            profit_factor,
            max_drawdown,
            sharpe_ratio,
            expectancy: self.trades.iter().map(|t| t.pnl).sum::<f64>() / total as f64,
        }
    }

    /// Good enough to act on: win rate and payoff both clear their floors
    pub fn is_validated(&self, metrics: &BacktestMetrics) -> bool {
        metrics.total_trades > 0
            && metrics.win_rate >= self.config.min_win_rate
            && metrics.profit_loss_ratio >= self.config.min_profit_loss_ratio
    }

    pub fn into_report(self, skipped: Vec<String>) -> BacktestReport {
        let metrics = self.metrics();
        let validated = self.is_validated(&metrics);
        BacktestReport {
            finished_at: Utc::now(),
            instruments: self.instruments,
            skipped,
            open_at_end: self.open_at_end,
            metrics,
            validated,
            trades: self.trades,
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n > 0 {
        sum / n as f64
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use chrono::Duration;

    /// Always calls for a profitable entry
    struct AlwaysBuy(f64);

    impl SignalModel for AlwaysBuy {
        fn predict(&self, _features: &FeatureVector) -> EngineResult<Prediction> {
            Ok(Prediction {
                class: OutcomeLabel::Profit,
                confidence: self.0,
                probabilities: [1.0 - self.0, 0.0, self.0],
            })
        }
    }

    struct Broken;

    impl SignalModel for Broken {
        fn predict(&self, _features: &FeatureVector) -> EngineResult<Prediction> {
            Err(EngineError::ModelNotTrained)
        }
    }

    fn candles(prices: &[f64]) -> Vec<Candle> {
        let start = Utc::now() - Duration::minutes(prices.len() as i64);
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Candle {
                timestamp: start + Duration::minutes(i as i64),
                open: p,
                high: p * 1.001,
                low: p * 0.999,
                close: p,
                volume: 1_000_000.0,
            })
            .collect()
    }

    /// Buy at 100, take profit at 101.5, buy again at 101.5, stop out at 99
    fn win_then_loss() -> Vec<Candle> {
        let mut prices = vec![100.0; MIN_CANDLES];
        prices.extend([100.5, 101.5, 101.5, 99.0]);
        candles(&prices)
    }

    fn backtester() -> Backtester {
        Backtester::new(
            BacktestConfig::default(),
            TradingConfig::default(),
            0.7,
            5_000.0,
            0.0,
            0.001,
            60,
        )
    }

    #[test]
    fn test_no_trades_reports_untouched_capital() {
        let mut bt = backtester();
        bt.simulate("ETH", &candles(&[100.0; 20]), &AlwaysBuy(0.9));
        let report = bt.into_report(vec![]);
        assert_eq!(report.metrics.total_trades, 0);
        assert_eq!(report.metrics.final_capital, 1_000_000.0);
        assert!(!report.validated);
    }

    #[test]
    fn test_target_then_stop() {
        let mut bt = backtester();
        bt.simulate("ETH", &win_then_loss(), &AlwaysBuy(0.9));

        let trades = bt.trades();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].exit_reason, ExitReason::TargetProfit);
        assert_eq!(trades[0].entry_price, 100.0);
        assert_eq!(trades[0].amount, 10_000.0);
        assert!((trades[0].pnl - 150.0).abs() < 1e-6, "Expected ~150, got {}", trades[0].pnl);
        assert_eq!(trades[1].exit_reason, ExitReason::StopLoss);
        assert_eq!(trades[1].entry_price, 101.5);
        assert!(trades[1].entry_time > trades[0].exit_time);

        let m = bt.metrics();
        let loss = 1.0 - 99.0 / 101.5;
        assert_eq!(m.wins, 1);
        assert_eq!(m.losses, 1);
        assert!((m.win_rate - 0.5).abs() < 1e-12);
        assert!((m.avg_win - 0.015).abs() < 1e-9, "Expected ~0.015, got {}", m.avg_win);
        assert!((m.avg_loss - loss).abs() < 1e-9, "Expected ~{}, got {}", loss, m.avg_loss);
        assert!((m.profit_factor - 150.0 / (10_000.0 * loss)).abs() < 1e-9);
        assert!((m.final_capital - (1_000_000.0 + 150.0 - 10_000.0 * loss)).abs() < 1e-6);

        let peak = 1_000_150.0;
        assert!((m.max_drawdown - (10_000.0 * loss) / peak).abs() < 1e-9);

        let mu = (0.015 - loss) / 2.0;
        let sd = (0.015 - mu).abs();
        assert!((m.sharpe_ratio - mu / sd).abs() < 1e-9, "got {}", m.sharpe_ratio);

        // Losing payoff fails validation
        assert!(!bt.is_validated(&m));
    }

    #[test]
    fn test_low_confidence_never_enters() {
        let mut bt = backtester();
        bt.simulate("ETH", &win_then_loss(), &AlwaysBuy(0.6));
        assert!(bt.trades().is_empty());

        let mut bt = backtester();
        bt.simulate("ETH", &win_then_loss(), &Broken);
        assert!(bt.trades().is_empty());
    }

    #[test]
    fn test_open_position_at_end_is_left_unscored() {
        let mut prices = vec![100.0; MIN_CANDLES];
        prices.extend([100.2, 100.4]);
        let mut bt = backtester();
        bt.simulate("SOL", &candles(&prices), &AlwaysBuy(0.9));
        let report = bt.into_report(vec!["ADA".to_string()]);
        assert_eq!(report.open_at_end, 1);
        assert_eq!(report.metrics.total_trades, 0);
        assert_eq!(report.instruments, vec!["SOL"]);
        assert_eq!(report.skipped, vec!["ADA"]);
    }

    #[test]
    fn test_capital_carries_across_instruments_and_caps_size() {
        let config = BacktestConfig {
            initial_capital: 60_000.0,
            ..BacktestConfig::default()
        };
        let mut bt = Backtester::new(config, TradingConfig::default(), 0.7, 5_000.0, 0.0, 0.001, 60);
        bt.simulate("ETH", &win_then_loss(), &AlwaysBuy(0.9));
        let after_eth = bt.capital();
        bt.simulate("SOL", &win_then_loss(), &AlwaysBuy(0.9));

        // 10% of capital is below the configured trade amount
        assert_eq!(bt.trades().len(), 4);
        assert_eq!(bt.trades()[0].amount, 6_000.0);
        assert!(bt.trades().iter().all(|t| t.amount < 6_100.0));
        assert!((bt.trades()[2].amount - after_eth * 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_loss_free_run_has_no_payoff_ratio() {
        let mut prices = vec![100.0; MIN_CANDLES];
        // Each pair opens then takes profit
        let mut p = 100.0;
        for _ in 0..5 {
            p *= 1.02;
            prices.push(p);
            prices.push(p);
        }
        let mut bt = backtester();
        bt.simulate("ETH", &candles(&prices), &AlwaysBuy(0.95));
        let m = bt.metrics();
        assert_eq!(m.total_trades, 5);
        assert_eq!(m.win_rate, 1.0);
        assert!(m.profit_factor.is_infinite());
        assert_eq!(m.max_drawdown, 0.0);
        // No losses means no payoff ratio, so the run is not validated
        assert!(!bt.is_validated(&m));
    }
}
