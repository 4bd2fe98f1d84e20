//! Configuration management for EvoBot
//!
//! Loads defaults, then `config/default` and `config/local` files, then
//! `EVOBOT__*` environment variables (after reading `.env`).

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub trading: TradingConfig,
    pub entry: EntryConfig,
    pub exit: ExitConfig,
    pub sizing: SizingConfig,
    pub risk: RiskConfig,
    pub learning: LearningConfig,
    pub discovery: DiscoveryConfig,
    pub execution: ExecutionConfig,
    pub persistence: PersistenceConfig,
    pub paper: PaperConfig,
    pub backtest: BacktestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Version tag for logging
    pub tag: String,
    /// Instruments watched from startup
    pub instruments: Vec<String>,
    /// Market benchmark used by the correlation gate
    pub benchmark: String,
    /// Candle interval requested from market data
    pub candle_interval: String,
    /// Candles fetched per evaluation
    pub candle_count: usize,
    /// Trading loop period
    pub tick_interval_secs: u64,
    /// Risk governor period, shorter than the trading tick
    pub governor_interval_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            tag: env!("CARGO_PKG_VERSION").to_string(),
            instruments: vec!["BTC".to_string(), "ETH".to_string()],
            benchmark: "BTC".to_string(),
            candle_interval: "1m".to_string(),
            candle_count: 60,
            tick_interval_secs: 10,
            governor_interval_secs: 5,
        }
    }
}

/// Entry gates and scenario thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    pub min_price: f64,
    pub liquidity_lookback: usize,
    /// Minimum quote volume (sum of volumes * price) over the lookback
    pub min_liquidity: f64,
    pub correlation_lookback: usize,
    /// Benchmark return below which non-benchmark entries are blocked
    pub benchmark_drop_limit: f64,
    /// Medium-horizon price change still counted as trend-up
    pub trend_floor: f64,
    pub oversold_rsi: f64,
    pub oversold_bb: f64,
    pub momentum_rsi: f64,
    pub momentum_rsi_change: f64,
    pub volume_trend_min: f64,
    pub high_confidence: f64,
    pub confirmation_confidence: f64,
    pub failed_buy_cooldown_secs: i64,
    pub loss_cooldown_secs: i64,
    pub win_cooldown_secs: i64,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            min_price: 100.0,
            liquidity_lookback: 24,
            min_liquidity: 100_000_000.0,
            correlation_lookback: 10,
            benchmark_drop_limit: -0.03,
            trend_floor: -0.02,
            oversold_rsi: 30.0,
            oversold_bb: 0.2,
            momentum_rsi: 40.0,
            momentum_rsi_change: 2.0,
            volume_trend_min: 0.2,
            high_confidence: 0.90,
            confirmation_confidence: 0.70,
            failed_buy_cooldown_secs: 60,
            loss_cooldown_secs: 1800,
            win_cooldown_secs: 300,
        }
    }
}

/// Exit ladder parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Fee per leg used by the net-profit check
    pub fee_rate: f64,
    pub dynamic_target_floor: f64,
    pub dynamic_target_weight: f64,
    /// Drop from the current candle open that counts as a flash crash
    pub flash_crash_threshold: f64,
    pub trailing_activation: f64,
    pub trailing_distance: f64,
    pub overbought_bb: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            fee_rate: 0.0005,
            dynamic_target_floor: 0.01,
            dynamic_target_weight: 0.5,
            flash_crash_threshold: -0.03,
            trailing_activation: 0.015,
            trailing_distance: 0.01,
            overbought_bb: 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    pub min_order_amount: f64,
    /// Multiplier on the raw Kelly fraction (0.5 = half-Kelly)
    pub kelly_multiplier: f64,
    pub max_kelly_fraction: f64,
    pub max_balance_fraction: f64,
    pub min_trades_for_kelly: usize,
    /// Realized return above which a trade counts as a win
    pub win_threshold: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            min_order_amount: 5_000.0,
            kelly_multiplier: 0.5,
            max_kelly_fraction: 0.25,
            max_balance_fraction: 0.3,
            min_trades_for_kelly: 30,
            win_threshold: 0.001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Drawdown from peak equity that halts trading (0.05 = 5%)
    pub max_drawdown: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self { max_drawdown: 0.05 }
    }
}

/// Training pipeline and retraining scheduler parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    pub training_window: usize,
    pub min_training_samples: usize,
    pub label_threshold: f64,
    pub recency_decay: f64,
    pub recency_floor: f64,
    pub n_estimators: usize,
    pub shallow_depth: u16,
    pub deep_depth: u16,
    /// Training split size at which the deeper trees and no PCA are used
    pub small_sample_limit: usize,
    pub pca_variance: f64,
    pub outlier_contamination: f64,
    pub outlier_min_samples: usize,
    pub validation_fraction: f64,
    pub seed: u64,
    pub min_new_trades: usize,
    pub accuracy_drop: f64,
    pub recent_window: usize,
    pub win_rate_drop: f64,
    pub max_model_age_hours: i64,
    /// Wait after a failed retrain before the next automatic attempt
    pub retry_backoff_secs: i64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            training_window: 500,
            min_training_samples: 30,
            label_threshold: 0.005,
            recency_decay: 0.02,
            recency_floor: 0.1,
            n_estimators: 25,
            shallow_depth: 3,
            deep_depth: 5,
            small_sample_limit: 100,
            pca_variance: 0.95,
            outlier_contamination: 0.1,
            outlier_min_samples: 30,
            validation_fraction: 0.2,
            seed: 42,
            min_new_trades: 30,
            accuracy_drop: 0.05,
            recent_window: 20,
            win_rate_drop: 0.10,
            max_model_age_hours: 24,
            retry_backoff_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_size: usize,
    pub top_n: usize,
    pub max_watchlist: usize,
    pub min_confidence: f64,
    pub min_score: f64,
    /// Token bucket refill rate for discovery fetches
    pub requests_per_sec: f64,
    pub burst: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            batch_size: 50,
            top_n: 5,
            max_watchlist: 10,
            min_confidence: 0.6,
            min_score: 60.0,
            requests_per_sec: 8.0,
            burst: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub max_order_retries: u32,
    pub order_backoff_ms: u64,
    pub max_data_retries: u32,
    pub data_backoff_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_order_retries: 3,
            order_backoff_ms: 500,
            max_data_retries: 2,
            data_backoff_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory (outcome store, model bundle, journal, open positions)
    pub data_dir: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}

/// Paper broker and candle replay used by the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    pub initial_balance: f64,
    pub slippage_bps: f64,
    pub fee_bps: f64,
    /// Directory of `<INSTRUMENT>.csv` candle files
    pub candles_dir: String,
    /// Wall-clock seconds per replayed candle
    pub replay_step_secs: u64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: 1_000_000.0,
            slippage_bps: 5.0,
            fee_bps: 5.0,
            candles_dir: "./data/candles".to_string(),
            replay_step_secs: 10,
        }
    }
}

/// Historical replay of the installed model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Run one backtest when the runner starts
    pub run_on_start: bool,
    pub initial_capital: f64,
    /// Largest share of simulated capital one entry may use
    pub capital_fraction: f64,
    /// Candles of history fetched per instrument
    pub candle_count: usize,
    /// Instruments taken from trade history when none are given
    pub max_instruments: usize,
    pub min_win_rate: f64,
    pub min_profit_loss_ratio: f64,
    /// Trades a validated run needs before it triggers a retrain
    pub min_trades_for_retrain: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            run_on_start: false,
            initial_capital: 1_000_000.0,
            capital_fraction: 0.1,
            candle_count: 200,
            max_instruments: 10,
            min_win_rate: 0.45,
            min_profit_loss_ratio: 1.5,
            min_trades_for_retrain: 30,
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let defaults = Config::try_from(&AppConfig::default())
            .context("Failed to build default configuration")?;

        let config = Config::builder()
            .add_source(defaults)
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (EVOBOT__SECTION__KEY)
            .add_source(
                Environment::with_prefix("EVOBOT")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("bot.instruments"),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Cross-field sanity checks, run once at startup
    pub fn validate(&self) -> Result<()> {
        self.trading
            .validate()
            .context("Invalid [trading] section")?;

        if self.bot.candle_count < crate::features::MIN_CANDLES {
            bail!(
                "bot.candle_count must be at least {}, got {}",
                crate::features::MIN_CANDLES,
                self.bot.candle_count
            );
        }
        if self.bot.governor_interval_secs == 0 || self.bot.tick_interval_secs == 0 {
            bail!("loop intervals must be positive");
        }
        if self.bot.governor_interval_secs > self.bot.tick_interval_secs {
            bail!(
                "governor interval ({}s) must not exceed the trading tick ({}s)",
                self.bot.governor_interval_secs,
                self.bot.tick_interval_secs
            );
        }
        if !(self.risk.max_drawdown > 0.0 && self.risk.max_drawdown < 1.0) {
            bail!("risk.max_drawdown must be in (0, 1)");
        }
        if !(self.learning.validation_fraction > 0.0 && self.learning.validation_fraction < 0.5) {
            bail!("learning.validation_fraction must be in (0, 0.5)");
        }
        if self.learning.n_estimators == 0 {
            bail!("learning.n_estimators must be positive");
        }
        if self.discovery.batch_size == 0 || self.discovery.requests_per_sec <= 0.0 {
            bail!("discovery batch size and request rate must be positive");
        }
        if !(self.backtest.capital_fraction > 0.0 && self.backtest.capital_fraction <= 1.0) {
            bail!("backtest.capital_fraction must be in (0, 1]");
        }
        if self.backtest.candle_count <= crate::features::MIN_CANDLES {
            bail!(
                "backtest.candle_count must exceed {}, got {}",
                crate::features::MIN_CANDLES,
                self.backtest.candle_count
            );
        }
        Ok(())
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} instruments={:?} benchmark={} tick={}s amount={:.0} target={:.3} stop={:.3} net={} dyn_target={} dyn_size={}",
            self.bot.tag,
            self.bot.instruments,
            self.bot.benchmark,
            self.bot.tick_interval_secs,
            self.trading.trade_amount,
            self.trading.target_profit,
            self.trading.stop_loss,
            self.trading.use_net_profit,
            self.trading.use_dynamic_target,
            self.trading.use_dynamic_sizing,
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_governor_must_be_faster_than_tick() {
        let mut cfg = AppConfig::default();
        cfg.bot.governor_interval_secs = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_backtest_needs_room_for_features() {
        let mut cfg = AppConfig::default();
        cfg.backtest.candle_count = crate::features::MIN_CANDLES;
        assert!(cfg.validate().is_err());
        cfg.backtest.candle_count = 200;
        cfg.backtest.capital_fraction = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_digest_mentions_benchmark() {
        let cfg = AppConfig::default();
        assert!(cfg.digest().contains("benchmark=BTC"));
    }
}
