//! Exchange boundary
//!
//! `MarketData` and `OrderExecution` are the only ways the engine touches a
//! venue. Retry helpers wrap them with bounded exponential backoff.

pub mod paper;
pub mod replay;

pub use paper::PaperBroker;
pub use replay::CsvReplay;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::ExecutionConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{Candle, Fill, Side};

/// Source of candles and prices
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Latest `count` closed candles, oldest first
    async fn get_candles(&self, instrument: &str, interval: &str, count: usize) -> EngineResult<Vec<Candle>>;

    async fn get_current_price(&self, instrument: &str) -> EngineResult<f64>;

    /// Tradable universe
    async fn list_instruments(&self) -> EngineResult<Vec<String>>;
}

/// Order placement
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderExecution: Send + Sync {
    /// Market order. `size` is quote currency for buys and base quantity for sells.
    async fn submit_market_order(&self, instrument: &str, side: Side, size: f64) -> EngineResult<Fill>;

    /// Free quote balance
    async fn available_balance(&self) -> EngineResult<f64>;
}

/// Bounded retry with exponential backoff: `base * 2^(attempt-1)`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn market_data(cfg: &ExecutionConfig) -> Self {
        Self {
            max_retries: cfg.max_data_retries,
            base_delay: Duration::from_millis(cfg.data_backoff_ms),
        }
    }

    pub fn orders(cfg: &ExecutionConfig) -> Self {
        Self {
            max_retries: cfg.max_order_retries,
            base_delay: Duration::from_millis(cfg.order_backoff_ms),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Retry a market data call on `RateLimited` / `Unavailable` only
pub async fn fetch_with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                warn!(what, attempt, error = %e, "Market data retry");
                tokio::time::sleep(policy.delay(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry an order on any failure. The last error is returned once retries run out.
pub async fn submit_with_retry(
    executor: &dyn OrderExecution,
    policy: RetryPolicy,
    instrument: &str,
    side: Side,
    size: f64,
) -> EngineResult<Fill> {
    let mut attempt = 0;
    loop {
        match executor.submit_market_order(instrument, side, size).await {
            Ok(fill) => return Ok(fill),
            Err(e) if attempt < policy.max_retries => {
                attempt += 1;
                warn!(instrument, %side, attempt, error = %e, "Order retry");
                tokio::time::sleep(policy.delay(attempt)).await;
            }
            Err(e) => {
                return Err(match e {
                    EngineError::OrderFailed { .. } => e,
                    other => EngineError::OrderFailed {
                        instrument: instrument.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }
}
