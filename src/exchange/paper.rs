//! Paper broker
//!
//! Fills market orders against the current price from a `MarketData` source
//! with fixed slippage and fee, and keeps cash and holdings in memory.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::PaperConfig;
use crate::error::{EngineError, EngineResult};
use crate::exchange::{MarketData, OrderExecution};
use crate::types::{Fill, Side};

const BPS: f64 = 10_000.0;

#[derive(Debug, Default)]
struct PaperAccount {
    cash: f64,
    holdings: HashMap<String, f64>,
}

pub struct PaperBroker {
    market: Arc<dyn MarketData>,
    account: Mutex<PaperAccount>,
    slippage: f64,
    fee_rate: f64,
}

impl PaperBroker {
    pub fn new(market: Arc<dyn MarketData>, cfg: &PaperConfig) -> Self {
        info!(
            "📝 Paper broker ready with {:.2} quote balance",
            cfg.initial_balance
        );
        Self {
            market,
            account: Mutex::new(PaperAccount {
                cash: cfg.initial_balance,
                holdings: HashMap::new(),
            }),
            slippage: cfg.slippage_bps / BPS,
            fee_rate: cfg.fee_bps / BPS,
        }
    }

    pub async fn holding(&self, instrument: &str) -> f64 {
        self.account
            .lock()
            .await
            .holdings
            .get(instrument)
            .copied()
            .unwrap_or(0.0)
    }

    fn rejected(instrument: &str, reason: String) -> EngineError {
        EngineError::OrderFailed {
            instrument: instrument.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl OrderExecution for PaperBroker {
    async fn submit_market_order(&self, instrument: &str, side: Side, size: f64) -> EngineResult<Fill> {
        if !(size.is_finite() && size > 0.0) {
            return Err(Self::rejected(instrument, format!("invalid size {}", size)));
        }
        let mid = self.market.get_current_price(instrument).await?;
        let mut account = self.account.lock().await;

        let fill = match side {
            Side::Buy => {
                // `size` covers notional plus fee
                if account.cash < size {
                    return Err(Self::rejected(
                        instrument,
                        format!("insufficient cash {:.2} for {:.2}", account.cash, size),
                    ));
                }
                let price = mid * (1.0 + self.slippage);
                let quote_amount = size / (1.0 + self.fee_rate);
                let fee = size - quote_amount;
                let quantity = quote_amount / price;
                account.cash -= size;
                *account.holdings.entry(instrument.to_string()).or_insert(0.0) += quantity;
                Fill {
                    instrument: instrument.to_string(),
                    side,
                    price,
                    quantity,
                    quote_amount,
                    fee,
                    timestamp: Utc::now(),
                }
            }
            Side::Sell => {
                let held = account.holdings.get(instrument).copied().unwrap_or(0.0);
                if held + 1e-12 < size {
                    return Err(Self::rejected(
                        instrument,
                        format!("holding {} below sell size {}", held, size),
                    ));
                }
                let price = mid * (1.0 - self.slippage);
                let quote_amount = price * size;
                let fee = quote_amount * self.fee_rate;
                account.cash += quote_amount - fee;
                let remaining = held - size;
                if remaining <= 1e-12 {
                    account.holdings.remove(instrument);
                } else {
                    account.holdings.insert(instrument.to_string(), remaining);
                }
                Fill {
                    instrument: instrument.to_string(),
                    side,
                    price,
                    quantity: size,
                    quote_amount,
                    fee,
                    timestamp: Utc::now(),
                }
            }
        };
        Ok(fill)
    }

    async fn available_balance(&self) -> EngineResult<f64> {
        Ok(self.account.lock().await.cash)
    }
}
