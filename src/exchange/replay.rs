//! CSV candle replay
//!
//! Serves `<dir>/<INSTRUMENT>.csv` files (timestamp in epoch millis, then
//! OHLCV) as a `MarketData` source. A shared replay clock decides which
//! candles are visible; `advance` steps it to the next candle close.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::exchange::MarketData;
use crate::types::Candle;

#[derive(Debug, Deserialize)]
struct CandleRow {
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

pub struct CsvReplay {
    series: BTreeMap<String, Vec<Candle>>,
    clock: RwLock<DateTime<Utc>>,
}

impl CsvReplay {
    /// Load every CSV in `dir`. The clock starts where the longest series has
    /// `warmup` candles behind it.
    pub fn load(dir: impl AsRef<Path>, warmup: usize) -> Result<Self> {
        let dir = dir.as_ref();
        let mut series = BTreeMap::new();
        for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            let Some(instrument) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let mut reader = csv::Reader::from_path(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let mut candles = Vec::new();
            for row in reader.deserialize::<CandleRow>() {
                let row = row.with_context(|| format!("Bad candle row in {}", path.display()))?;
                let Some(timestamp) = Utc.timestamp_millis_opt(row.timestamp).single() else {
                    continue;
                };
                candles.push(Candle {
                    timestamp,
                    open: row.open,
                    high: row.high,
                    low: row.low,
                    close: row.close,
                    volume: row.volume,
                });
            }
            candles.sort_by_key(|c| c.timestamp);
            series.insert(instrument.to_uppercase(), candles);
        }
        Self::from_series(series, warmup)
    }

    pub fn from_series(series: BTreeMap<String, Vec<Candle>>, warmup: usize) -> Result<Self> {
        let longest = series
            .values()
            .max_by_key(|c| c.len())
            .filter(|c| !c.is_empty())
            .context("No candle data to replay")?;
        let start = longest[warmup.saturating_sub(1).min(longest.len() - 1)].timestamp;
        info!(
            "📂 Replay loaded {} instruments, clock at {}",
            series.len(),
            start
        );
        Ok(Self {
            series,
            clock: RwLock::new(start),
        })
    }

    pub fn now(&self) -> Option<DateTime<Utc>> {
        self.clock.read().map(|c| *c).ok()
    }

    /// Step to the next candle timestamp in any series. False once exhausted.
    pub fn advance(&self) -> bool {
        let Ok(mut clock) = self.clock.write() else {
            return false;
        };
        let next = self
            .series
            .values()
            .filter_map(|candles| candles.iter().map(|c| c.timestamp).find(|t| *t > *clock))
            .min();
        match next {
            Some(t) => {
                *clock = t;
                true
            }
            None => false,
        }
    }

    fn visible(&self, instrument: &str) -> EngineResult<&[Candle]> {
        let candles = self
            .series
            .get(instrument)
            .ok_or_else(|| EngineError::Unavailable(format!("no replay data for {}", instrument)))?;
        let now = self
            .now()
            .ok_or_else(|| EngineError::Unavailable("replay clock poisoned".to_string()))?;
        let end = candles.partition_point(|c| c.timestamp <= now);
        if end == 0 {
            return Err(EngineError::Unavailable(format!("{} has no candles yet", instrument)));
        }
        Ok(&candles[..end])
    }
}

#[async_trait]
impl MarketData for CsvReplay {
    /// The files hold a single interval, so `interval` is not used
    async fn get_candles(&self, instrument: &str, _interval: &str, count: usize) -> EngineResult<Vec<Candle>> {
        let visible = self.visible(instrument)?;
        Ok(visible[visible.len().saturating_sub(count)..].to_vec())
    }

    async fn get_current_price(&self, instrument: &str) -> EngineResult<f64> {
        let visible = self.visible(instrument)?;
        Ok(visible[visible.len() - 1].close)
    }

    async fn list_instruments(&self) -> EngineResult<Vec<String>> {
        Ok(self.series.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_csv(dir: &Path, name: &str, n: usize, start_ms: i64) {
        let mut out = String::from("timestamp,open,high,low,close,volume\n");
        for i in 0..n {
            let c = 100.0 + i as f64;
            out.push_str(&format!(
                "{},{},{},{},{},{}\n",
                start_ms + i as i64 * 60_000,
                c,
                c + 1.0,
                c - 1.0,
                c + 0.5,
                1000.0
            ));
        }
        fs::write(dir.join(format!("{}.csv", name)), out).unwrap();
    }

    #[tokio::test]
    async fn test_replay_exposes_only_past_candles() {
        let dir = std::env::temp_dir().join(format!("evobot_replay_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        write_csv(&dir, "btc", 40, 1_700_000_000_000);
        write_csv(&dir, "eth", 10, 1_700_000_000_000 + 35 * 60_000);
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let replay = CsvReplay::load(&dir, 30).unwrap();
        assert_eq!(replay.list_instruments().await.unwrap(), vec!["BTC", "ETH"]);

        let candles = replay.get_candles("BTC", "1m", 60).await.unwrap();
        assert_eq!(candles.len(), 30);
        assert_eq!(replay.get_current_price("BTC").await.unwrap(), 129.5);
        assert!(replay.get_candles("ETH", "1m", 60).await.is_err());

        for _ in 0..6 {
            assert!(replay.advance());
        }
        assert_eq!(replay.get_candles("BTC", "1m", 60).await.unwrap().len(), 36);
        assert_eq!(replay.get_candles("ETH", "1m", 60).await.unwrap().len(), 1);
        assert!(matches!(
            replay.get_current_price("XRP").await,
            Err(EngineError::Unavailable(_))
        ));
        let _ = fs::remove_dir_all(&dir);
    }
}
