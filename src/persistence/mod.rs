//! Outcome persistence
//!
//! - `OutcomeStore`: append-only JSON-lines log of closed trades, mirrored in
//!   memory for bounded-window reads
//! - `TradeJournal`: flat CSV of the same closes for analysis
//! - `PositionSnapshot`: open positions written on change so a restart can
//!   recover them

mod journal;

pub use journal::{JournalRow, TradeJournal};

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::types::{Position, TradeRecord};

/// Aggregate performance of a set of trades
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TradeStats {
    pub total_trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    /// Mean return of positive trades
    pub avg_win: f64,
    /// Mean magnitude of negative trades
    pub avg_loss: f64,
    pub avg_return: f64,
}

impl TradeStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TradeRecord>, win_threshold: f64) -> Self {
        let mut stats = TradeStats::default();
        let mut win_sum = 0.0;
        let mut win_n = 0usize;
        let mut loss_sum = 0.0;
        let mut loss_n = 0usize;
        let mut total = 0.0;

        for r in records {
            stats.total_trades += 1;
            total += r.realized_return;
            // Win rate and both averages split on the same threshold
            if r.is_win(win_threshold) {
                stats.wins += 1;
                win_sum += r.realized_return;
                win_n += 1;
            } else {
                loss_sum += -r.realized_return;
                loss_n += 1;
            }
        }

        if stats.total_trades > 0 {
            let n = stats.total_trades as f64;
            stats.win_rate = stats.wins as f64 / n;
            stats.avg_return = total / n;
        }
        if win_n > 0 {
            stats.avg_win = win_sum / win_n as f64;
        }
        if loss_n > 0 {
            stats.avg_loss = (loss_sum / loss_n as f64).max(0.0);
        }
        stats
    }
}

/// Append-only store of closed trades
pub struct OutcomeStore {
    path: PathBuf,
    records: RwLock<Vec<TradeRecord>>,
    writer: AsyncMutex<std::fs::File>,
}

impl OutcomeStore {
    /// Open (or create) `<data_dir>/outcomes.jsonl` and load its history
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir).context("Failed to create data directory")?;
        let path = dir.join("outcomes.jsonl");

        let mut records = Vec::new();
        if path.exists() {
            let file = fs::File::open(&path).context("Failed to open outcome store")?;
            for (lineno, line) in BufReader::new(file).lines().enumerate() {
                let line = line.context("Failed to read outcome store")?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TradeRecord>(&line) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping malformed outcome at line {}: {}", lineno + 1, e),
                }
            }
        }

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open outcome store for append")?;

        info!("📂 Outcome store loaded {} trades from {}", records.len(), path.display());
        Ok(Self {
            path,
            records: RwLock::new(records),
            writer: AsyncMutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one record, then expose it to readers
    pub async fn append(&self, record: TradeRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record).context("Failed to encode trade record")?;
        line.push('\n');
        {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(line.as_bytes())
                .context("Failed to write trade record")?;
            writer.flush().context("Failed to flush outcome store")?;
        }
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<TradeRecord>> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// The most recent `n` records, oldest first
    pub fn recent(&self, n: usize) -> Vec<TradeRecord> {
        let records = self.read();
        records[records.len().saturating_sub(n)..].to_vec()
    }

    pub fn all(&self) -> Vec<TradeRecord> {
        self.read().clone()
    }

    pub fn stats(&self, win_threshold: f64) -> TradeStats {
        TradeStats::from_records(self.read().iter(), win_threshold)
    }

    /// Instruments with the most closed trades, busiest first
    pub fn most_traded(&self, n: usize) -> Vec<String> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for r in self.read().iter() {
            *counts.entry(r.instrument.clone()).or_insert(0) += 1;
        }
        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.into_iter().take(n).map(|(instrument, _)| instrument).collect()
    }

    pub fn instrument_stats(&self, instrument: &str, win_threshold: f64) -> TradeStats {
        TradeStats::from_records(self.read().iter().filter(|t| t.instrument == instrument), win_threshold)
    }
}

/// Open positions persisted for restart recovery
pub struct PositionSnapshot {
    path: PathBuf,
}

impl PositionSnapshot {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("open_positions.json"),
        }
    }

    pub fn save(&self, positions: &HashMap<String, Position>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(positions)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).context("Failed to write position snapshot")?;
        fs::rename(&tmp, &self.path).context("Failed to replace position snapshot")?;
        Ok(())
    }

    pub fn load(&self) -> Result<HashMap<String, Position>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let json = fs::read_to_string(&self.path)?;
        let positions: HashMap<String, Position> =
            serde_json::from_str(&json).context("Failed to parse position snapshot")?;
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, Fill, OutcomeLabel, Side};
    use chrono::Utc;

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "evobot_persistence_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn record(instrument: &str, ret: f64) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            instrument: instrument.to_string(),
            entry_price: 100.0,
            exit_price: 100.0 * (1.0 + ret),
            entry_time: now,
            exit_time: now,
            quantity: 1.0,
            realized_return: ret,
            features: None,
            label: OutcomeLabel::from_return(ret, 0.005),
            exit_reason: ExitReason::Manual,
            predicted: None,
            confidence: 0.0,
            timestamp: now,
        }
    }

    #[tokio::test]
    async fn test_append_survives_reopen() {
        let dir = temp_data_dir("reopen");
        let store = OutcomeStore::open(&dir).unwrap();
        store.append(record("ETH", 0.02)).await.unwrap();
        store.append(record("SOL", -0.01)).await.unwrap();
        assert_eq!(store.count(), 2);
        drop(store);

        let reopened = OutcomeStore::open(&dir).unwrap();
        assert_eq!(reopened.count(), 2);
        assert_eq!(reopened.recent(1)[0].instrument, "SOL");
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_recent_is_bounded_window() {
        let dir = temp_data_dir("window");
        let store = OutcomeStore::open(&dir).unwrap();
        for i in 0..10 {
            store.append(record(&format!("C{}", i), 0.01)).await.unwrap();
        }
        let recent = store.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].instrument, "C7");
        assert_eq!(store.recent(50).len(), 10);
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_most_traded_ranks_by_count() {
        let dir = temp_data_dir("most_traded");
        let store = OutcomeStore::open(&dir).unwrap();
        for instrument in ["SOL", "ETH", "SOL", "ADA", "ETH", "SOL"] {
            store.append(record(instrument, 0.01)).await.unwrap();
        }
        assert_eq!(store.most_traded(2), vec!["SOL", "ETH"]);
        assert_eq!(store.most_traded(10), vec!["SOL", "ETH", "ADA"]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = temp_data_dir("malformed");
        fs::create_dir_all(&dir).unwrap();
        let good = serde_json::to_string(&record("ETH", 0.01)).unwrap();
        fs::write(dir.join("outcomes.jsonl"), format!("{}\nnot json\n\n", good)).unwrap();
        let store = OutcomeStore::open(&dir).unwrap();
        assert_eq!(store.count(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_trade_stats() {
        let records = vec![
            record("A", 0.04),
            record("A", 0.02),
            record("B", -0.03),
            record("B", 0.0005),
        ];
        let stats = TradeStats::from_records(records.iter(), 0.001);
        assert_eq!(stats.total_trades, 4);
        assert_eq!(stats.wins, 2);
        assert!((stats.win_rate - 0.5).abs() < 1e-12);
        // The 0.05% scratch trade sits below the threshold, so it is a loss
        // for the averages too
        assert!((stats.avg_win - 0.03).abs() < 1e-12, "Expected ~0.03, got {}", stats.avg_win);
        assert!(
            (stats.avg_loss - (0.03 - 0.0005) / 2.0).abs() < 1e-12,
            "Expected ~0.01475, got {}",
            stats.avg_loss
        );
    }

    #[test]
    fn test_trade_stats_scratch_trades_only() {
        let records = vec![record("A", 0.0005), record("A", 0.0008)];
        let stats = TradeStats::from_records(records.iter(), 0.001);
        assert_eq!(stats.wins, 0);
        assert_eq!(stats.avg_win, 0.0);
        assert_eq!(stats.avg_loss, 0.0);
    }

    #[tokio::test]
    async fn test_append_after_poisoned_lock_keeps_memory_and_disk_in_step() {
        let dir = temp_data_dir("poisoned");
        let store = OutcomeStore::open(&dir).unwrap();
        store.append(record("ETH", 0.02)).await.unwrap();

        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = store.records.write().unwrap();
            panic!("writer died holding the lock");
        }));
        assert!(poisoned.is_err());
        assert!(store.records.is_poisoned());

        store.append(record("SOL", -0.01)).await.unwrap();
        assert_eq!(store.count(), 2);
        assert_eq!(store.recent(1)[0].instrument, "SOL");

        let reopened = OutcomeStore::open(&dir).unwrap();
        assert_eq!(reopened.count(), store.count());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_position_snapshot_roundtrip() {
        let dir = temp_data_dir("positions");
        let snapshot = PositionSnapshot::new(&dir);
        assert!(snapshot.load().unwrap().is_empty());

        let fill = Fill {
            instrument: "ETH".into(),
            side: Side::Buy,
            price: 2000.0,
            quantity: 0.5,
            quote_amount: 1000.0,
            fee: 0.5,
            timestamp: Utc::now(),
        };
        let mut positions = HashMap::new();
        positions.insert("ETH".to_string(), Position::from_fill(&fill, None, None, 0.7));
        snapshot.save(&positions).unwrap();

        let loaded = snapshot.load().unwrap();
        assert_eq!(loaded["ETH"].entry_price, 2000.0);
        assert_eq!(loaded["ETH"].entry_time, positions["ETH"].entry_time);
        let _ = fs::remove_dir_all(&dir);
    }
}
