//! Flat CSV journal of closed trades

use anyhow::{Context, Result};
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock as AsyncRwLock;

use crate::types::TradeRecord;

/// One journal line. Features are left out; they live in the outcome store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRow {
    pub timestamp: i64,
    pub trade_id: String,
    pub instrument: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub hold_secs: i64,
    pub realized_return: f64,
    pub label: String,
    pub predicted: String,
    pub confidence: f64,
    pub exit_reason: String,
}

impl From<&TradeRecord> for JournalRow {
    fn from(r: &TradeRecord) -> Self {
        Self {
            timestamp: r.exit_time.timestamp_millis(),
            trade_id: r.id.clone(),
            instrument: r.instrument.clone(),
            entry_price: r.entry_price,
            exit_price: r.exit_price,
            quantity: r.quantity,
            hold_secs: (r.exit_time - r.entry_time).num_seconds(),
            realized_return: r.realized_return,
            label: r.label.to_string(),
            predicted: r.predicted.map(|p| p.to_string()).unwrap_or_default(),
            confidence: r.confidence,
            exit_reason: r.exit_reason.to_string(),
        }
    }
}

pub struct TradeJournal {
    path: PathBuf,
    writer: AsyncRwLock<csv::Writer<fs::File>>,
}

impl TradeJournal {
    /// Open `<data_dir>/journal/trades.csv` for append
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join("journal");
        fs::create_dir_all(&dir).context("Failed to create journal directory")?;
        let path = dir.join("trades.csv");
        let writer = create_writer(&path)?;
        Ok(Self {
            path,
            writer: AsyncRwLock::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, trade: &TradeRecord) -> Result<()> {
        let row = JournalRow::from(trade);
        let mut writer = self.writer.write().await;
        writer.serialize(&row).context("Failed to write journal row")?;
        writer.flush().context("Failed to flush journal")?;
        Ok(())
    }
}

fn create_writer(path: &Path) -> Result<csv::Writer<fs::File>> {
    let file_has_data = path.exists() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open journal CSV")?;
    Ok(WriterBuilder::new().has_headers(!file_has_data).from_writer(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, OutcomeLabel};
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_header_written_once_across_reopen() {
        let dir = std::env::temp_dir().join(format!("evobot_journal_{}", uuid::Uuid::new_v4()));
        let now = Utc::now();
        let trade = TradeRecord {
            id: "t1".into(),
            instrument: "ETH".into(),
            entry_price: 2000.0,
            exit_price: 2040.0,
            entry_time: now - Duration::seconds(90),
            exit_time: now,
            quantity: 0.5,
            realized_return: 0.019,
            features: None,
            label: OutcomeLabel::Profit,
            exit_reason: ExitReason::TargetProfit,
            predicted: Some(OutcomeLabel::Profit),
            confidence: 0.82,
            timestamp: now,
        };

        let journal = TradeJournal::open(&dir).unwrap();
        journal.record(&trade).await.unwrap();
        drop(journal);
        let journal = TradeJournal::open(&dir).unwrap();
        journal.record(&trade).await.unwrap();

        let mut reader = csv::Reader::from_path(journal.path()).unwrap();
        let rows: Vec<JournalRow> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].hold_secs, 90);
        assert_eq!(rows[1].exit_reason, "TARGET_PROFIT");
        assert_eq!(rows[1].predicted, "profit");
        let _ = fs::remove_dir_all(&dir);
    }
}
