//! Discovery - rotating scans of the instrument universe
//!
//! Each run takes the next fixed-size slice of the universe, rate limits its
//! fetches through a token bucket, scores every candidate 0-100 and hands the
//! recommended ones to the engine's watchlist.

pub mod rate_limit;

pub use rate_limit::TokenBucket;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::config::DiscoveryConfig;
use crate::exchange::{fetch_with_retry, MarketData, RetryPolicy};
use crate::features::{extract_features, FeatureVector};
use crate::ml_engine::{ModelState, Prediction};
use crate::types::OutcomeLabel;

/// Score weight of model confidence
const CONFIDENCE_POINTS: f64 = 40.0;
/// Score weight of per-instrument history
const HISTORY_POINTS: f64 = 20.0;
/// History score with no closed trades on the instrument
const NEUTRAL_HISTORY: f64 = 10.0;
const VOLUME_POINTS: f64 = 5.0;
const VOLATILITY_POINTS: f64 = 5.0;
/// ATR/price that earns the full volatility score
const FULL_VOLATILITY_RATIO: f64 = 0.01;

#[derive(Debug, Clone, Serialize)]
pub struct CandidateScore {
    pub instrument: String,
    pub price: f64,
    pub score: f64,
    pub predicted: OutcomeLabel,
    pub confidence: f64,
    pub recommended: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub batch: Vec<String>,
    pub failed: usize,
    /// Sorted by score, best first
    pub candidates: Vec<CandidateScore>,
}

impl ScanReport {
    /// Recommended candidates, best first, at most `n`
    pub fn top_recommended(&self, n: usize) -> Vec<&CandidateScore> {
        self.candidates.iter().filter(|c| c.recommended).take(n).collect()
    }
}

pub struct DiscoveryScanner {
    config: DiscoveryConfig,
    bucket: TokenBucket,
    cursor: AtomicUsize,
}

impl DiscoveryScanner {
    pub fn new(config: DiscoveryConfig) -> Self {
        let bucket = TokenBucket::new(config.requests_per_sec, config.burst);
        Self {
            config,
            bucket,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Next slice of `universe`, wrapping to the start once the end is reached
    pub fn next_batch(&self, universe: &[String]) -> Vec<String> {
        if universe.is_empty() {
            return Vec::new();
        }
        let size = self.config.batch_size.min(universe.len());
        let start = self.cursor.load(Ordering::SeqCst) % universe.len();
        let end = (start + size).min(universe.len());
        let next = if end >= universe.len() { 0 } else { end };
        self.cursor.store(next, Ordering::SeqCst);
        if next == 0 {
            debug!("Discovery completed a full pass over {} instruments", universe.len());
        }
        universe[start..end].to_vec()
    }

    /// Score one candidate on a 0-100 scale
    pub fn score(&self, features: &FeatureVector, prediction: &Prediction, price: f64, history_win_rate: Option<f64>) -> f64 {
        let mut score = prediction.confidence.clamp(0.0, 1.0) * CONFIDENCE_POINTS;

        let mut technical = 0.0;
        if features.rsi < 30.0 {
            technical += 10.0;
        } else if features.rsi < 40.0 {
            technical += 5.0;
        }
        if features.bb_position < 0.2 {
            technical += 10.0;
        } else if features.bb_position < 0.3 {
            technical += 5.0;
        }
        if features.macd > features.macd_signal {
            technical += 10.0;
        }
        score += technical;

        score += history_win_rate
            .map(|w| w.clamp(0.0, 1.0) * HISTORY_POINTS)
            .unwrap_or(NEUTRAL_HISTORY);

        if features.volume_ratio.is_finite() {
            score += (features.volume_ratio.max(0.0) * VOLUME_POINTS).min(VOLUME_POINTS);
        }
        let volatility = features.atr_ratio(price) / FULL_VOLATILITY_RATIO * VOLATILITY_POINTS;
        score += volatility.clamp(0.0, VOLATILITY_POINTS);

        score.min(100.0)
    }

    pub fn recommends(&self, features: &FeatureVector, prediction: &Prediction, score: f64) -> bool {
        if prediction.class == OutcomeLabel::Loss {
            return false;
        }
        if prediction.confidence < self.config.min_confidence || score < self.config.min_score {
            return false;
        }
        features.rsi < 40.0 || features.bb_position < 0.3 || features.macd > features.macd_signal
    }

    /// Scan the next batch. Instruments in `skip` (watched, held or cooling
    /// down) are passed over without a fetch.
    #[allow(clippy::too_many_arguments)]
    pub async fn scan<H>(
        &self,
        market: &dyn MarketData,
        model: &ModelState,
        universe: &[String],
        skip: &HashSet<String>,
        interval: &str,
        candle_count: usize,
        retry: RetryPolicy,
        history: H,
    ) -> ScanReport
    where
        H: Fn(&str) -> Option<f64>,
    {
        let batch = self.next_batch(universe);
        let mut report = ScanReport {
            batch: batch.clone(),
            ..ScanReport::default()
        };

        for instrument in batch.iter().filter(|i| !skip.contains(*i)) {
            self.bucket.acquire().await;
            let candles = match fetch_with_retry(retry, "discovery candles", || {
                market.get_candles(instrument, interval, candle_count)
            })
            .await
            {
                Ok(c) => c,
                Err(e) => {
                    report.failed += 1;
                    debug!(instrument = instrument.as_str(), error = %e, "Discovery fetch failed");
                    continue;
                }
            };
            let Some(price) = candles.last().map(|c| c.close) else {
                report.failed += 1;
                continue;
            };
            let features = match extract_features(&candles) {
                Ok(f) => f,
                Err(e) => {
                    report.failed += 1;
                    debug!(instrument = instrument.as_str(), error = %e, "Discovery features unavailable");
                    continue;
                }
            };
            let prediction = match model.predict(&features) {
                Ok(p) => p,
                Err(e) => {
                    report.failed += 1;
                    debug!(instrument = instrument.as_str(), error = %e, "Discovery prediction failed");
                    continue;
                }
            };

            let score = self.score(&features, &prediction, price, history(instrument));
            report.candidates.push(CandidateScore {
                instrument: instrument.clone(),
                price,
                score,
                predicted: prediction.class,
                confidence: prediction.confidence,
                recommended: self.recommends(&features, &prediction, score),
            });
        }

        report
            .candidates
            .sort_by(|a, b| b.score.total_cmp(&a.score));
        info!(
            batch = report.batch.len(),
            scored = report.candidates.len(),
            failed = report.failed,
            recommended = report.candidates.iter().filter(|c| c.recommended).count(),
            "🔭 Discovery batch scanned"
        );
        report
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchEntry {
    pub instrument: String,
    pub added_at: DateTime<Utc>,
}

/// Insertion-ordered watch set
#[derive(Debug, Clone, Default, Serialize)]
pub struct Watchlist {
    entries: VecDeque<WatchEntry>,
}

impl Watchlist {
    pub fn new<I: IntoIterator<Item = String>>(seed: I, now: DateTime<Utc>) -> Self {
        let mut list = Self::default();
        for instrument in seed {
            list.add(&instrument, now);
        }
        list
    }

    pub fn contains(&self, instrument: &str) -> bool {
        self.entries.iter().any(|e| e.instrument == instrument)
    }

    /// False if already present
    pub fn add(&mut self, instrument: &str, now: DateTime<Utc>) -> bool {
        if self.contains(instrument) {
            return false;
        }
        self.entries.push_back(WatchEntry {
            instrument: instrument.to_string(),
            added_at: now,
        });
        true
    }

    pub fn remove(&mut self, instrument: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.instrument != instrument);
        self.entries.len() != before
    }

    pub fn instruments(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.instrument.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop the oldest entries without a position until at most `max` remain.
    /// Held instruments are never evicted, so the list may stay above `max`.
    pub fn evict_over(&mut self, max: usize, held: &HashSet<String>) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.entries.len() > max {
            let Some(idx) = self.entries.iter().position(|e| !held.contains(&e.instrument)) else {
                break;
            };
            if let Some(entry) = self.entries.remove(idx) {
                evicted.push(entry.instrument);
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LearningConfig;
    use crate::exchange::MockMarketData;
    use crate::error::EngineError;
    use crate::ml_engine::training::tests::synthetic_dataset;
    use crate::ml_engine::TrainingPipeline;
    use crate::types::Candle;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn features() -> FeatureVector {
        FeatureVector::from_slice(&[0.0; FeatureVector::NUM_FEATURES]).unwrap()
    }

    fn prediction(class: OutcomeLabel, confidence: f64) -> Prediction {
        Prediction {
            class,
            confidence,
            probabilities: [0.0, 1.0 - confidence, confidence],
        }
    }

    fn universe(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("C{:03}", i)).collect()
    }

    fn scanner(batch_size: usize) -> DiscoveryScanner {
        DiscoveryScanner::new(DiscoveryConfig {
            batch_size,
            ..DiscoveryConfig::default()
        })
    }

    #[test]
    fn test_batches_rotate_and_wrap() {
        let s = scanner(50);
        let u = universe(120);
        assert_eq!(s.next_batch(&u)[0], "C000");
        assert_eq!(s.next_batch(&u)[0], "C050");
        let tail = s.next_batch(&u);
        assert_eq!(tail.len(), 20);
        assert_eq!(tail[0], "C100");
        assert_eq!(s.next_batch(&u)[0], "C000");
    }

    #[test]
    fn test_score_components() {
        let s = scanner(50);
        let mut f = features();
        f.rsi = 25.0;
        f.bb_position = 0.15;
        f.macd = 1.0;
        f.macd_signal = 0.5;
        f.volume_ratio = 2.0;
        f.atr = 2.0;
        let p = prediction(OutcomeLabel::Profit, 0.8);

        // 32 + 30 + 10 (no history) + 5 + 5
        let score = s.score(&f, &p, 100.0, None);
        assert!((score - 82.0).abs() < 1e-9, "Expected ~82, got {}", score);
        let with_history = s.score(&f, &p, 100.0, Some(0.25));
        assert!((with_history - 77.0).abs() < 1e-9);

        f.volume_ratio = f64::NAN;
        assert!((s.score(&f, &p, 100.0, None) - 77.0).abs() < 1e-9);
    }

    #[test]
    fn test_recommendation_rules() {
        let s = scanner(50);
        let mut f = features();
        f.rsi = 35.0;
        f.bb_position = 0.5;
        assert!(s.recommends(&f, &prediction(OutcomeLabel::Neutral, 0.7), 65.0));
        assert!(!s.recommends(&f, &prediction(OutcomeLabel::Loss, 0.7), 90.0));
        assert!(!s.recommends(&f, &prediction(OutcomeLabel::Profit, 0.55), 90.0));
        assert!(!s.recommends(&f, &prediction(OutcomeLabel::Profit, 0.7), 59.0));

        f.rsi = 55.0;
        assert!(!s.recommends(&f, &prediction(OutcomeLabel::Profit, 0.7), 70.0));
        f.macd = 1.0;
        assert!(s.recommends(&f, &prediction(OutcomeLabel::Profit, 0.7), 70.0));
    }

    #[test]
    fn test_watchlist_eviction_spares_held() {
        let now = Utc::now();
        let mut list = Watchlist::new(["BTC".to_string(), "ETH".to_string()], now);
        assert!(!list.add("BTC", now));
        list.add("SOL", now + ChronoDuration::seconds(1));
        list.add("BNB", now + ChronoDuration::seconds(2));

        let held: HashSet<String> = ["BTC".to_string()].into();
        let evicted = list.evict_over(2, &held);
        assert_eq!(evicted, vec!["ETH".to_string(), "SOL".to_string()]);
        assert_eq!(list.instruments(), vec!["BTC".to_string(), "BNB".to_string()]);

        let all_held: HashSet<String> = ["BTC".to_string(), "BNB".to_string()].into();
        assert!(list.evict_over(0, &all_held).is_empty());
    }

    fn rising_candles(n: usize) -> Vec<Candle> {
        let start = Utc::now() - ChronoDuration::minutes(n as i64);
        (0..n)
            .map(|i| {
                let c = 1_000.0 + (i as f64 * 0.7).sin() * 10.0;
                Candle {
                    timestamp: start + ChronoDuration::minutes(i as i64),
                    open: c,
                    high: c + 2.0,
                    low: c - 2.0,
                    close: c + 0.5,
                    volume: 100.0 + i as f64,
                }
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_skips_and_counts_failures() {
        let model = TrainingPipeline::new(LearningConfig::default())
            .train(&synthetic_dataset(300), 1, 300, Utc::now())
            .unwrap();
        let mut market = MockMarketData::new();
        market
            .expect_get_candles()
            .withf(|i, _, _| i == "C001")
            .times(1)
            .returning(|_, _, n| Ok(rising_candles(n)));
        market
            .expect_get_candles()
            .withf(|i, _, _| i == "C002")
            .times(3)
            .returning(|_, _, _| Err(EngineError::RateLimited("429".into())));

        let s = scanner(3);
        let skip: HashSet<String> = ["C000".to_string()].into();
        let retry = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
        };
        let report = s
            .scan(&market, &model, &universe(3), &skip, "1m", 60, retry, |_| None)
            .await;
        assert_eq!(report.batch.len(), 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].instrument, "C001");
        let score = report.candidates[0].score;
        assert!((0.0..=100.0).contains(&score));
    }
}
