//! Trading engine
//!
//! Owns every piece of shared state and runs three timers:
//! - trading tick: exits, then entries, then the retraining check
//! - risk governor: equity marks and the drawdown halt
//! - discovery: rotating universe scans feeding the watchlist
//!
//! State is read and changed through the methods here only. Network calls are
//! made with the state lock released.

pub mod state;

pub use state::{Alert, AlertLevel, EngineStatus, ModelSummary, SessionStats, TradingState};

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backtesting::{BacktestReport, Backtester};
use crate::config::{AppConfig, ConfigUpdate, TradingConfig};
use crate::discovery::{DiscoveryScanner, ScanReport, Watchlist};
use crate::error::{EngineError, EngineResult};
use crate::exchange::{fetch_with_retry, submit_with_retry, MarketData, OrderExecution, RetryPolicy};
use crate::features::{extract_features, FeatureVector, MIN_CANDLES};
use crate::ml_engine::{
    Dataset, InstalledModel, LearningSnapshot, ModelHandle, ModelState, ModelStore, Prediction,
    RetrainScheduler, RetrainTrigger, TrainingPipeline,
};
use crate::persistence::{OutcomeStore, PositionSnapshot, TradeJournal};
use crate::risk::{mark_equity, DrawdownGovernor, ExitContext, ExitStateMachine, GovernorReading, PositionSizer, SizeDecision};
use crate::strategy::{CooldownTracker, EntryContext, EntryDecision, EntryPipeline, EntryScenario};
use crate::types::{Candle, ExitReason, Position, PositionStatus, Side, TradeRecord};

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub exits: usize,
    pub entries: usize,
    pub skipped: usize,
}

pub struct TradingEngine {
    config: AppConfig,
    trading: RwLock<Arc<TradingConfig>>,
    state: AsyncMutex<TradingState>,
    /// Serializes order submission so a position is never sold twice
    order_gate: AsyncMutex<()>,
    model: ModelHandle,
    model_store: ModelStore,
    outcomes: OutcomeStore,
    journal: TradeJournal,
    positions_file: PositionSnapshot,
    market: Arc<dyn MarketData>,
    executor: Arc<dyn OrderExecution>,
    entry: EntryPipeline,
    exits: ExitStateMachine,
    sizer: PositionSizer,
    scheduler: RetrainScheduler,
    discovery: DiscoveryScanner,
    running: AtomicBool,
    halted: AtomicBool,
    retraining: AtomicBool,
    backtesting: AtomicBool,
    last_retrain_failure: RwLock<Option<DateTime<Utc>>>,
}

impl TradingEngine {
    /// Open the stores, load the model bundle and restore open positions
    pub fn new(
        config: AppConfig,
        market: Arc<dyn MarketData>,
        executor: Arc<dyn OrderExecution>,
    ) -> anyhow::Result<Arc<Self>> {
        let data_dir = config.persistence.data_dir.clone();
        let outcomes = OutcomeStore::open(&data_dir)?;
        let journal = TradeJournal::open(&data_dir)?;
        let model_store = ModelStore::new(&data_dir);
        let model = model_store.load().context("Failed to load model bundle")?;
        let positions_file = PositionSnapshot::new(&data_dir);
        let positions = positions_file.load()?;

        let now = Utc::now();
        let mut watchlist = Watchlist::new(config.bot.instruments.iter().cloned(), now);
        for instrument in positions.keys() {
            watchlist.add(instrument, now);
        }
        if !positions.is_empty() {
            info!("📂 Restored {} open positions", positions.len());
        }

        let state = TradingState {
            positions,
            watchlist,
            cooldowns: CooldownTracker::new(),
            governor: DrawdownGovernor::new(config.risk.clone()),
            session: state::SessionStats::new(now),
            alerts: Vec::new(),
            last_backtest: None,
        };

        Ok(Arc::new(Self {
            trading: RwLock::new(Arc::new(config.trading.clone())),
            state: AsyncMutex::new(state),
            order_gate: AsyncMutex::new(()),
            model: ModelHandle::new(model),
            model_store,
            outcomes,
            journal,
            positions_file,
            market,
            executor,
            entry: EntryPipeline::new(config.entry.clone()),
            exits: ExitStateMachine::new(config.exit.clone()),
            sizer: PositionSizer::new(config.sizing.clone()),
            scheduler: RetrainScheduler::new(config.learning.clone(), config.sizing.win_threshold),
            discovery: DiscoveryScanner::new(config.discovery.clone()),
            running: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            retraining: AtomicBool::new(false),
            backtesting: AtomicBool::new(false),
            last_retrain_failure: RwLock::new(None),
            config,
        }))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn trading_config(&self) -> Arc<TradingConfig> {
        self.trading
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn is_retraining(&self) -> bool {
        self.retraining.load(Ordering::SeqCst)
    }

    pub fn model(&self) -> Option<Arc<ModelState>> {
        self.model.current()
    }

    pub fn outcomes(&self) -> &OutcomeStore {
        &self.outcomes
    }

    pub async fn positions(&self) -> Vec<Position> {
        self.state.lock().await.positions.values().cloned().collect()
    }

    pub async fn watchlist(&self) -> Vec<String> {
        self.state.lock().await.watchlist.instruments()
    }

    fn data_retry(&self) -> RetryPolicy {
        RetryPolicy::market_data(&self.config.execution)
    }

    fn order_retry(&self) -> RetryPolicy {
        RetryPolicy::orders(&self.config.execution)
    }

    fn win_threshold(&self) -> f64 {
        self.config.sizing.win_threshold
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    /// Start (or restart after a halt). Resets the governor's equity peak and
    /// bootstraps a model when none is installed.
    pub async fn start(self: &Arc<Self>) {
        let equity = match self.current_equity().await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Equity unavailable at start, peak resets on first mark");
                0.0
            }
        };
        self.state.lock().await.governor.reset(equity);
        let was_halted = self.halted.swap(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        info!(equity, was_halted, "▶️ Trading started");

        if !self.model.is_trained() {
            self.spawn_retrain(RetrainTrigger::ColdStart {
                samples: self.outcomes.count(),
            });
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("⏸️ Trading stopped");
        }
    }

    /// Validate and swap in a new trading config. The prior one stays on error.
    pub fn update_config(&self, update: &ConfigUpdate) -> EngineResult<Arc<TradingConfig>> {
        // Applied under the write lock so concurrent partial updates compose
        let mut guard = self
            .trading
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = match update.apply(&guard) {
            Ok(next) => Arc::new(next),
            Err(e) => {
                warn!(error = %e, "Config update rejected");
                return Err(e);
            }
        };
        *guard = next.clone();
        drop(guard);
        info!(
            amount = next.trade_amount,
            target = next.target_profit,
            stop = next.stop_loss,
            "⚙️ Trading config updated"
        );
        Ok(next)
    }

    /// Start a retrain now. False when one is already running.
    pub fn force_retrain(self: &Arc<Self>) -> bool {
        self.spawn_retrain(RetrainTrigger::Manual).is_some()
    }

    pub async fn force_discovery_scan(&self) -> EngineResult<ScanReport> {
        self.run_discovery().await
    }

    pub async fn add_to_watchlist(&self, instrument: &str) -> bool {
        let added = self.state.lock().await.watchlist.add(instrument, Utc::now());
        if added {
            info!(instrument, "👀 Added to watchlist");
        }
        added
    }

    /// Refuses instruments that hold a position
    pub async fn remove_from_watchlist(&self, instrument: &str) -> EngineResult<bool> {
        let mut st = self.state.lock().await;
        if st.positions.contains_key(instrument) {
            return Err(EngineError::PositionOpen(instrument.to_string()));
        }
        let removed = st.watchlist.remove(instrument);
        if removed {
            info!(instrument, "Removed from watchlist");
        }
        Ok(removed)
    }

    pub async fn status(&self) -> EngineStatus {
        let model = self.model.current().map(|m| ModelSummary {
            generation: m.generation,
            holdout_accuracy: m.metrics.holdout_accuracy,
            total_samples: m.metrics.total_samples,
            pca_applied: m.metrics.pca_applied,
            trained_at: m.trained_at,
        });
        let recent = self.outcomes.recent(self.config.learning.recent_window);
        let recent_win_rate = crate::ml_engine::scheduler::win_rate(&recent, self.win_threshold());

        let st = self.state.lock().await;
        EngineStatus {
            running: self.is_running(),
            halted: self.is_halted(),
            retraining: self.is_retraining(),
            positions: st.positions.values().cloned().collect(),
            watchlist: st.watchlist.instruments(),
            cooldowns: st.cooldowns.snapshot(),
            model,
            all_time: self.outcomes.stats(self.win_threshold()),
            recent_win_rate,
            session: st.session.clone(),
            peak_equity: st.governor.peak(),
            config: (*self.trading_config()).clone(),
            alerts: st.alerts.clone(),
            last_backtest: st.last_backtest.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    /// Spawn the trading, governor and discovery timers
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(engine.config.bot.tick_interval_secs));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !engine.is_running() {
                    continue;
                }
                let summary = engine.tick().await;
                debug!(?summary, "Tick complete");
            }
        }));

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(engine.config.bot.governor_interval_secs));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if engine.is_running() {
                    engine.governor_check().await;
                }
            }
        }));

        if self.config.discovery.enabled {
            let engine = self.clone();
            handles.push(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(engine.config.discovery.interval_secs));
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    if !engine.is_running() || !engine.model.is_trained() {
                        continue;
                    }
                    if let Err(e) = engine.run_discovery().await {
                        warn!(error = %e, "Discovery scan failed");
                    }
                }
            }));
        }

        handles
    }

    /// One trading tick
    pub async fn tick(self: &Arc<Self>) -> TickSummary {
        let mut summary = TickSummary::default();
        if self.is_halted() {
            return summary;
        }
        self.state.lock().await.session.ticks += 1;

        let trading = self.trading_config();
        self.evaluate_exits(&trading, &mut summary).await;
        if !self.is_halted() {
            self.evaluate_entries(&trading, &mut summary).await;
            self.maybe_retrain(Utc::now());
        }
        summary
    }

    // ------------------------------------------------------------------
    // Exits
    // ------------------------------------------------------------------

    async fn evaluate_exits(&self, trading: &TradingConfig, summary: &mut TickSummary) {
        let active: Vec<Position> = {
            let st = self.state.lock().await;
            st.positions.values().cloned().collect()
        };

        for mut position in active {
            let instrument = position.instrument.clone();

            // A close that failed earlier is retried as is
            if position.status == PositionStatus::Closing {
                let reason = position.exit_reason.unwrap_or(ExitReason::Manual);
                if self.close_position(&instrument, reason).await.is_ok() {
                    summary.exits += 1;
                }
                continue;
            }

            let (candles, price) = match self.fetch_market(&instrument).await {
                Ok(m) => m,
                Err(e) => {
                    debug!(instrument = instrument.as_str(), error = %e, "Exit check skipped");
                    summary.skipped += 1;
                    continue;
                }
            };
            let features = extract_features(&candles).ok();
            let ctx = ExitContext {
                price,
                candle_open: candles.last().map(|c| c.open),
                features: features.as_ref(),
            };
            let reason = self.exits.evaluate(&mut position, &ctx, trading);

            {
                let mut st = self.state.lock().await;
                let Some(live) = st.positions.get_mut(&instrument) else {
                    continue;
                };
                if live.id != position.id || live.status != PositionStatus::Open {
                    continue;
                }
                live.peak_price = position.peak_price;
                live.trailing_active = position.trailing_active;
                live.status = position.status;
                live.exit_reason = position.exit_reason;
            }

            if let Some(reason) = reason {
                info!(
                    instrument = instrument.as_str(),
                    %reason,
                    price,
                    ret = position.raw_return(price),
                    "🔔 Exit triggered"
                );
                if self.close_position(&instrument, reason).await.is_ok() {
                    summary.exits += 1;
                }
            }
        }
    }

    /// Sell a position at market. On success the trade is recorded and the
    /// cooldown registered; on failure the position stays `Closing` and is
    /// flagged for reconciliation.
    pub async fn close_position(&self, instrument: &str, reason: ExitReason) -> EngineResult<Option<TradeRecord>> {
        let _gate = self.order_gate.lock().await;

        let position = {
            let mut st = self.state.lock().await;
            let Some(p) = st.positions.get_mut(instrument) else {
                return Ok(None);
            };
            if p.status == PositionStatus::Open || reason == ExitReason::DrawdownHalt {
                p.exit_reason = Some(reason);
            }
            p.status = PositionStatus::Closing;
            p.clone()
        };
        let reason = position.exit_reason.unwrap_or(reason);

        let fill = match submit_with_retry(
            self.executor.as_ref(),
            self.order_retry(),
            instrument,
            Side::Sell,
            position.quantity,
        )
        .await
        {
            Ok(fill) => fill,
            Err(e) => {
                let message = format!("close of {} ({}) needs reconciliation: {}", instrument, reason, e);
                error!(instrument, %reason, error = %e, "🚨 Sell failed after retries");
                let mut st = self.state.lock().await;
                if let Some(p) = st.positions.get_mut(instrument) {
                    p.reconcile_required = true;
                }
                st.push_alert(AlertLevel::Error, message);
                self.save_positions(&st.positions);
                return Err(e);
            }
        };

        let record = TradeRecord::close(&position, &fill, reason, self.config.learning.label_threshold);
        let win = record.is_win(self.win_threshold());
        {
            let mut st = self.state.lock().await;
            st.positions.remove(instrument);
            let trading = self.trading_config();
            st.cooldowns
                .record_exit(instrument, fill.price, win, trading.rebuy_threshold, &self.config.entry, Utc::now());
            st.session.record_close(&record, position.cost, win);
            self.save_positions(&st.positions);
        }

        if let Err(e) = self.outcomes.append(record.clone()).await {
            error!(instrument, error = %e, "Failed to persist trade outcome");
            self.state
                .lock()
                .await
                .push_alert(AlertLevel::Error, format!("outcome for {} not persisted: {}", instrument, e));
        }
        if let Err(e) = self.journal.record(&record).await {
            warn!(instrument, error = %e, "Failed to write trade journal");
        }

        info!(
            instrument,
            %reason,
            exit_price = fill.price,
            ret = record.realized_return,
            label = %record.label,
            "💰 Position closed"
        );
        Ok(Some(record))
    }

    // ------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------

    async fn evaluate_entries(&self, trading: &TradingConfig, summary: &mut TickSummary) {
        let mut balance = match self.executor.available_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Balance unavailable, entries skipped");
                return;
            }
        };
        if balance < trading.trade_amount {
            debug!(balance, "Balance below trade amount, entries skipped");
            return;
        }

        let candidates: Vec<String> = {
            let st = self.state.lock().await;
            st.watchlist
                .instruments()
                .into_iter()
                .filter(|i| !st.positions.contains_key(i))
                .collect()
        };
        if candidates.is_empty() {
            return;
        }

        let model = self.model.current();
        let benchmark = self.config.bot.benchmark.clone();
        let benchmark_candles = self.fetch_candles(&benchmark).await.ok();

        for instrument in candidates {
            if balance < trading.trade_amount || self.is_halted() {
                break;
            }
            let (candles, price) = match self.fetch_market(&instrument).await {
                Ok(m) => m,
                Err(e) => {
                    debug!(instrument = instrument.as_str(), error = %e, "Entry check skipped");
                    summary.skipped += 1;
                    continue;
                }
            };
            if self
                .state
                .lock()
                .await
                .cooldowns
                .is_blocked(&instrument, Some(price), Utc::now())
            {
                continue;
            }
            let features = match extract_features(&candles) {
                Ok(f) => f,
                Err(e) => {
                    debug!(instrument = instrument.as_str(), error = %e, "Entry check skipped");
                    summary.skipped += 1;
                    continue;
                }
            };

            let ctx = EntryContext {
                instrument: &instrument,
                price,
                candles: &candles,
                features: &features,
                is_benchmark: instrument == benchmark,
                benchmark: benchmark_candles.as_deref(),
            };
            let (scenario, prediction) = match self.entry.evaluate(&ctx, model.as_deref()) {
                EntryDecision::Admit { scenario, prediction } => (scenario, prediction),
                EntryDecision::Reject(_) => {
                    self.state.lock().await.session.entries_rejected += 1;
                    continue;
                }
            };

            let stats = self.outcomes.stats(self.win_threshold());
            let size = self.sizer.size(trading, &stats, prediction.confidence, balance);
            if size.amount > balance {
                debug!(instrument = instrument.as_str(), amount = size.amount, balance, "Stake exceeds balance");
                continue;
            }

            if self
                .open_position(&instrument, &size, features, prediction, scenario)
                .await
                .is_ok()
            {
                summary.entries += 1;
                balance = self
                    .executor
                    .available_balance()
                    .await
                    .unwrap_or(balance - size.amount);
            }
        }
    }

    async fn open_position(
        &self,
        instrument: &str,
        size: &SizeDecision,
        features: FeatureVector,
        prediction: Prediction,
        scenario: EntryScenario,
    ) -> EngineResult<()> {
        let fill = {
            let _gate = self.order_gate.lock().await;
            if self.is_halted() {
                return Err(EngineError::Halted(format!("buy of {} not sent", instrument)));
            }
            if self.state.lock().await.positions.contains_key(instrument) {
                return Ok(());
            }

            match submit_with_retry(
                self.executor.as_ref(),
                self.order_retry(),
                instrument,
                Side::Buy,
                size.amount,
            )
            .await
            {
                Ok(fill) => fill,
                Err(e) => {
                    warn!(instrument, error = %e, "Buy failed, instrument cooling down");
                    self.state
                        .lock()
                        .await
                        .cooldowns
                        .record_failed_buy(instrument, &self.config.entry, Utc::now());
                    return Err(e);
                }
            }
        };

        let position = Position::from_fill(&fill, Some(features), Some(prediction.class), prediction.confidence);
        info!(
            instrument,
            price = fill.price,
            amount = size.amount,
            mode = ?size.mode,
            %scenario,
            confidence = prediction.confidence,
            "🟢 Position opened"
        );

        // The halt flag is read under the same lock that inserts, so either the
        // halt sweep sees this position or this call closes it
        let halted = {
            let mut st = self.state.lock().await;
            st.positions.insert(instrument.to_string(), position);
            st.session.trades_opened += 1;
            self.save_positions(&st.positions);
            self.is_halted()
        };
        if halted {
            warn!(instrument, "Halted while the buy was filling, closing it");
            self.close_position(instrument, ExitReason::DrawdownHalt).await?;
            return Err(EngineError::Halted(format!("buy of {} closed on halt", instrument)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Risk governor
    // ------------------------------------------------------------------

    async fn current_equity(&self) -> EngineResult<f64> {
        let cash = self.executor.available_balance().await?;
        let positions: HashMap<String, Position> = self.state.lock().await.positions.clone();
        let mut prices = HashMap::new();
        for instrument in positions.keys() {
            match self.market.get_current_price(instrument).await {
                Ok(p) => {
                    prices.insert(instrument.clone(), p);
                }
                Err(e) => debug!(instrument = instrument.as_str(), error = %e, "Marking at entry price"),
            }
        }
        Ok(mark_equity(cash, &positions, &prices))
    }

    /// Mark equity and halt on a drawdown breach
    pub async fn governor_check(&self) -> Option<GovernorReading> {
        if self.is_halted() {
            return None;
        }
        let equity = match self.current_equity().await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Equity mark failed");
                return None;
            }
        };
        let reading = self.state.lock().await.governor.observe(equity);
        if reading.tripped {
            self.halt(&reading).await;
        }
        Some(reading)
    }

    async fn halt(&self, reading: &GovernorReading) {
        self.halted.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        self.state.lock().await.push_alert(
            AlertLevel::Error,
            format!(
                "drawdown {:.2}% from peak {:.2}, trading halted",
                reading.drawdown * 100.0,
                reading.peak
            ),
        );

        // Sweep until every position has had a forced close attempt, including
        // ones a buy in flight inserted after the first pass
        let mut attempted: HashSet<String> = HashSet::new();
        loop {
            let pending: Vec<String> = {
                let st = self.state.lock().await;
                st.positions
                    .keys()
                    .filter(|i| !attempted.contains(*i))
                    .cloned()
                    .collect()
            };
            if pending.is_empty() {
                break;
            }
            for instrument in pending {
                if let Err(e) = self.close_position(&instrument, ExitReason::DrawdownHalt).await {
                    error!(instrument = instrument.as_str(), error = %e, "Forced close failed");
                }
                attempted.insert(instrument);
            }
        }
    }

    // ------------------------------------------------------------------
    // Learning
    // ------------------------------------------------------------------

    /// Spawn a retrain when the scheduler asks for one. Without a model a cold
    /// start is retried on every check once the failure backoff has passed.
    fn maybe_retrain(self: &Arc<Self>, now: DateTime<Utc>) -> Option<JoinHandle<()>> {
        if self.is_retraining() || self.in_retrain_backoff(now) {
            return None;
        }
        let records = self.outcomes.all();
        let model = self.model.current().map(|m| InstalledModel {
            trained_at: m.trained_at,
            holdout_accuracy: m.metrics.holdout_accuracy,
            outcome_count: m.metrics.outcome_count,
        });
        let untrained = model.is_none();
        let snapshot = LearningSnapshot {
            model,
            records: &records,
        };
        let trigger = match self.scheduler.evaluate(&snapshot, now) {
            Some(trigger) => trigger,
            None if untrained => RetrainTrigger::ColdStart { samples: records.len() },
            None => return None,
        };
        self.spawn_retrain(trigger)
    }

    fn in_retrain_backoff(&self, now: DateTime<Utc>) -> bool {
        let last = *self
            .last_retrain_failure
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match last {
            Some(failed_at) => {
                (now - failed_at).num_seconds() < self.config.learning.retry_backoff_secs
            }
            None => false,
        }
    }

    fn record_retrain_result(&self, failed: bool) {
        let mut last = self
            .last_retrain_failure
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = failed.then(Utc::now);
    }

    /// Run a retrain in the background, at most one at a time
    pub fn spawn_retrain(self: &Arc<Self>, trigger: RetrainTrigger) -> Option<JoinHandle<()>> {
        if self.retraining.swap(true, Ordering::SeqCst) {
            debug!(%trigger, "Retrain already running");
            return None;
        }
        let engine = self.clone();
        Some(tokio::spawn(async move {
            let result = engine.retrain(trigger).await;
            engine.record_retrain_result(result.is_err());
            match result {
                Ok(_) => {}
                Err(EngineError::InsufficientData { required, available }) => {
                    info!(required, available, "Not enough samples to train yet");
                }
                Err(e) => {
                    error!(error = %e, "Retrain failed, keeping current model");
                    engine
                        .state
                        .lock()
                        .await
                        .push_alert(AlertLevel::Warning, format!("retrain failed: {}", e));
                }
            }
            engine.retraining.store(false, Ordering::SeqCst);
        }))
    }

    /// Fit, persist and install a new model. The current one keeps serving
    /// until the new one is in place.
    pub async fn retrain(&self, trigger: RetrainTrigger) -> EngineResult<Arc<ModelState>> {
        let learning = self.config.learning.clone();
        info!(%trigger, "🎓 Retraining started");

        let outcome_count = self.outcomes.count();
        let records = self.outcomes.recent(learning.training_window);
        let mut dataset = Dataset::from_trades(&records, &learning);

        if dataset.len() < learning.min_training_samples && !self.model.is_trained() {
            let candles = self
                .fetch_candles_n(&self.config.bot.benchmark, learning.training_window + MIN_CANDLES)
                .await?;
            dataset = Dataset::from_candle_history(&candles, MIN_CANDLES, &learning);
            info!(
                candles = candles.len(),
                samples = dataset.len(),
                "Bootstrapping model from benchmark history"
            );
        }

        let generation = self.model.generation() + 1;
        let pipeline = TrainingPipeline::new(learning);
        let now = Utc::now();
        let state = tokio::task::spawn_blocking(move || pipeline.train(&dataset, generation, outcome_count, now))
            .await
            .map_err(|e| EngineError::Training(format!("training task failed: {}", e)))??;

        self.model_store.save(&state)?;
        self.model.install(state)
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    async fn run_discovery(&self) -> EngineResult<ScanReport> {
        if self.is_halted() {
            return Err(EngineError::Halted("discovery paused until restart".to_string()));
        }
        let model = self.model.current().ok_or(EngineError::ModelNotTrained)?;
        let universe = fetch_with_retry(self.data_retry(), "instrument list", || self.market.list_instruments()).await?;

        let skip: HashSet<String> = {
            let st = self.state.lock().await;
            let now = Utc::now();
            st.watchlist
                .instruments()
                .into_iter()
                .chain(st.positions.keys().cloned())
                .chain(universe.iter().filter(|i| st.cooldowns.is_cooling(i, now)).cloned())
                .collect()
        };

        let win_threshold = self.win_threshold();
        let report = self
            .discovery
            .scan(
                self.market.as_ref(),
                &model,
                &universe,
                &skip,
                &self.config.bot.candle_interval,
                self.config.bot.candle_count,
                self.data_retry(),
                |instrument| {
                    let stats = self.outcomes.instrument_stats(instrument, win_threshold);
                    (stats.total_trades > 0).then_some(stats.win_rate)
                },
            )
            .await;

        let mut st = self.state.lock().await;
        st.session.discovery_scans += 1;
        let now = Utc::now();
        for candidate in report.top_recommended(self.config.discovery.top_n) {
            if st.watchlist.add(&candidate.instrument, now) {
                info!(
                    instrument = candidate.instrument.as_str(),
                    score = candidate.score,
                    confidence = candidate.confidence,
                    "👀 Discovery added to watchlist"
                );
            }
        }
        let held: HashSet<String> = st.positions.keys().cloned().collect();
        for evicted in st.watchlist.evict_over(self.config.discovery.max_watchlist, &held) {
            info!(instrument = evicted.as_str(), "Evicted from watchlist");
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Backtesting
    // ------------------------------------------------------------------

    /// Replay history for `instruments` (the most traded ones when empty)
    /// through the installed model. A validated run with enough trades
    /// triggers a retrain.
    pub async fn run_backtest(self: &Arc<Self>, instruments: &[String]) -> EngineResult<BacktestReport> {
        if self.backtesting.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning("backtest".to_string()));
        }
        let result = self.backtest(instruments).await;
        self.backtesting.store(false, Ordering::SeqCst);
        let report = result?;

        let m = &report.metrics;
        info!(
            trades = m.total_trades,
            win_rate = m.win_rate,
            total_return = m.total_return,
            profit_factor = m.profit_factor,
            max_drawdown = m.max_drawdown,
            sharpe = m.sharpe_ratio,
            validated = report.validated,
            "📊 Backtest finished"
        );
        self.state.lock().await.last_backtest = Some(m.clone());

        let min_trades = self.config.backtest.min_trades_for_retrain;
        if report.validated && m.total_trades >= min_trades {
            info!(trades = m.total_trades, "🎓 Backtest validated the strategy, retraining");
            self.spawn_retrain(RetrainTrigger::BacktestValidated {
                trades: m.total_trades,
            });
        } else if !report.validated {
            warn!(
                win_rate = m.win_rate,
                profit_loss_ratio = m.profit_loss_ratio,
                "Backtest below its win rate or payoff floor"
            );
        }
        Ok(report)
    }

    async fn backtest(&self, instruments: &[String]) -> EngineResult<BacktestReport> {
        let model = self.model.current().ok_or(EngineError::ModelNotTrained)?;
        let cfg = self.config.backtest.clone();
        let instruments = if instruments.is_empty() {
            let traded = self.outcomes.most_traded(cfg.max_instruments);
            if traded.is_empty() {
                self.config.bot.instruments.clone()
            } else {
                traded
            }
        } else {
            instruments.to_vec()
        };
        info!(instruments = ?instruments, candles = cfg.candle_count, "🧪 Backtest started");

        let mut series = Vec::with_capacity(instruments.len());
        let mut skipped = Vec::new();
        for instrument in instruments {
            match self.fetch_candles_n(&instrument, cfg.candle_count).await {
                Ok(candles) => series.push((instrument, candles)),
                Err(e) => {
                    warn!(instrument = instrument.as_str(), error = %e, "No history to backtest");
                    skipped.push(instrument);
                }
            }
        }

        let mut backtester = Backtester::new(
            cfg,
            (*self.trading_config()).clone(),
            self.config.entry.confirmation_confidence,
            self.config.sizing.min_order_amount,
            self.config.exit.fee_rate,
            self.win_threshold(),
            self.config.bot.candle_count,
        );
        let report = tokio::task::spawn_blocking(move || {
            for (instrument, candles) in &series {
                backtester.simulate(instrument, candles, model.as_ref());
            }
            backtester.into_report(skipped)
        })
        .await
        .map_err(std::io::Error::from)?;
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Market data helpers
    // ------------------------------------------------------------------

    async fn fetch_candles(&self, instrument: &str) -> EngineResult<Vec<Candle>> {
        self.fetch_candles_n(instrument, self.config.bot.candle_count).await
    }

    async fn fetch_candles_n(&self, instrument: &str, count: usize) -> EngineResult<Vec<Candle>> {
        let interval = self.config.bot.candle_interval.as_str();
        fetch_with_retry(self.data_retry(), "candles", || {
            self.market.get_candles(instrument, interval, count)
        })
        .await
    }

    async fn fetch_market(&self, instrument: &str) -> EngineResult<(Vec<Candle>, f64)> {
        let candles = self.fetch_candles(instrument).await?;
        let price = fetch_with_retry(self.data_retry(), "price", || self.market.get_current_price(instrument)).await?;
        Ok((candles, price))
    }

    fn save_positions(&self, positions: &HashMap<String, Position>) {
        if let Err(e) = self.positions_file.save(positions) {
            warn!(error = %e, "Failed to save open positions");
        }
    }
}
