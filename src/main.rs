//! EvoBot - paper trading runner
//!
//! Replays CSV candles through the paper broker and runs the full engine
//! against them until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use evobot::config::AppConfig;
use evobot::exchange::{CsvReplay, MarketData, OrderExecution, PaperBroker};
use evobot::TradingEngine;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("EVOBOT_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!("🚀 EvoBot {} starting", config.bot.tag);
    info!("⚙️ {}", config.digest());

    let replay = Arc::new(
        CsvReplay::load(&config.paper.candles_dir, config.bot.candle_count)
            .context("Failed to load replay candles")?,
    );
    let market: Arc<dyn MarketData> = replay.clone();
    let broker: Arc<dyn OrderExecution> = Arc::new(PaperBroker::new(market.clone(), &config.paper));
    let replay_step = Duration::from_secs(config.paper.replay_step_secs.max(1));
    let backtest_on_start = config.backtest.run_on_start;

    let engine = TradingEngine::new(config, market, broker)?;
    engine.start().await;
    let mut handles = engine.spawn_loops();

    if backtest_on_start {
        let tester = engine.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = tester.run_backtest(&[]).await {
                warn!(error = %e, "Startup backtest failed");
            }
        }));
    }

    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(replay_step);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            interval.tick().await;
            if !replay.advance() {
                warn!("📂 Replay exhausted, clock stays at the last candle");
                break;
            }
        }
    }));

    let reporter = engine.clone();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let status = reporter.status().await;
            info!(
                running = status.running,
                halted = status.halted,
                positions = status.positions.len(),
                watchlist = status.watchlist.len(),
                trades = status.all_time.total_trades,
                win_rate = status.all_time.win_rate,
                pnl = status.session.realized_pnl,
                generation = status.model.as_ref().map(|m| m.generation).unwrap_or(0),
                "📊 Status"
            );
        }
    }));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("🛑 Shutdown requested");
    engine.stop();
    for handle in handles {
        handle.abort();
    }

    let status = engine.status().await;
    info!(
        open_positions = status.positions.len(),
        closed = status.session.trades_closed,
        pnl = status.session.realized_pnl,
        "👋 EvoBot stopped"
    );
    Ok(())
}
