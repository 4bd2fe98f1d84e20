//! EvoBot Library
//!
//! Self-learning spot trading engine: candle features, an outcome classifier
//! that retrains itself, gated entries, laddered exits and a drawdown halt.

pub mod backtesting;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod features;
pub mod ml_engine;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod types;

pub use engine::TradingEngine;
pub use error::{EngineError, EngineResult};
