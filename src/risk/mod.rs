//! Risk controls
//!
//! - Position sizing (fixed or fractional Kelly)
//! - Exit ladder per position
//! - Aggregate drawdown governor

pub mod exit;
pub mod governor;
pub mod sizing;

pub use exit::{ExitContext, ExitStateMachine};
pub use governor::{mark_equity, DrawdownGovernor, GovernorReading};
pub use sizing::{compute_kelly_fraction, KellyQuote, PositionSizer, SizeDecision, SizingMode};
