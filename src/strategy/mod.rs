//! Entry side of the strategy: admission gates and rebuy cooldowns

pub mod cooldown;
pub mod entry;

pub use cooldown::{Cooldown, CooldownKind, CooldownTracker};
pub use entry::{benchmark_return, EntryContext, EntryDecision, EntryPipeline, EntryScenario, RejectReason};
