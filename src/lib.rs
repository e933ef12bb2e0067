//! Kudos: achievement tracking and unlock engine for chat bots.
//!
//! The engine is a rules-driven state machine over SQLite:
//! Event → counter increment → tier evaluation → idempotent grant → notification
//!
//! # Architecture
//!
//! Components share one connection through a cloneable `Db` handle:
//! - **Catalog**: versioned achievement definitions with a closed condition enum
//! - **Metrics**: monotonic per-(chat, user, metric) counters, period-scoped
//! - **Awards**: append-only grant ledger; insert-if-absent makes grants at-most-once
//! - **Engine**: the single event path plus administrative and read-model operations
//!
//! The caller (the bot layer) owns message formatting and delivery; this
//! crate only decides what was unlocked and reports rarity alongside.

pub mod awards;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod cooldowns;
pub mod db;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod migrate;
pub mod schema;
pub mod types;

pub use awards::{AwardLedger, rarity_percent};
pub use catalog::RuleCatalog;
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::EngineConfig;
pub use cooldowns::CooldownStore;
pub use db::Db;
pub use engine::{AchievementEngine, EventOutcome, resolve_target_tier};
pub use error::{EngineError, Result};
pub use metrics::{MetricStore, ProgressLedger};
pub use types::{
    AchievementDefinition, AchievementKind, AwardNotification, AwardRecord, Condition,
    LeaderboardEntry, MetricEvent, MetricPeriod, ProgressRow, RevokeScope, UserAward,
    canonical_metric,
};
