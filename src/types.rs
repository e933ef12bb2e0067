//! Core domain types for the achievement engine.
//!
//! Everything in this module is storage-agnostic, shared by the catalog,
//! the ledgers, and the evaluator.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

/// Accepted alias spellings for the built-in metrics.
const METRIC_ALIASES: &[(&str, &str)] = &[
    ("voices", "voice"),
    ("video_note", "videonote"),
    ("circles", "videonote"),
    ("stickers", "sticker"),
];

/// Lower-case a metric name and collapse known aliases to the canonical form.
///
/// Unknown names pass through unchanged (custom counters are allowed).
#[must_use]
pub fn canonical_metric(metric: &str) -> String {
    let lower = metric.trim().to_ascii_lowercase();
    for (alias, canon) in METRIC_ALIASES {
        if lower == *alias {
            return (*canon).to_owned();
        }
    }
    lower
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AchievementKind {
    /// One threshold, one tier.
    Single,
    /// Ordered ascending thresholds, tier i unlocks at thresholds[i-1].
    Tiered,
}

/// Counter attribution scope for counter-threshold achievements.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricPeriod {
    /// Counter accumulates forever.
    AllTime,
    /// Counter is keyed by a `YYYY-MM` period tag.
    Monthly,
}

/// Trigger condition. A closed enum; each variant carries only the fields
/// its evaluation needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Unlocks tiers as a raw metric counter crosses thresholds.
    CounterThreshold { metric: String },
    /// Unlocks tier 1 exactly once when the clock reaches the target.
    DateOnce { target_ts: i64 },
    /// Counts events whose payload contains the keyword (case-insensitive
    /// substring); thresholds apply to that count.
    KeywordThreshold { keyword: String },
}

impl Condition {
    /// The metric-store key this condition reads, if any.
    #[must_use]
    pub fn metric_key(&self) -> Option<&str> {
        match self {
            Condition::CounterThreshold { metric } => Some(metric),
            Condition::DateOnce { .. } | Condition::KeywordThreshold { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Achievement definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AchievementDefinition {
    /// Surrogate id, assigned by storage. `None` before the first upsert.
    #[serde(default)]
    pub id: Option<i64>,
    /// Stable unique code, matched case-insensitively.
    pub code: String,
    pub title: String,
    pub description: String,
    pub kind: AchievementKind,
    pub condition: Condition,
    /// Strictly increasing positive unlock values; empty for `DateOnce`.
    #[serde(default)]
    pub thresholds: Vec<u32>,
    #[serde(default = "default_period")]
    pub period: MetricPeriod,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_period() -> MetricPeriod {
    MetricPeriod::AllTime
}

fn default_active() -> bool {
    true
}

impl AchievementDefinition {
    /// Check the definition invariants. Returns a human-readable reason on
    /// failure; the catalog wraps it into `EngineError::Validation`.
    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if self.code.trim().is_empty() {
            return Err("code must not be empty".to_owned());
        }
        match &self.condition {
            Condition::CounterThreshold { metric } => {
                if metric.trim().is_empty() {
                    return Err("counter condition requires a metric name".to_owned());
                }
                self.validate_thresholds()?;
            }
            Condition::KeywordThreshold { keyword } => {
                if keyword.trim().is_empty() {
                    return Err("keyword condition requires a keyword".to_owned());
                }
                self.validate_thresholds()?;
            }
            Condition::DateOnce { target_ts } => {
                if *target_ts <= 0 {
                    return Err("date condition requires a positive target timestamp".to_owned());
                }
                if !self.thresholds.is_empty() {
                    return Err("date achievements do not take thresholds".to_owned());
                }
                if self.kind != AchievementKind::Single {
                    return Err("date achievements must be single-kind".to_owned());
                }
            }
        }
        Ok(())
    }

    fn validate_thresholds(&self) -> std::result::Result<(), String> {
        if self.thresholds.is_empty() {
            return Err("at least one threshold is required".to_owned());
        }
        if self.kind == AchievementKind::Single && self.thresholds.len() != 1 {
            return Err("single-kind achievements take exactly one threshold".to_owned());
        }
        let mut prev = 0u32;
        for &t in &self.thresholds {
            if t == 0 {
                return Err("thresholds must be positive".to_owned());
            }
            if t <= prev {
                return Err("thresholds must be strictly increasing".to_owned());
            }
            prev = t;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Events, awards, notifications
// ---------------------------------------------------------------------------

/// One inbound behavioral event from the bot layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEvent {
    pub chat_id: i64,
    pub user_id: i64,
    pub metric: String,
    /// Counter increment; `<= 0` leaves counters untouched but still
    /// re-evaluates (useful for duplicate deliveries).
    pub delta: i64,
    pub occurred_at: i64,
    /// Raw message text, consulted by keyword conditions only.
    #[serde(default)]
    pub payload: Option<String>,
}

/// A persisted, immutable grant of one achievement tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwardRecord {
    pub chat_id: i64,
    pub user_id: i64,
    pub achievement_id: i64,
    pub tier: u32,
    pub unlocked_at: i64,
}

/// Outbound notification for a newly granted tier. The bot layer formats
/// and sends the user-facing message; this engine never does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwardNotification {
    pub chat_id: i64,
    pub user_id: i64,
    pub code: String,
    pub title: String,
    pub description: String,
    /// `None` for single-kind achievements.
    pub tier: Option<u32>,
    /// Percentage of the population that has NOT earned this achievement.
    pub rarity_percent: f64,
}

/// Filter for administrative revocation. `None` fields match everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct RevokeScope {
    pub chat_id: Option<i64>,
    pub user_id: Option<i64>,
    pub achievement_id: Option<i64>,
}

// ---------------------------------------------------------------------------
// Read-model rows for the admin/user views
// ---------------------------------------------------------------------------

/// One user's standing toward an achievement (admin progress view).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProgressRow {
    pub user_id: i64,
    pub progress: i64,
    pub max_tier: u32,
    /// The next unmet threshold, `None` once every tier is taken.
    pub next_threshold: Option<u32>,
}

/// One granted tier, joined with its definition (user awards view).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UserAward {
    pub code: String,
    pub title: String,
    pub description: String,
    pub kind: AchievementKind,
    pub tier: u32,
    pub unlocked_at: i64,
}

/// Award-count leaderboard entry for one chat.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub user_id: i64,
    pub awards: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
