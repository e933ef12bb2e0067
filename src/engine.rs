//! The evaluation core: events in, notifications out.
//!
//! `handle_event` is the single write path for the bot layer. It applies
//! the event's counter increments, evaluates every definition the event
//! can affect, grants any newly crossed tiers, and returns notifications
//! for the caller to deliver. Every step is idempotent, so a re-delivered
//! event or a racing evaluator never produces a duplicate grant.

use std::sync::Arc;

use crate::awards::{AwardLedger, rarity_percent};
use crate::catalog::RuleCatalog;
use crate::clock::{Clock, SystemClock, monthly_tag};
use crate::config::EngineConfig;
use crate::cooldowns::CooldownStore;
use crate::db::Db;
use crate::error::{EngineError, Result};
use crate::metrics::{MetricStore, ProgressLedger, scoped_key};
use crate::types::{
    AchievementDefinition, AchievementKind, AwardNotification, Condition, LeaderboardEntry,
    MetricEvent, MetricPeriod, ProgressRow, RevokeScope, UserAward, canonical_metric,
};

/// Result of processing one event.
#[derive(Debug, Clone)]
pub struct EventOutcome {
    /// Canonical metric the event was attributed to.
    pub metric: String,
    /// All-time counter value after the increment.
    pub new_value: i64,
    /// Newly granted tiers, in grant order.
    pub awards: Vec<AwardNotification>,
}

/// Highest tier index justified by `value` against ascending `thresholds`.
/// 0 means no tier is met.
#[must_use]
pub fn resolve_target_tier(thresholds: &[u32], value: i64) -> u32 {
    let mut tier = 0u32;
    for &threshold in thresholds {
        if value >= i64::from(threshold) {
            tier += 1;
        } else {
            break;
        }
    }
    tier
}

/// Rules-driven achievement engine over one SQLite database.
#[derive(Clone)]
pub struct AchievementEngine {
    catalog: RuleCatalog,
    metrics: MetricStore,
    progress: ProgressLedger,
    awards: AwardLedger,
    cooldowns: CooldownStore,
    clock: Arc<dyn Clock>,
    max_event_retries: u32,
}

impl AchievementEngine {
    /// Open the engine per the configuration, using the system clock.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Open with an injected clock (tests, replay).
    pub fn with_clock(config: &EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self::from_db(
            Db::open(&config.db_path)?,
            clock,
            config.max_event_retries,
        ))
    }

    /// In-memory engine with the system clock (for testing).
    pub fn open_memory() -> Result<Self> {
        Ok(Self::from_db(Db::open_memory()?, Arc::new(SystemClock), 2))
    }

    /// In-memory engine with a fixed clock (for testing).
    pub fn open_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self::from_db(Db::open_memory()?, clock, 2))
    }

    fn from_db(db: Db, clock: Arc<dyn Clock>, max_event_retries: u32) -> Self {
        Self {
            catalog: RuleCatalog::new(db.clone()),
            metrics: MetricStore::new(db.clone()),
            progress: ProgressLedger::new(db.clone()),
            awards: AwardLedger::new(db.clone()),
            cooldowns: CooldownStore::new(db),
            clock,
            max_event_retries,
        }
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    pub fn metrics(&self) -> &MetricStore {
        &self.metrics
    }

    pub fn awards(&self) -> &AwardLedger {
        &self.awards
    }

    pub fn cooldowns(&self) -> &CooldownStore {
        &self.cooldowns
    }

    // -----------------------------------------------------------------------
    // Event path
    // -----------------------------------------------------------------------

    /// Process one behavioral event against the full rule catalog.
    ///
    /// `population` is the current member count of the chat, used for
    /// rarity in the returned notifications.
    pub fn handle_event(&self, event: &MetricEvent, population: u64) -> Result<EventOutcome> {
        let metric = canonical_metric(&event.metric);
        let now = self.clock.now_ts();

        let counter_defs = self.catalog.active_by_metric(&metric)?;
        let all_time = self
            .metrics
            .increment(event.chat_id, event.user_id, &metric, event.delta, now)?;

        let mut monthly_value: Option<i64> = None;
        if counter_defs
            .iter()
            .any(|d| d.period == MetricPeriod::Monthly)
        {
            let key = scoped_key(&metric, Some(&monthly_tag(now)));
            monthly_value = Some(self.metrics.increment(
                event.chat_id,
                event.user_id,
                &key,
                event.delta,
                now,
            )?);
        }

        let mut notifications = Vec::new();
        for def in &counter_defs {
            let value = match def.period {
                MetricPeriod::AllTime => all_time,
                MetricPeriod::Monthly => monthly_value.unwrap_or(0),
            };
            self.award_up_to(def, event.chat_id, event.user_id, value, now, population,
                &mut notifications)?;
        }

        self.evaluate_keywords(event, now, population, &mut notifications)?;
        self.evaluate_dates(event.chat_id, event.user_id, now, population, &mut notifications)?;

        Ok(EventOutcome {
            metric,
            new_value: all_time,
            awards: notifications,
        })
    }

    /// `handle_event`, re-run on transient storage failures.
    pub fn handle_event_with_retry(
        &self,
        event: &MetricEvent,
        population: u64,
    ) -> Result<EventOutcome> {
        let mut attempt = 0u32;
        loop {
            match self.handle_event(event, population) {
                Err(EngineError::Storage(e)) if attempt < self.max_event_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        error = %e,
                        metric = %event.metric,
                        "event evaluation failed, retrying"
                    );
                }
                other => return other,
            }
        }
    }

    fn evaluate_keywords(
        &self,
        event: &MetricEvent,
        now: i64,
        population: u64,
        notifications: &mut Vec<AwardNotification>,
    ) -> Result<()> {
        let Some(payload) = event.payload.as_deref() else {
            return Ok(());
        };
        let text = payload.to_lowercase();
        for def in self.catalog.active_keyword_definitions()? {
            let Condition::KeywordThreshold { keyword } = &def.condition else {
                continue;
            };
            if keyword.is_empty() || !text.contains(&keyword.to_lowercase()) {
                continue;
            }
            let Some(id) = def.id else { continue };
            let count = self
                .progress
                .increment(event.chat_id, event.user_id, id, 1, now)?;
            self.award_up_to(&def, event.chat_id, event.user_id, count, now, population,
                notifications)?;
        }
        Ok(())
    }

    fn evaluate_dates(
        &self,
        chat_id: i64,
        user_id: i64,
        now: i64,
        population: u64,
        notifications: &mut Vec<AwardNotification>,
    ) -> Result<()> {
        for def in self.catalog.active_date_definitions()? {
            let Condition::DateOnce { target_ts } = def.condition else {
                continue;
            };
            if now < target_ts {
                continue;
            }
            let Some(id) = def.id else { continue };
            if self.awards.max_tier(chat_id, user_id, id)? > 0 {
                continue;
            }
            let (_, newly) = self.awards.grant(chat_id, user_id, id, 1, now)?;
            if newly {
                notifications.push(self.notification(&def, chat_id, user_id, 1, population)?);
            }
        }
        Ok(())
    }

    /// Grant every tier between the user's current max and the tier the
    /// value justifies. Skipped tiers are granted too, lowest first.
    fn award_up_to(
        &self,
        def: &AchievementDefinition,
        chat_id: i64,
        user_id: i64,
        value: i64,
        now: i64,
        population: u64,
        notifications: &mut Vec<AwardNotification>,
    ) -> Result<()> {
        let Some(id) = def.id else { return Ok(()) };
        let target = resolve_target_tier(&def.thresholds, value);
        if target == 0 {
            return Ok(());
        }
        let current = self.awards.max_tier(chat_id, user_id, id)?;
        for tier in (current + 1)..=target {
            let (_, newly) = self.awards.grant(chat_id, user_id, id, tier, now)?;
            if newly {
                tracing::debug!(code = %def.code, tier, user_id, chat_id, "tier granted");
                notifications.push(self.notification(def, chat_id, user_id, tier, population)?);
            }
        }
        Ok(())
    }

    fn notification(
        &self,
        def: &AchievementDefinition,
        chat_id: i64,
        user_id: i64,
        tier: u32,
        population: u64,
    ) -> Result<AwardNotification> {
        let holders = match def.id {
            Some(id) => self.awards.distinct_holders(chat_id, id)?,
            None => 0,
        };
        Ok(AwardNotification {
            chat_id,
            user_id,
            code: def.code.clone(),
            title: def.title.clone(),
            description: def.description.clone(),
            tier: match def.kind {
                AchievementKind::Single => None,
                AchievementKind::Tiered => Some(tier),
            },
            rarity_percent: rarity_percent(holders, population),
        })
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    /// Override a raw counter, then re-evaluate the affected definitions.
    /// Lowering a counter never revokes tiers already granted.
    pub fn set_counter(
        &self,
        chat_id: i64,
        user_id: i64,
        metric: &str,
        value: i64,
        population: u64,
    ) -> Result<Vec<AwardNotification>> {
        let metric = canonical_metric(metric);
        let now = self.clock.now_ts();
        self.metrics.set(chat_id, user_id, &metric, value, now)?;
        tracing::info!(metric = %metric, user_id, chat_id, value, "counter overridden");
        self.reevaluate(chat_id, user_id, &metric, population)
    }

    /// Re-run tier evaluation for one user and metric without touching
    /// counters. Safe to call any number of times.
    pub fn reevaluate(
        &self,
        chat_id: i64,
        user_id: i64,
        metric: &str,
        population: u64,
    ) -> Result<Vec<AwardNotification>> {
        let metric = canonical_metric(metric);
        let now = self.clock.now_ts();
        let mut notifications = Vec::new();
        for def in self.catalog.active_by_metric(&metric)? {
            let key = match def.period {
                MetricPeriod::AllTime => metric.clone(),
                MetricPeriod::Monthly => scoped_key(&metric, Some(&monthly_tag(now))),
            };
            let value = self.metrics.get(chat_id, user_id, &key)?;
            self.award_up_to(&def, chat_id, user_id, value, now, population,
                &mut notifications)?;
        }
        Ok(notifications)
    }

    /// Revoke one user's awards (and derived progress) for one achievement.
    pub fn reset_user_achievement(
        &self,
        chat_id: i64,
        user_id: i64,
        code_or_id: &str,
    ) -> Result<usize> {
        let def = self.catalog.get(code_or_id)?;
        let scope = RevokeScope {
            chat_id: Some(chat_id),
            user_id: Some(user_id),
            achievement_id: def.id,
        };
        let removed = self.awards.revoke(&scope)?;
        self.progress.clear(&scope)?;
        tracing::info!(code = %def.code, user_id, chat_id, removed, "user awards revoked");
        Ok(removed)
    }

    /// Revoke every user's awards for one achievement, chat-wide or global.
    pub fn reset_achievement(&self, code_or_id: &str, chat_id: Option<i64>) -> Result<usize> {
        let def = self.catalog.get(code_or_id)?;
        let scope = RevokeScope {
            chat_id,
            user_id: None,
            achievement_id: def.id,
        };
        let removed = self.awards.revoke(&scope)?;
        self.progress.clear(&scope)?;
        tracing::info!(code = %def.code, removed, "achievement reset");
        Ok(removed)
    }

    /// Delete all engine state, definitions included.
    pub fn reset_all(&self) -> Result<()> {
        self.awards.revoke(&RevokeScope::default())?;
        self.progress.clear(&RevokeScope::default())?;
        self.metrics.clear_all()?;
        self.cooldowns.clear_all()?;
        let definitions = self.catalog.clear_all()?;
        tracing::warn!(definitions, "full engine reset");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Read models
    // -----------------------------------------------------------------------

    /// Per-user standing toward one achievement in one chat, best first.
    pub fn progress_report(&self, chat_id: i64, code_or_id: &str) -> Result<Vec<ProgressRow>> {
        let def = self.catalog.get(code_or_id)?;
        let Some(id) = def.id else {
            return Ok(Vec::new());
        };
        let now = self.clock.now_ts();
        let raw = match &def.condition {
            Condition::CounterThreshold { metric } => {
                let key = match def.period {
                    MetricPeriod::AllTime => metric.clone(),
                    MetricPeriod::Monthly => scoped_key(metric, Some(&monthly_tag(now))),
                };
                self.metrics.rows_for_metric(chat_id, &key)?
            }
            Condition::KeywordThreshold { .. } => self.progress.rows_for_achievement(chat_id, id)?,
            Condition::DateOnce { .. } => {
                return Err(EngineError::Validation(
                    "date achievements have no progress to report".to_owned(),
                ));
            }
        };

        let mut out = Vec::with_capacity(raw.len());
        for (user_id, progress) in raw {
            out.push(ProgressRow {
                user_id,
                progress,
                max_tier: self.awards.max_tier(chat_id, user_id, id)?,
                next_threshold: def
                    .thresholds
                    .iter()
                    .copied()
                    .find(|&t| progress < i64::from(t)),
            });
        }
        Ok(out)
    }

    /// Current rarity of one achievement within one chat.
    pub fn rarity(&self, chat_id: i64, code_or_id: &str, population: u64) -> Result<f64> {
        let def = self.catalog.get(code_or_id)?;
        let holders = match def.id {
            Some(id) => self.awards.distinct_holders(chat_id, id)?,
            None => 0,
        };
        Ok(rarity_percent(holders, population))
    }

    /// Every tier granted to one user in one chat, newest first.
    pub fn user_awards(&self, chat_id: i64, user_id: i64) -> Result<Vec<UserAward>> {
        self.awards.awards_for_user(chat_id, user_id)
    }

    /// Award-count leaderboard for one chat.
    pub fn leaderboard(&self, chat_id: i64, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        self.awards.leaderboard(chat_id, limit)
    }

    // -----------------------------------------------------------------------
    // Cooldowns
    // -----------------------------------------------------------------------

    /// Start (or extend) a named cooldown.
    pub fn start_cooldown(
        &self,
        scope: &str,
        chat_id: i64,
        user_id: Option<i64>,
        ttl_secs: i64,
    ) -> Result<()> {
        self.cooldowns
            .set(scope, chat_id, user_id, ttl_secs, self.clock.now_ts())
    }

    /// Is the named cooldown still running?
    pub fn cooldown_active(&self, scope: &str, chat_id: i64, user_id: Option<i64>) -> Result<bool> {
        self.cooldowns
            .is_active(scope, chat_id, user_id, self.clock.now_ts())
    }

    /// Purge expired cooldown rows. Returns the row count.
    pub fn sweep_cooldowns(&self) -> Result<usize> {
        self.cooldowns.clear_expired(self.clock.now_ts())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn engine_at(ts: i64) -> AchievementEngine {
        AchievementEngine::open_memory_with_clock(Arc::new(FixedClock(ts))).expect("open")
    }

    fn seed_tiered(engine: &AchievementEngine, code: &str, metric: &str, thresholds: Vec<u32>) {
        engine
            .catalog()
            .upsert(&AchievementDefinition {
                id: None,
                code: code.to_owned(),
                title: format!("{code} title"),
                description: format!("{code} description"),
                kind: AchievementKind::Tiered,
                condition: Condition::CounterThreshold {
                    metric: metric.to_owned(),
                },
                thresholds,
                period: MetricPeriod::AllTime,
                active: true,
            })
            .expect("seed");
    }

    fn event(metric: &str, delta: i64) -> MetricEvent {
        MetricEvent {
            chat_id: -1,
            user_id: 7,
            metric: metric.to_owned(),
            delta,
            occurred_at: 1_000,
            payload: None,
        }
    }

    #[test]
    fn resolve_target_tier_scans_forward() {
        let thresholds = [10, 50, 100];
        assert_eq!(resolve_target_tier(&thresholds, 0), 0);
        assert_eq!(resolve_target_tier(&thresholds, 9), 0);
        assert_eq!(resolve_target_tier(&thresholds, 10), 1);
        assert_eq!(resolve_target_tier(&thresholds, 49), 1);
        assert_eq!(resolve_target_tier(&thresholds, 50), 2);
        assert_eq!(resolve_target_tier(&thresholds, 100), 3);
        assert_eq!(resolve_target_tier(&thresholds, 5_000), 3);
        assert_eq!(resolve_target_tier(&[], 5_000), 0);
    }

    #[test]
    fn crossing_a_threshold_grants_once() {
        let engine = engine_at(1_000);
        seed_tiered(&engine, "VOI", "voice", vec![3]);

        assert!(engine.handle_event(&event("voice", 2), 10).expect("ev").awards.is_empty());
        let outcome = engine.handle_event(&event("voice", 1), 10).expect("ev");
        assert_eq!(outcome.new_value, 3);
        assert_eq!(outcome.awards.len(), 1);
        assert_eq!(outcome.awards[0].code, "VOI");

        // Past the threshold nothing more is granted.
        assert!(engine.handle_event(&event("voice", 1), 10).expect("ev").awards.is_empty());
    }

    #[test]
    fn jump_grants_all_skipped_tiers_in_order() {
        let engine = engine_at(1_000);
        seed_tiered(&engine, "VOI", "voice", vec![10, 50, 100]);

        engine.handle_event(&event("voice", 5), 10).expect("ev");
        let outcome = engine.handle_event(&event("voice", 115), 10).expect("ev");
        let tiers: Vec<_> = outcome.awards.iter().map(|a| a.tier).collect();
        assert_eq!(tiers, vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn alias_metrics_feed_the_same_counter() {
        let engine = engine_at(1_000);
        seed_tiered(&engine, "VOI", "voice", vec![2]);

        engine.handle_event(&event("Voices", 1), 10).expect("ev");
        let outcome = engine.handle_event(&event("voice", 1), 10).expect("ev");
        assert_eq!(outcome.metric, "voice");
        assert_eq!(outcome.awards.len(), 1);
    }

    #[test]
    fn set_counter_reevaluates_without_revoking() {
        let engine = engine_at(1_000);
        seed_tiered(&engine, "VOI", "voice", vec![10]);

        let granted = engine.set_counter(-1, 7, "voice", 25, 10).expect("set");
        assert_eq!(granted.len(), 1);

        // Lowering keeps the granted tier.
        let granted = engine.set_counter(-1, 7, "voice", 0, 10).expect("set");
        assert!(granted.is_empty());
        let def = engine.catalog().get("VOI").expect("def");
        assert_eq!(
            engine
                .awards()
                .max_tier(-1, 7, def.id.expect("id"))
                .expect("max"),
            1
        );
    }

    #[test]
    fn date_achievement_unlocks_after_target() {
        let target = 2_000;
        let engine = engine_at(target - 1);
        engine
            .catalog()
            .upsert(&AchievementDefinition {
                id: None,
                code: "DAY".to_owned(),
                title: "The day".to_owned(),
                description: "Was here on the day".to_owned(),
                kind: AchievementKind::Single,
                condition: Condition::DateOnce { target_ts: target },
                thresholds: vec![],
                period: MetricPeriod::AllTime,
                active: true,
            })
            .expect("seed");

        assert!(engine.handle_event(&event("messages", 1), 10).expect("ev").awards.is_empty());

        let engine_after = AchievementEngine::open_memory_with_clock(Arc::new(FixedClock(target)))
            .expect("open");
        // Separate db, re-seed.
        engine_after
            .catalog()
            .upsert(&engine.catalog().get("DAY").expect("def"))
            .expect("seed");
        let outcome = engine_after.handle_event(&event("messages", 1), 10).expect("ev");
        assert_eq!(outcome.awards.len(), 1);
        assert_eq!(outcome.awards[0].tier, None);
    }

    #[test]
    fn keyword_progress_counts_substring_matches() {
        let engine = engine_at(1_000);
        engine
            .catalog()
            .upsert(&AchievementDefinition {
                id: None,
                code: "KW".to_owned(),
                title: "Wordsmith".to_owned(),
                description: "Keeps saying it".to_owned(),
                kind: AchievementKind::Tiered,
                condition: Condition::KeywordThreshold {
                    keyword: "bingo".to_owned(),
                },
                thresholds: vec![2],
                period: MetricPeriod::AllTime,
                active: true,
            })
            .expect("seed");

        let mut ev = event("messages", 1);
        ev.payload = Some("no match here".to_owned());
        assert!(engine.handle_event(&ev, 10).expect("ev").awards.is_empty());

        ev.payload = Some("BINGO was his name".to_owned());
        assert!(engine.handle_event(&ev, 10).expect("ev").awards.is_empty());
        let outcome = engine.handle_event(&ev, 10).expect("ev");
        assert_eq!(outcome.awards.len(), 1);
        assert_eq!(outcome.awards[0].tier, Some(1));
    }

    #[test]
    fn progress_report_orders_and_annotates() {
        let engine = engine_at(1_000);
        seed_tiered(&engine, "MSG", "messages", vec![10, 50]);

        engine.handle_event(&event("messages", 12), 10).expect("ev");
        let mut other = event("messages", 3);
        other.user_id = 8;
        engine.handle_event(&other, 10).expect("ev");

        let report = engine.progress_report(-1, "MSG").expect("report");
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].user_id, 7);
        assert_eq!(report[0].progress, 12);
        assert_eq!(report[0].max_tier, 1);
        assert_eq!(report[0].next_threshold, Some(50));
        assert_eq!(report[1].user_id, 8);
        assert_eq!(report[1].max_tier, 0);
        assert_eq!(report[1].next_threshold, Some(10));
    }

    #[test]
    fn reset_all_clears_every_table() {
        let engine = engine_at(1_000);
        seed_tiered(&engine, "MSG", "messages", vec![1]);
        engine.handle_event(&event("messages", 5), 10).expect("ev");
        engine.start_cooldown("quiz", -1, Some(7), 60).expect("cooldown");

        engine.reset_all().expect("reset");

        assert!(engine.catalog().list().expect("list").is_empty());
        assert_eq!(engine.metrics().get(-1, 7, "messages").expect("get"), 0);
        assert!(engine.user_awards(-1, 7).expect("awards").is_empty());
        assert!(!engine.cooldown_active("quiz", -1, Some(7)).expect("cooldown"));
    }
}
