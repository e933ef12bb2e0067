//! Durable monotonic counters.
//!
//! `MetricStore` holds raw per-(chat, user, metric) behavioral counters;
//! `ProgressLedger` holds per-(chat, user, achievement) progress for
//! derived conditions (keyword matches). Both share the increment
//! contract: upsert-first inside one transaction, so concurrent first
//! writers converge to a correct sum, and a non-positive delta is a
//! read-only no-op.

use rusqlite::params;

use crate::db::Db;
use crate::error::Result;
use crate::types::RevokeScope;

/// Scope key for a period-tagged counter reading, e.g. `voice@2026-08`.
#[must_use]
pub fn scoped_key(metric: &str, period_tag: Option<&str>) -> String {
    match period_tag {
        Some(tag) => format!("{metric}@{tag}"),
        None => metric.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// MetricStore
// ---------------------------------------------------------------------------

/// Raw behavioral counters, monotonically non-decreasing except through
/// the administrative `set` path.
#[derive(Clone)]
pub struct MetricStore {
    db: Db,
}

impl MetricStore {
    pub(crate) fn new(db: Db) -> Self {
        Self { db }
    }

    /// Add `delta` to the counter and return the new value. The row is
    /// created at 0 first, so the add itself is a single atomic statement.
    pub fn increment(
        &self,
        chat_id: i64,
        user_id: i64,
        scope_key: &str,
        delta: i64,
        now_ts: i64,
    ) -> Result<i64> {
        if delta <= 0 {
            return self.get(chat_id, user_id, scope_key);
        }
        let conn = self.db.lock()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO user_metrics (chat_id, user_id, metric, count, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![chat_id, user_id, scope_key, now_ts],
        )?;
        tx.execute(
            "UPDATE user_metrics SET count = count + ?1, updated_at = ?2
             WHERE chat_id = ?3 AND user_id = ?4 AND metric = ?5",
            params![delta, now_ts, chat_id, user_id, scope_key],
        )?;
        let value: i64 = tx.query_row(
            "SELECT count FROM user_metrics WHERE chat_id = ?1 AND user_id = ?2 AND metric = ?3",
            params![chat_id, user_id, scope_key],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(value)
    }

    /// Current counter value, 0 if no row exists.
    pub fn get(&self, chat_id: i64, user_id: i64, scope_key: &str) -> Result<i64> {
        let conn = self.db.lock()?;
        match conn.query_row(
            "SELECT count FROM user_metrics WHERE chat_id = ?1 AND user_id = ?2 AND metric = ?3",
            params![chat_id, user_id, scope_key],
            |row| row.get(0),
        ) {
            Ok(value) => Ok(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Administrative override, the only path that may lower a counter.
    pub fn set(
        &self,
        chat_id: i64,
        user_id: i64,
        scope_key: &str,
        value: i64,
        now_ts: i64,
    ) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO user_metrics (chat_id, user_id, metric, count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(chat_id, user_id, metric)
             DO UPDATE SET count = excluded.count, updated_at = excluded.updated_at",
            params![chat_id, user_id, scope_key, value, now_ts],
        )?;
        Ok(())
    }

    /// All counter rows for one scope key in one chat, highest first.
    pub fn rows_for_metric(&self, chat_id: i64, scope_key: &str) -> Result<Vec<(i64, i64)>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, count FROM user_metrics
             WHERE chat_id = ?1 AND metric = ?2
             ORDER BY count DESC, user_id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id, scope_key], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Drop every counter row. Part of a full administrative reset.
    pub(crate) fn clear_all(&self) -> Result<usize> {
        let conn = self.db.lock()?;
        Ok(conn.execute("DELETE FROM user_metrics", [])?)
    }
}

// ---------------------------------------------------------------------------
// ProgressLedger
// ---------------------------------------------------------------------------

/// Per-achievement cumulative progress, used when the trigger condition is
/// not a raw metric.
#[derive(Clone)]
pub struct ProgressLedger {
    db: Db,
}

impl ProgressLedger {
    pub(crate) fn new(db: Db) -> Self {
        Self { db }
    }

    /// Same contract as `MetricStore::increment`, scoped to one achievement.
    pub fn increment(
        &self,
        chat_id: i64,
        user_id: i64,
        achievement_id: i64,
        delta: i64,
        now_ts: i64,
    ) -> Result<i64> {
        if delta <= 0 {
            return self.get(chat_id, user_id, achievement_id);
        }
        let conn = self.db.lock()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO achievement_progress
                 (chat_id, user_id, achievement_id, progress, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![chat_id, user_id, achievement_id, now_ts],
        )?;
        tx.execute(
            "UPDATE achievement_progress SET progress = progress + ?1, updated_at = ?2
             WHERE chat_id = ?3 AND user_id = ?4 AND achievement_id = ?5",
            params![delta, now_ts, chat_id, user_id, achievement_id],
        )?;
        let value: i64 = tx.query_row(
            "SELECT progress FROM achievement_progress
             WHERE chat_id = ?1 AND user_id = ?2 AND achievement_id = ?3",
            params![chat_id, user_id, achievement_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(value)
    }

    /// Current progress value, 0 if no row exists.
    pub fn get(&self, chat_id: i64, user_id: i64, achievement_id: i64) -> Result<i64> {
        let conn = self.db.lock()?;
        match conn.query_row(
            "SELECT progress FROM achievement_progress
             WHERE chat_id = ?1 AND user_id = ?2 AND achievement_id = ?3",
            params![chat_id, user_id, achievement_id],
            |row| row.get(0),
        ) {
            Ok(value) => Ok(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// All progress rows for one achievement in one chat, highest first.
    pub fn rows_for_achievement(
        &self,
        chat_id: i64,
        achievement_id: i64,
    ) -> Result<Vec<(i64, i64)>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, progress FROM achievement_progress
             WHERE chat_id = ?1 AND achievement_id = ?2
             ORDER BY progress DESC, user_id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id, achievement_id], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete progress rows matching the scope. Returns the row count.
    pub fn clear(&self, scope: &RevokeScope) -> Result<usize> {
        let conn = self.db.lock()?;
        let mut clauses = Vec::new();
        let mut values: Vec<i64> = Vec::new();
        if let Some(chat_id) = scope.chat_id {
            clauses.push(format!("chat_id = ?{}", values.len() + 1));
            values.push(chat_id);
        }
        if let Some(user_id) = scope.user_id {
            clauses.push(format!("user_id = ?{}", values.len() + 1));
            values.push(user_id);
        }
        if let Some(achievement_id) = scope.achievement_id {
            clauses.push(format!("achievement_id = ?{}", values.len() + 1));
            values.push(achievement_id);
        }
        let sql = if clauses.is_empty() {
            "DELETE FROM achievement_progress".to_owned()
        } else {
            format!("DELETE FROM achievement_progress WHERE {}", clauses.join(" AND "))
        };
        Ok(conn.execute(&sql, rusqlite::params_from_iter(values))?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
