//! Append-only award ledger and rarity computation.
//!
//! An `AwardRecord`'s existence is the sole proof of "already granted".
//! `grant` is an atomic insert-if-absent against the 4-column primary key,
//! so even racing evaluators leave exactly one record per tier.

use rusqlite::params;

use crate::db::Db;
use crate::error::Result;
use crate::types::{AchievementKind, AwardRecord, LeaderboardEntry, RevokeScope, UserAward};

/// Rarity: percentage of the population that has NOT earned the
/// achievement, rounded to two decimals. Defined as 0.0 for an empty
/// population.
#[must_use]
pub fn rarity_percent(holders: u64, population: u64) -> f64 {
    if population == 0 {
        return 0.0;
    }
    let share = holders as f64 / population as f64;
    ((100.0 * (1.0 - share)).max(0.0) * 100.0).round() / 100.0
}

/// Durable record of granted achievement tiers.
#[derive(Clone)]
pub struct AwardLedger {
    db: Db,
}

impl AwardLedger {
    pub(crate) fn new(db: Db) -> Self {
        Self { db }
    }

    /// Does this exact (chat, user, achievement, tier) grant exist?
    pub fn has_award(
        &self,
        chat_id: i64,
        user_id: i64,
        achievement_id: i64,
        tier: u32,
    ) -> Result<bool> {
        let conn = self.db.lock()?;
        let found: Option<i64> = match conn.query_row(
            "SELECT 1 FROM user_achievements
             WHERE chat_id = ?1 AND user_id = ?2 AND achievement_id = ?3 AND tier = ?4",
            params![chat_id, user_id, achievement_id, i64::from(tier)],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        Ok(found.is_some())
    }

    /// Insert-if-absent. Returns the record and whether it was newly
    /// written (false means an identical grant already existed).
    pub fn grant(
        &self,
        chat_id: i64,
        user_id: i64,
        achievement_id: i64,
        tier: u32,
        unlocked_at: i64,
    ) -> Result<(AwardRecord, bool)> {
        let conn = self.db.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO user_achievements
                 (chat_id, user_id, achievement_id, tier, unlocked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chat_id, user_id, achievement_id, i64::from(tier), unlocked_at],
        )?;
        let stored_at: i64 = conn.query_row(
            "SELECT unlocked_at FROM user_achievements
             WHERE chat_id = ?1 AND user_id = ?2 AND achievement_id = ?3 AND tier = ?4",
            params![chat_id, user_id, achievement_id, i64::from(tier)],
            |row| row.get(0),
        )?;
        Ok((
            AwardRecord {
                chat_id,
                user_id,
                achievement_id,
                tier,
                unlocked_at: stored_at,
            },
            inserted == 1,
        ))
    }

    /// Highest granted tier for the user, 0 if none.
    pub fn max_tier(&self, chat_id: i64, user_id: i64, achievement_id: i64) -> Result<u32> {
        let conn = self.db.lock()?;
        let tier: i64 = conn.query_row(
            "SELECT COALESCE(MAX(tier), 0) FROM user_achievements
             WHERE chat_id = ?1 AND user_id = ?2 AND achievement_id = ?3",
            params![chat_id, user_id, achievement_id],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(tier).unwrap_or(0))
    }

    /// Distinct users in the chat holding any tier of the achievement.
    pub fn distinct_holders(&self, chat_id: i64, achievement_id: i64) -> Result<u64> {
        let conn = self.db.lock()?;
        let holders: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT user_id) FROM user_achievements
             WHERE chat_id = ?1 AND achievement_id = ?2",
            params![chat_id, achievement_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(holders).unwrap_or(0))
    }

    /// Delete award rows matching the scope. Returns the row count.
    pub fn revoke(&self, scope: &RevokeScope) -> Result<usize> {
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
            "DELETE FROM user_achievements".to_owned()
        } else {
            format!("DELETE FROM user_achievements WHERE {}", clauses.join(" AND "))
        };
        Ok(conn.execute(&sql, rusqlite::params_from_iter(values))?)
    }

    /// Every tier granted to one user in one chat, newest first, joined
    /// with its definition.
    pub fn awards_for_user(&self, chat_id: i64, user_id: i64) -> Result<Vec<UserAward>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT a.code, a.title, a.description, a.kind, ua.tier, ua.unlocked_at
             FROM user_achievements AS ua
             JOIN achievements AS a ON a.id = ua.achievement_id
             WHERE ua.chat_id = ?1 AND ua.user_id = ?2
             ORDER BY ua.unlocked_at DESC, ua.tier DESC",
        )?;
        let rows = stmt.query_map(params![chat_id, user_id], |row| {
            let kind_str: String = row.get(3)?;
            let tier: i64 = row.get(4)?;
            Ok(UserAward {
                code: row.get(0)?,
                title: row.get(1)?,
                description: row.get(2)?,
                kind: if kind_str == "tiered" {
                    AchievementKind::Tiered
                } else {
                    AchievementKind::Single
                },
                tier: u32::try_from(tier).unwrap_or(0),
                unlocked_at: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Award-count leaderboard for one chat.
    pub fn leaderboard(&self, chat_id: i64, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, COUNT(*) AS cnt FROM user_achievements
             WHERE chat_id = ?1
             GROUP BY user_id
             ORDER BY cnt DESC, user_id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![chat_id, limit as i64], |row| {
            Ok(LeaderboardEntry {
                user_id: row.get(0)?,
                awards: row.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
