//! Per-scope announcement cooldowns.
//!
//! The bot layer uses these to rate-limit award announcements and other
//! chatter. A row with `user_key = 0` applies chat-wide.

use rusqlite::params;

use crate::db::Db;
use crate::error::Result;

fn user_key(user_id: Option<i64>) -> i64 {
    user_id.unwrap_or(0)
}

/// TTL rows keyed by (scope, chat, user).
#[derive(Clone)]
pub struct CooldownStore {
    db: Db,
}

impl CooldownStore {
    pub(crate) fn new(db: Db) -> Self {
        Self { db }
    }

    /// Start (or extend) a cooldown expiring `ttl_secs` from `now_ts`.
    pub fn set(
        &self,
        scope: &str,
        chat_id: i64,
        user_id: Option<i64>,
        ttl_secs: i64,
        now_ts: i64,
    ) -> Result<()> {
        let expires_at = now_ts + ttl_secs.max(0);
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO cooldowns (scope, chat_id, user_key, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scope, chat_id, user_key) DO UPDATE SET expires_at = excluded.expires_at",
            params![scope, chat_id, user_key(user_id), expires_at],
        )?;
        Ok(())
    }

    /// Is the scope still cooling down at `now_ts`?
    pub fn is_active(
        &self,
        scope: &str,
        chat_id: i64,
        user_id: Option<i64>,
        now_ts: i64,
    ) -> Result<bool> {
        let conn = self.db.lock()?;
        let found = match conn.query_row(
            "SELECT 1 FROM cooldowns
             WHERE scope = ?1 AND chat_id = ?2 AND user_key = ?3 AND expires_at > ?4",
            params![scope, chat_id, user_key(user_id), now_ts],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(_) => true,
            Err(rusqlite::Error::QueryReturnedNoRows) => false,
            Err(e) => return Err(e.into()),
        };
        Ok(found)
    }

    /// Drop expired rows. Returns the row count.
    pub fn clear_expired(&self, now_ts: i64) -> Result<usize> {
        let conn = self.db.lock()?;
        Ok(conn.execute(
            "DELETE FROM cooldowns WHERE expires_at <= ?1",
            params![now_ts],
        )?)
    }

    /// Drop every row. Part of a full administrative reset.
    pub(crate) fn clear_all(&self) -> Result<usize> {
        let conn = self.db.lock()?;
        Ok(conn.execute("DELETE FROM cooldowns", [])?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
