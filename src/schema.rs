//! SQLite DDL for the achievement engine.
//!
//! All `CREATE TABLE` statements live here, one constant per schema
//! revision, so the migration history stays reviewable in isolation.
//! The current version stamp is kept in `schema_meta`.

use rusqlite::Connection;

/// Current schema version.
pub(crate) const SCHEMA_VERSION: u32 = 3;

/// Version-stamp table, created before any migration runs.
pub(crate) const SCHEMA_META_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// v1: initial schema. Predates tiered achievements: `user_achievements`
/// keys on (chat, user, achievement) with no tier column, and definitions
/// have no period column.
pub(crate) const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS achievements (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    code           TEXT NOT NULL COLLATE NOCASE UNIQUE,
    title          TEXT NOT NULL,
    description    TEXT NOT NULL,
    kind           TEXT NOT NULL CHECK(kind IN ('single','tiered')),
    condition_type TEXT NOT NULL CHECK(condition_type IN ('counter','date','keyword')),
    metric         TEXT,
    thresholds     TEXT NOT NULL DEFAULT '[]',  -- JSON array of integers
    target_ts      INTEGER,
    extra          TEXT,                        -- JSON per-condition payload
    active         INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS user_metrics (
    chat_id    INTEGER NOT NULL,
    user_id    INTEGER NOT NULL,
    metric     TEXT NOT NULL,
    count      INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY(chat_id, user_id, metric)
);

CREATE TABLE IF NOT EXISTS achievement_progress (
    chat_id        INTEGER NOT NULL,
    user_id        INTEGER NOT NULL,
    achievement_id INTEGER NOT NULL,
    progress       INTEGER NOT NULL DEFAULT 0,
    updated_at     INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY(chat_id, user_id, achievement_id),
    FOREIGN KEY(achievement_id) REFERENCES achievements(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS user_achievements (
    chat_id        INTEGER NOT NULL,
    user_id        INTEGER NOT NULL,
    achievement_id INTEGER NOT NULL,
    unlocked_at    INTEGER NOT NULL,
    PRIMARY KEY(chat_id, user_id, achievement_id),
    FOREIGN KEY(achievement_id) REFERENCES achievements(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS cooldowns (
    scope      TEXT NOT NULL,
    chat_id    INTEGER NOT NULL,
    user_key   INTEGER NOT NULL DEFAULT 0,  -- 0 means chat-wide
    expires_at INTEGER NOT NULL,
    PRIMARY KEY(scope, chat_id, user_key)
);

CREATE INDEX IF NOT EXISTS idx_user_metrics_metric ON user_metrics(metric);
CREATE INDEX IF NOT EXISTS idx_progress_achievement ON achievement_progress(achievement_id);
";

/// v2: tiered awards. Rebuilds `user_achievements` under a temporary name
/// to widen the primary key with a tier column, copying existing rows as
/// tier 1.
pub(crate) const SCHEMA_V2: &str = "
CREATE TABLE user_achievements_new (
    chat_id        INTEGER NOT NULL,
    user_id        INTEGER NOT NULL,
    achievement_id INTEGER NOT NULL,
    tier           INTEGER NOT NULL DEFAULT 1,
    unlocked_at    INTEGER NOT NULL,
    PRIMARY KEY(chat_id, user_id, achievement_id, tier),
    FOREIGN KEY(achievement_id) REFERENCES achievements(id) ON DELETE CASCADE
);

INSERT OR IGNORE INTO user_achievements_new (chat_id, user_id, achievement_id, tier, unlocked_at)
    SELECT chat_id, user_id, achievement_id, 1, unlocked_at FROM user_achievements;

DROP TABLE user_achievements;
ALTER TABLE user_achievements_new RENAME TO user_achievements;

CREATE INDEX IF NOT EXISTS idx_awards_achievement ON user_achievements(achievement_id);
";

/// v3: period-scoped definitions. Additive only: existing rows default to
/// all-time attribution.
pub(crate) const SCHEMA_V3: &str = "
ALTER TABLE achievements ADD COLUMN period TEXT NOT NULL DEFAULT 'all_time';
CREATE INDEX IF NOT EXISTS idx_achievements_metric ON achievements(metric);
";

/// Read the current schema version from `schema_meta`.
///
/// Returns `None` on a fresh database.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}

/// Stamp the schema version, overwriting any previous value.
pub(crate) fn write_schema_version(conn: &Connection, version: u32) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
