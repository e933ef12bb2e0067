//! Versioned schema migrations.
//!
//! A linear list of named steps applied in order inside one transaction
//! each, replacing the live-schema introspection the bot used to ship.
//! `ensure_schema` is idempotent and runs on every open; it must never
//! lose existing award or progress rows. Preserving them across shape
//! changes is the defining correctness property of this module.

use rusqlite::Connection;

use crate::error::{EngineError, Result};
use crate::schema::{
    self, SCHEMA_META_SQL, SCHEMA_V1, SCHEMA_V2, SCHEMA_V3, SCHEMA_VERSION,
};

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial schema",
        sql: SCHEMA_V1,
    },
    Migration {
        version: 2,
        name: "tiered awards",
        sql: SCHEMA_V2,
    },
    Migration {
        version: 3,
        name: "period-scoped definitions",
        sql: SCHEMA_V3,
    },
];

/// Bring the database up to the current schema version.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    run_to(conn, SCHEMA_VERSION)
}

/// Apply pending migrations up to `target`. Exposed separately so tests can
/// populate a database at an old version before upgrading it.
pub(crate) fn run_to(conn: &Connection, target: u32) -> Result<()> {
    conn.execute_batch(SCHEMA_META_SQL)?;
    let current = schema::read_schema_version(conn)?.unwrap_or(0);

    if current > SCHEMA_VERSION {
        return Err(EngineError::Migration(format!(
            "database version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    for migration in MIGRATIONS {
        if migration.version <= current || migration.version > target {
            continue;
        }
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applying schema migration"
        );
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)?;
        schema::write_schema_version(&tx, migration.version)?;
        tx.commit()?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
