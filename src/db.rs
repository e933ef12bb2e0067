//! SQLite connection handling.
//!
//! One `Connection` behind a `Mutex`, shared by every component store
//! through a cloneable handle. Writes are serialized; WAL mode keeps
//! readers unblocked on the SQLite side. Pending schema migrations run
//! on every open.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::{EngineError, Result};
use crate::migrate;

/// Cloneable handle to the engine database.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        configure(&conn)?;
        migrate::ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Acquire the connection mutex.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EngineError::Lock(e.to_string()))
    }
}

/// Configure SQLite pragmas.
fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    #[test]
    fn open_memory_runs_migrations() {
        let db = Db::open_memory().expect("open in-memory db");
        let conn = db.lock().expect("lock");
        let version = schema::read_schema_version(&conn)
            .expect("read version")
            .expect("version seeded");
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[test]
    fn foreign_keys_enabled() {
        let db = Db::open_memory().expect("open");
        let conn = db.lock().expect("lock");
        let fk: i32 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .expect("get foreign_keys");
        assert_eq!(fk, 1);
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("nested").join("kudos.db");
        let _db = Db::open(&path).expect("open on disk");
        assert!(path.exists());
    }
}
