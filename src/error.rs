//! Error types for the achievement engine.

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed achievement definition (bad thresholds, kind/condition
    /// mismatch, duplicate code). Surfaced at upsert time, never during
    /// event evaluation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Lookup by code or id with no match.
    #[error("not found: {0}")]
    NotFound(String),

    /// SQLite storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Schema migration failure.
    #[error("migration failed: {0}")]
    Migration(String),

    /// Connection mutex poisoned.
    #[error("lock poisoned: {0}")]
    Lock(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, EngineError>;
