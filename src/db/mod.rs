pub mod byte_store;
pub mod engine;
pub mod migrate;
pub mod repository;
pub mod schema;

pub use byte_store::*;
pub use engine::*;
pub use migrate::*;
pub use repository::*;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Engine used before `initialize()` (or after `close()`).
    #[error("storage engine not initialized")]
    NotInitialized,

    /// The engine could not be constructed or its persisted image loaded.
    #[error("storage engine initialization failed: {0}")]
    Initialization(String),

    /// A relational constraint rejected the write (e.g. duplicate email).
    #[error("constraint violated: {0}")]
    ConstraintViolation(String),

    /// The durable byte store refused the database image. In-memory state
    /// is still valid; the most recent mutation may not survive a restart.
    #[error("failed to persist database image: {0}")]
    Persistence(String),

    /// A stored text column was not well-formed for its expected encoding.
    #[error("failed to decode stored {field}: {reason}")]
    Decode { field: String, reason: String },

    #[error("invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// True when a rusqlite error is a constraint violation (unique, check, FK).
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Current time truncated to microseconds, so a value round-trips exactly
/// through its stored representation.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 with microseconds: lexicographic order on the stored
/// strings equals chronological order, which `ORDER BY created_at` relies on.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::Decode {
            field: field.into(),
            reason: e.to_string(),
        })
}
