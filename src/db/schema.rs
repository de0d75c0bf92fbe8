//! Fixed DDL for the screening schema, applied when the engine starts with
//! a fresh database. Constraints live in the engine, not application code:
//! unique emails, enum CHECKs, and the review cascade are all enforced here.

use rusqlite::Connection;

use super::StorageError;

pub const SCHEMA_SQL: &str = include_str!("../../resources/schema.sql");

/// The privileged account seeded into every fresh database so the review
/// queue is usable before anyone registers. Its fixed (non-UUID) id is the
/// reason entity ids are opaque strings.
pub struct DefaultDoctor {
    pub id: &'static str,
    pub email: &'static str,
    pub name: &'static str,
    pub password: &'static str,
}

pub const DEFAULT_DOCTOR: DefaultDoctor = DefaultDoctor {
    id: "default-doctor-001",
    email: "doctor@clinic.com",
    name: "Dr. Ophthalmologist",
    password: "password",
};

/// Apply the schema to a connection. Safe to re-run.
pub fn apply_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Count user tables (for verifying that a restored image is actually a
/// BrightSight database and not arbitrary bytes that happened to restore).
pub fn count_tables(conn: &Connection) -> Result<i64, StorageError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}

/// Number of tables `SCHEMA_SQL` creates.
pub const EXPECTED_TABLES: i64 = 4;
