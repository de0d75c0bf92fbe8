//! Storage engine adapter: an in-memory SQLite instance whose whole image
//! is saved to a [`ByteStore`] after every mutation.
//!
//! Durability model: `save()` snapshots the entire database via the SQLite
//! online backup API and replaces the stored image. There is no WAL or
//! incremental persistence; this is O(database size) per write, which is
//! acceptable at single-clinic data volumes. A failed save leaves the
//! in-memory instance fully usable, so the error must reach the caller.

use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, DatabaseName, Params, Row, Transaction};

use super::byte_store::ByteStore;
use super::{format_timestamp, now, schema, StorageError};
use crate::models::UserRole;

/// Engine lifecycle, exposed to the composition root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Uninitialized,
    Ready,
    Failed(String),
}

enum EngineState {
    Uninitialized,
    Ready(Connection),
    Failed(String),
}

pub struct StorageEngine {
    state: Mutex<EngineState>,
    store: Box<dyn ByteStore>,
}

impl StorageEngine {
    /// Construct an engine over a durable byte store. No I/O happens until
    /// `initialize()`.
    pub fn new(store: Box<dyn ByteStore>) -> Self {
        Self {
            state: Mutex::new(EngineState::Uninitialized),
            store,
        }
    }

    /// Idempotent. Loads the persisted image if one exists and restores
    /// cleanly; otherwise starts a fresh database, applies the schema, and
    /// seeds the default doctor. Retry after failure is allowed.
    pub fn initialize(&self) -> Result<(), StorageError> {
        let mut state = self.lock_state();
        if matches!(*state, EngineState::Ready(_)) {
            return Ok(());
        }

        match self.open_instance() {
            Ok(conn) => {
                *state = EngineState::Ready(conn);
                Ok(())
            }
            Err(e) => {
                *state = EngineState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    pub fn status(&self) -> EngineStatus {
        match &*self.lock_state() {
            EngineState::Uninitialized => EngineStatus::Uninitialized,
            EngineState::Ready(_) => EngineStatus::Ready,
            EngineState::Failed(reason) => EngineStatus::Failed(reason.clone()),
        }
    }

    /// Execute a non-query statement, returning the affected row count.
    pub fn run<P: Params>(&self, sql: &str, params: P) -> Result<usize, StorageError> {
        let state = self.lock_state();
        let conn = ready(&state)?;
        Ok(conn.execute(sql, params)?)
    }

    /// Execute a query expected to return at most one row.
    pub fn get<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Option<T>, StorageError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let state = self.lock_state();
        let conn = ready(&state)?;
        let mut stmt = conn.prepare(sql)?;
        match stmt.query_row(params, map) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Execute a query, returning all rows in statement order.
    pub fn all<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Vec<T>, StorageError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let state = self.lock_state();
        let conn = ready(&state)?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, map)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Run `f` inside a SQLite transaction and persist on commit, all under
    /// the engine lock. This is the single critical section compound
    /// operations (review attach) rely on: a concurrent reader can never
    /// observe the transaction half-applied or unsaved.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StorageError>,
    {
        let mut state = self.lock_state();
        let conn = match &mut *state {
            EngineState::Ready(conn) => conn,
            _ => return Err(StorageError::NotInitialized),
        };
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        persist(self.store.as_ref(), conn)?;
        Ok(out)
    }

    /// Serialize the entire database and replace the stored image. The sole
    /// durability mechanism; callers surface failures to the user because a
    /// failed save means the last mutation may not survive a restart.
    pub fn save(&self) -> Result<(), StorageError> {
        let state = self.lock_state();
        let conn = ready(&state)?;
        persist(self.store.as_ref(), conn)
    }

    /// Drop the in-memory instance. Subsequent operations fail with
    /// `NotInitialized` until `initialize()` runs again.
    pub fn close(&self) {
        let mut state = self.lock_state();
        if matches!(*state, EngineState::Ready(_)) {
            tracing::debug!("storage engine closed");
        }
        *state = EngineState::Uninitialized;
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_instance(&self) -> Result<Connection, StorageError> {
        match self.store.load() {
            Ok(Some(bytes)) => match restore_image(&bytes) {
                Ok(conn) => {
                    tracing::info!(bytes = bytes.len(), "database image loaded from durable store");
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stored database image unreadable, starting fresh");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "durable store unreadable, starting fresh");
            }
        }

        let conn = open_memory()?;
        schema::apply_schema(&conn)?;
        seed_default_doctor(&conn)?;
        tracing::info!("new screening database created");

        // Best-effort initial save: the fresh database is valid in memory
        // even when the durable store rejects it; the next mutation's save
        // will surface the failure to the caller.
        if let Err(e) = persist(self.store.as_ref(), &conn) {
            tracing::warn!(error = %e, "initial database image save failed");
        }

        Ok(conn)
    }
}

fn ready<'a>(state: &'a MutexGuard<'_, EngineState>) -> Result<&'a Connection, StorageError> {
    match &**state {
        EngineState::Ready(conn) => Ok(conn),
        _ => Err(StorageError::NotInitialized),
    }
}

fn open_memory() -> Result<Connection, StorageError> {
    let conn =
        Connection::open_in_memory().map_err(|e| StorageError::Initialization(e.to_string()))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")
        .map_err(|e| StorageError::Initialization(e.to_string()))?;
    Ok(conn)
}

/// Deserialize a stored image into a live in-memory instance, verifying it
/// actually contains the screening schema.
fn restore_image(bytes: &[u8]) -> Result<Connection, StorageError> {
    let mut staging =
        tempfile::NamedTempFile::new().map_err(|e| StorageError::Initialization(e.to_string()))?;
    staging
        .write_all(bytes)
        .and_then(|_| staging.flush())
        .map_err(|e| StorageError::Initialization(e.to_string()))?;

    let mut conn = open_memory()?;
    conn.restore(
        DatabaseName::Main,
        staging.path(),
        None::<fn(rusqlite::backup::Progress)>,
    )
    .map_err(|e| StorageError::Initialization(e.to_string()))?;

    if schema::count_tables(&conn)? < schema::EXPECTED_TABLES {
        return Err(StorageError::Initialization(
            "restored image does not contain the screening schema".into(),
        ));
    }
    Ok(conn)
}

fn persist(store: &dyn ByteStore, conn: &Connection) -> Result<(), StorageError> {
    let staging =
        tempfile::NamedTempFile::new().map_err(|e| StorageError::Persistence(e.to_string()))?;
    conn.backup(DatabaseName::Main, staging.path(), None)
        .map_err(|e| StorageError::Persistence(e.to_string()))?;
    let bytes =
        std::fs::read(staging.path()).map_err(|e| StorageError::Persistence(e.to_string()))?;
    store
        .store(&bytes)
        .map_err(|e| StorageError::Persistence(e.to_string()))?;
    tracing::debug!(bytes = bytes.len(), "database image persisted");
    Ok(())
}

/// Insert the default doctor account unless its email already exists.
fn seed_default_doctor(conn: &Connection) -> Result<(), StorageError> {
    let exists = conn
        .prepare("SELECT 1 FROM users WHERE email = ?1")?
        .exists([schema::DEFAULT_DOCTOR.email])?;
    if exists {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO users (id, email, name, password_hash, role, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            schema::DEFAULT_DOCTOR.id,
            schema::DEFAULT_DOCTOR.email,
            schema::DEFAULT_DOCTOR.name,
            schema::DEFAULT_DOCTOR.password,
            UserRole::Doctor.as_str(),
            format_timestamp(&now()),
        ],
    )?;
    tracing::info!(email = schema::DEFAULT_DOCTOR.email, "default doctor account seeded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::byte_store::MemoryByteStore;

    fn ready_engine() -> StorageEngine {
        let engine = StorageEngine::new(Box::new(MemoryByteStore::new()));
        engine.initialize().unwrap();
        engine
    }

    #[test]
    fn uninitialized_engine_rejects_operations() {
        let engine = StorageEngine::new(Box::new(MemoryByteStore::new()));
        assert!(matches!(
            engine.run("DELETE FROM users", []),
            Err(StorageError::NotInitialized)
        ));
        assert!(matches!(engine.save(), Err(StorageError::NotInitialized)));
        assert_eq!(engine.status(), EngineStatus::Uninitialized);
    }

    #[test]
    fn initialize_is_idempotent() {
        let engine = ready_engine();
        engine
            .run(
                "INSERT INTO users (id, email, name, password_hash, role, created_at)
                 VALUES ('u-1', 'a@b.com', 'A', 'pw', 'technician', '2024-01-01T00:00:00.000000Z')",
                [],
            )
            .unwrap();

        engine.initialize().unwrap();

        // Second initialize must not replace the live instance.
        let found = engine
            .get("SELECT name FROM users WHERE id = 'u-1'", [], |row| {
                row.get::<_, String>(0)
            })
            .unwrap();
        assert_eq!(found.as_deref(), Some("A"));
    }

    #[test]
    fn fresh_database_seeds_default_doctor() {
        let engine = ready_engine();
        let row = engine
            .get(
                "SELECT name, role, password_hash FROM users WHERE email = ?1",
                [schema::DEFAULT_DOCTOR.email],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(row.0, schema::DEFAULT_DOCTOR.name);
        assert_eq!(row.1, "doctor");
        assert_eq!(row.2, schema::DEFAULT_DOCTOR.password);
    }

    #[test]
    fn image_round_trips_across_restart() {
        let store = Arc::new(MemoryByteStore::new());

        let engine = StorageEngine::new(Box::new(Arc::clone(&store)));
        engine.initialize().unwrap();
        engine
            .run(
                "INSERT INTO users (id, email, name, password_hash, role, created_at)
                 VALUES ('u-1', 'a@b.com', 'A', 'pw', 'admin', '2024-01-01T00:00:00.000000Z')",
                [],
            )
            .unwrap();
        engine.save().unwrap();
        engine.close();

        let reopened = StorageEngine::new(Box::new(store));
        reopened.initialize().unwrap();
        let email = reopened
            .get("SELECT email FROM users WHERE id = 'u-1'", [], |row| {
                row.get::<_, String>(0)
            })
            .unwrap();
        assert_eq!(email.as_deref(), Some("a@b.com"));
    }

    #[test]
    fn corrupt_image_falls_back_to_fresh_seeded_database() {
        let store = Arc::new(MemoryByteStore::new());
        store.preload(b"definitely not a sqlite image".to_vec());

        let engine = StorageEngine::new(Box::new(Arc::clone(&store)));
        engine.initialize().unwrap();

        let doctor = engine
            .get(
                "SELECT id FROM users WHERE email = ?1",
                [schema::DEFAULT_DOCTOR.email],
                |row| row.get::<_, String>(0),
            )
            .unwrap();
        assert_eq!(doctor.as_deref(), Some(schema::DEFAULT_DOCTOR.id));
    }

    #[test]
    fn save_failure_surfaces_but_memory_stays_usable() {
        // Quota far below any real image size: every save fails.
        let engine = StorageEngine::new(Box::new(MemoryByteStore::with_quota(16)));
        engine.initialize().unwrap();

        engine
            .run(
                "INSERT INTO users (id, email, name, password_hash, role, created_at)
                 VALUES ('u-1', 'a@b.com', 'A', 'pw', 'doctor', '2024-01-01T00:00:00.000000Z')",
                [],
            )
            .unwrap();
        assert!(matches!(engine.save(), Err(StorageError::Persistence(_))));

        // The in-memory row is still readable after the failed save.
        let found = engine
            .get("SELECT email FROM users WHERE id = 'u-1'", [], |row| {
                row.get::<_, String>(0)
            })
            .unwrap();
        assert_eq!(found.as_deref(), Some("a@b.com"));
    }

    #[test]
    fn close_then_reinitialize() {
        let engine = ready_engine();
        engine.close();
        assert!(matches!(
            engine.get("SELECT 1", [], |row| row.get::<_, i64>(0)),
            Err(StorageError::NotInitialized)
        ));

        engine.initialize().unwrap();
        assert_eq!(engine.status(), EngineStatus::Ready);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let engine = ready_engine();
        let result: Result<(), StorageError> = engine.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO users (id, email, name, password_hash, role, created_at)
                 VALUES ('u-1', 'a@b.com', 'A', 'pw', 'doctor', '2024-01-01T00:00:00.000000Z')",
                [],
            )?;
            Err(StorageError::ConstraintViolation("forced".into()))
        });
        assert!(result.is_err());

        let found = engine
            .get("SELECT 1 FROM users WHERE id = 'u-1'", [], |row| {
                row.get::<_, i64>(0)
            })
            .unwrap();
        assert!(found.is_none(), "rolled-back insert must not be visible");
    }

    #[test]
    fn get_returns_none_for_zero_rows() {
        let engine = ready_engine();
        let found = engine
            .get("SELECT id FROM users WHERE email = 'nobody@x.com'", [], |row| {
                row.get::<_, String>(0)
            })
            .unwrap();
        assert!(found.is_none());
    }
}
