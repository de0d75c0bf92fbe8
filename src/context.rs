//! Composition root: brings up the storage engine, runs the one-shot legacy
//! import, and hands out repositories over the shared engine.

use std::sync::Arc;

use crate::config;
use crate::db::byte_store::{ByteStore, FileByteStore};
use crate::db::engine::{EngineStatus, StorageEngine};
use crate::db::migrate::{JsonFileLegacyStore, LegacyStore, MigrationReport, MigrationRunner};
use crate::db::repository::{DetectionRepository, UserRepository};
use crate::db::StorageError;

pub struct AppContext {
    engine: Arc<StorageEngine>,
    users: UserRepository,
    detections: DetectionRepository,
    migration: MigrationReport,
}

impl AppContext {
    /// Bring up a ready-to-use context: initialize the engine against the
    /// given byte store, then run the legacy import (a no-op once its
    /// marker is set).
    pub fn initialize(
        store: Box<dyn ByteStore>,
        legacy: &dyn LegacyStore,
    ) -> Result<Self, StorageError> {
        let engine = Arc::new(StorageEngine::new(store));
        engine.initialize()?;

        let migration = MigrationRunner::new(Arc::clone(&engine)).run(legacy)?;

        Ok(Self {
            users: UserRepository::new(Arc::clone(&engine)),
            detections: DetectionRepository::new(Arc::clone(&engine)),
            engine,
            migration,
        })
    }

    /// Desktop wiring: file-backed image and legacy dump under the
    /// application data directory.
    pub fn initialize_default() -> Result<Self, StorageError> {
        let store = FileByteStore::new(config::db_image_path());
        let legacy = JsonFileLegacyStore::open(&config::legacy_store_path())
            .map_err(|e| StorageError::Initialization(e.to_string()))?;
        Self::initialize(Box::new(store), &legacy)
    }

    pub fn users(&self) -> &UserRepository {
        &self.users
    }

    pub fn detections(&self) -> &DetectionRepository {
        &self.detections
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// What the startup import did, for surfacing in the UI once.
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.engine.status(), EngineStatus::Ready)
    }

    /// Persist and release the engine. Repositories error with
    /// `NotInitialized` afterwards.
    pub fn close(&self) -> Result<(), StorageError> {
        self.engine.save()?;
        self.engine.close();
        Ok(())
    }
}
