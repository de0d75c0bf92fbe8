//! Durable byte store: the single named slot holding the serialized
//! database image across process restarts.
//!
//! The engine is agnostic about what backs the slot; the desktop build uses
//! a file on disk, tests use an in-memory slot (optionally quota-limited to
//! exercise the persistence failure path).

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

pub trait ByteStore: Send + Sync {
    /// Read the current image, `None` if the slot has never been written.
    fn load(&self) -> io::Result<Option<Vec<u8>>>;

    /// Replace the slot contents wholesale.
    fn store(&self, bytes: &[u8]) -> io::Result<()>;
}

impl<S: ByteStore + ?Sized> ByteStore for Arc<S> {
    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        (**self).load()
    }

    fn store(&self, bytes: &[u8]) -> io::Result<()> {
        (**self).store(bytes)
    }
}

/// File-backed slot. Writes go through a sibling temp file and an atomic
/// rename, so a crash mid-save leaves the previous image intact.
pub struct FileByteStore {
    path: PathBuf,
}

impl FileByteStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl ByteStore for FileByteStore {
    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn store(&self, bytes: &[u8]) -> io::Result<()> {
        let parent = self.path.parent().unwrap_or(std::path::Path::new("."));
        fs::create_dir_all(parent)?;
        let mut staging = tempfile::NamedTempFile::new_in(parent)?;
        staging.write_all(bytes)?;
        staging.flush()?;
        staging.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// In-memory slot for tests. `quota` caps accepted image size, standing in
/// for the original deployment's storage quota.
#[derive(Default)]
pub struct MemoryByteStore {
    data: Mutex<Option<Vec<u8>>>,
    quota: Option<usize>,
}

impl MemoryByteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            data: Mutex::new(None),
            quota: Some(quota),
        }
    }

    /// Current slot contents (test inspection).
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Preload the slot, e.g. with a corrupt image.
    pub fn preload(&self, bytes: Vec<u8>) {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = Some(bytes);
    }
}

impl ByteStore for MemoryByteStore {
    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.snapshot())
    }

    fn store(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(quota) = self.quota {
            if bytes.len() > quota {
                return Err(io::Error::other(format!(
                    "byte store quota exceeded: {} > {quota}",
                    bytes.len()
                )));
            }
        }
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = Some(bytes.to_vec());
        Ok(())
    }
}
