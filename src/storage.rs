//! Append-only shared log backed by a file.
//!
//! Every client message and every timestamp record ends up here. A single
//! mutex serializes appends and snapshots, so a record is always written
//! as one contiguous unit and a snapshot never observes half of one.

use bytes::{Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// State guarded by the store lock.
struct Inner {
    /// In-memory copy of everything appended so far.
    data: BytesMut,
    /// Backing file; `None` once the store has been removed.
    file: Option<File>,
}

/// Thread-safe append-only byte log
pub struct SharedStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl SharedStore {
    /// Create the store, truncating any backing file left by a previous run.
    pub fn create(path: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StoreError::Create(path.clone(), e))?;
        // Daemon mode changes directory after this point.
        let path = std::fs::canonicalize(&path).unwrap_or(path);

        info!(path = %path.display(), "Initializing store");

        Ok(Arc::new(Self {
            path,
            inner: Mutex::new(Inner {
                data: BytesMut::new(),
                file: Some(file),
            }),
        }))
    }

    // Appends are all-or-nothing, so the contents stay valid even if a
    // holder panicked.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one record.
    ///
    /// The lock is held for the whole write, so records never interleave.
    /// On a failed write the backing file is cut back to its previous
    /// length and the in-memory log is left untouched.
    pub fn append(&self, record: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let committed = inner.data.len() as u64;

        let file = inner.file.as_mut().ok_or(StoreError::Closed)?;
        if let Err(e) = file.write_all(record).and_then(|()| file.flush()) {
            if let Err(rollback) = truncate_to(file, committed) {
                warn!(error = %rollback, "Failed to roll back partial append");
            }
            return Err(StoreError::Write(self.path.clone(), e));
        }

        inner.data.extend_from_slice(record);
        debug!(bytes = record.len(), total = inner.data.len(), "Appended record");
        Ok(())
    }

    /// Copy of every record appended before the call.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock().data)
    }

    /// Total bytes appended so far.
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    /// Close and delete the backing file.
    ///
    /// Only the first call has any effect; later appends fail with
    /// [`StoreError::Closed`].
    pub fn remove(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.file.take().is_none() {
            return Ok(());
        }
        inner.data.clear();

        std::fs::remove_file(&self.path).map_err(|e| StoreError::Remove(self.path.clone(), e))?;
        info!(path = %self.path.display(), "Removed store");
        Ok(())
    }
}

/// Cut the file back to `len` bytes and move the write position there, so
/// the next append starts exactly at the end of the last whole record.
fn truncate_to(file: &mut File, len: u64) -> io::Result<()> {
    file.set_len(len)?;
    file.seek(SeekFrom::Start(len))?;
    Ok(())
}

/// Store errors
#[derive(Debug)]
pub enum StoreError {
    Create(PathBuf, std::io::Error),
    Write(PathBuf, std::io::Error),
    Remove(PathBuf, std::io::Error),
    Closed,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Create(path, e) => {
                write!(f, "Failed to create store '{}': {}", path.display(), e)
            }
            StoreError::Write(path, e) => {
                write!(f, "Failed to append to store '{}': {}", path.display(), e)
            }
            StoreError::Remove(path, e) => {
                write!(f, "Failed to remove store '{}': {}", path.display(), e)
            }
            StoreError::Closed => write!(f, "Store has been removed"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Create(_, e) | StoreError::Write(_, e) | StoreError::Remove(_, e) => {
                Some(e)
            }
            StoreError::Closed => None,
        }
    }
}
