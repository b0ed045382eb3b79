//! Persisted job store.
//!
//! Best-effort snapshot persistence: the manager overwrites the full
//! content on meaningful progress events, and reads it back once at
//! startup. Last writer wins; there is exactly one owning manager per
//! store instance.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;
use tracing::debug;

use crate::StoreError;

/// Contract for the persisted job snapshot store.
pub trait JobStore: Send + Sync {
    /// Writes or replaces one snapshot.
    fn set(&self, id: &str, snapshot: Value) -> Result<(), StoreError>;

    /// Drops all snapshots (in memory; [`compact`] makes it durable).
    ///
    /// [`compact`]: JobStore::compact
    fn clear(&self) -> Result<(), StoreError>;

    /// Returns all `(id, snapshot)` pairs. Finite and restartable
    /// across process runs.
    fn iterate(&self) -> Result<Vec<(String, Value)>, StoreError>;

    /// Flushes pending writes to durable storage. `force` rewrites
    /// even when nothing changed.
    fn compact(&self, force: bool) -> Result<(), StoreError>;

    /// Flushes and closes; subsequent operations fail with
    /// [`StoreError::Closed`].
    fn close(&self) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// FileJobStore
// ---------------------------------------------------------------------------

struct FileInner {
    entries: BTreeMap<String, Value>,
    dirty: bool,
    closed: bool,
}

/// JSON-file-backed store: one object mapping job id to snapshot,
/// rewritten whole on compact via a temp file and atomic rename.
pub struct FileJobStore {
    path: PathBuf,
    inner: Mutex<FileInner>,
}

impl FileJobStore {
    /// Opens (or creates) the store at `path`, loading any existing
    /// content.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "opened job store");
        Ok(Self {
            path,
            inner: Mutex::new(FileInner {
                entries,
                dirty: false,
                closed: false,
            }),
        })
    }

    fn flush(&self, inner: &mut FileInner) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&inner.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        inner.dirty = false;
        Ok(())
    }
}

impl JobStore for FileJobStore {
    fn set(&self, id: &str, snapshot: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.entries.insert(id.to_string(), snapshot);
        inner.dirty = true;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        if !inner.entries.is_empty() {
            inner.entries.clear();
            inner.dirty = true;
        }
        Ok(())
    }

    fn iterate(&self) -> Result<Vec<(String, Value)>, StoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn compact(&self, force: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        if inner.dirty || force {
            self.flush(&mut inner)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Ok(());
        }
        if inner.dirty {
            self.flush(&mut inner)?;
        }
        inner.closed = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryJobStore
// ---------------------------------------------------------------------------

/// In-memory store for tests and embedders that skip disk persistence.
#[derive(Default)]
pub struct MemoryJobStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn set(&self, id: &str, snapshot: Value) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(id.to_string(), snapshot);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }

    fn iterate(&self) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn compact(&self, _force: bool) -> Result<(), StoreError> {
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
