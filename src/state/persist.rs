//! Durable storage for [`RuntimeStateSnapshot`].
//!
//! The store only needs "load the last snapshot" and "save this snapshot".
//! [`JsonFilePersistence`] writes atomically (temp file → fsync → rename) so a
//! crash mid-write never leaves a truncated state file behind.

use crate::error::PersistenceError;
use crate::state::RuntimeStateSnapshot;
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Durable persistence collaborator used by the runtime state store.
#[async_trait]
pub trait StatePersistence: Send + Sync {
    /// Load the last saved snapshot, or `None` when nothing was saved yet.
    async fn load(&self) -> Result<Option<RuntimeStateSnapshot>, PersistenceError>;

    /// Durably replace the saved snapshot.
    async fn save(&self, snapshot: &RuntimeStateSnapshot) -> Result<(), PersistenceError>;
}

/// Snapshot stored as a pretty-printed JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the state document.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StatePersistence for JsonFilePersistence {
    async fn load(&self) -> Result<Option<RuntimeStateSnapshot>, PersistenceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| PersistenceError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    async fn save(&self, snapshot: &RuntimeStateSnapshot) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(snapshot).map_err(PersistenceError::Encode)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|e| PersistenceError::Unavailable(format!("state writer task failed: {e}")))?
    }
}

/// Write bytes atomically (temp file → fsync → rename).
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let write_err = |source| PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let mut file = std::fs::File::create(&tmp_path).map_err(write_err)?;
    file.write_all(bytes).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    std::fs::rename(&tmp_path, path).map_err(write_err)
}

/// Volatile persistence for tests and dry runs.
///
/// Keeps the last saved snapshot in memory and counts writes.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    saved: Mutex<Option<RuntimeStateSnapshot>>,
    saves: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing snapshot, as if it had been saved earlier.
    pub fn with_snapshot(snapshot: RuntimeStateSnapshot) -> Self {
        Self {
            saved: Mutex::new(Some(snapshot)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// The most recently saved snapshot.
    pub fn last_saved(&self) -> Option<RuntimeStateSnapshot> {
        self.saved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StatePersistence for MemoryPersistence {
    async fn load(&self) -> Result<Option<RuntimeStateSnapshot>, PersistenceError> {
        Ok(self.last_saved())
    }

    async fn save(&self, snapshot: &RuntimeStateSnapshot) -> Result<(), PersistenceError> {
        *self
            .saved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
