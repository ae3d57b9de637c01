//! Snapshot storage so a game survives restarts.
//!
//! Saving is best-effort: a failed write is logged and gameplay continues.
//! Loading reports corruption and clears the stored entry, so the next load
//! starts fresh instead of failing the same way again.

use rochambeau_types::{Snapshot, SnapshotError};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tracing::{debug, error, warn};

pub trait SnapshotStore: Send + Sync {
    /// Overwrite the stored snapshot.
    fn save(&self, snapshot: &Snapshot);

    /// `Ok(None)` if nothing is stored.
    fn load(&self) -> Result<Option<Snapshot>, SnapshotError>;

    fn clear(&self);
}

fn decode(bytes: &[u8], store: &impl SnapshotStore) -> Result<Option<Snapshot>, SnapshotError> {
    match Snapshot::from_json(bytes) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(err) => {
            error!(%err, "discarding corrupted snapshot");
            store.clear();
            Err(err)
        }
    }
}

/// Stores the snapshot as a JSON file, replaced atomically on every save.
#[derive(Clone, Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &Snapshot) {
        let bytes = match snapshot.to_json() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "failed to encode snapshot");
                return;
            }
        };
        if let Err(err) = self.write(&bytes) {
            warn!(path = %self.path.display(), %err, "failed to persist snapshot");
        }
    }

    fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "failed to read snapshot");
                return Ok(None);
            }
        };
        decode(&bytes, self)
    }

    fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "snapshot cleared"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), %err, "failed to clear snapshot"),
        }
    }
}

/// In-memory slot holding the raw snapshot bytes. Clones share the slot.
#[derive(Clone, Debug, Default)]
pub struct MemorySnapshotStore {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
    read_only: Arc<AtomicBool>,
}

impl MemorySnapshotStore {
    /// A store that already holds `bytes`, valid or not.
    pub fn with_raw(bytes: Vec<u8>) -> Self {
        let store = Self::default();
        *store.lock() = Some(bytes);
        store
    }

    pub fn raw(&self) -> Option<Vec<u8>> {
        self.lock().clone()
    }

    /// Make every save fail, as a full disk would.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => {
                warn!("snapshot lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: &Snapshot) {
        if self.read_only.load(Ordering::SeqCst) {
            warn!("snapshot store is read-only, dropping save");
            return;
        }
        match snapshot.to_json() {
            Ok(bytes) => *self.lock() = Some(bytes),
            Err(err) => warn!(%err, "failed to encode snapshot"),
        }
    }

    fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let Some(bytes) = self.raw() else {
            return Ok(None);
        };
        decode(&bytes, self)
    }

    fn clear(&self) {
        *self.lock() = None;
    }
}
