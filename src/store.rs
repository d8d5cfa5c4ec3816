//! Durable record of the current (or most recent) operation.
//!
//! The store holds exactly one [`Operation`]; every `save` fully replaces the
//! previous version. Only the holder of the store's [`WriterLease`] may save.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StoreError;
use crate::state_machine::Operation;

pub trait OperationStore: Send + Sync {
    /// Atomically replace the stored operation.
    fn save(&self, op: &Operation) -> Result<(), StoreError>;

    /// The last committed operation, if any.
    fn load(&self) -> Result<Option<Operation>, StoreError>;

    /// Claim the single-writer lease. `None` while another writer holds it.
    fn claim(&self) -> Result<Option<WriterLease>, StoreError>;
}

/// Exclusive right to write a store, released on drop.
pub struct WriterLease {
    // Closing the file releases the advisory lock.
    _file: Option<File>,
    flag: Option<Arc<AtomicBool>>,
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        if let Some(flag) = &self.flag {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

/// JSON file store. Writes go to a temporary file next to the record and are
/// renamed over it, so readers never observe a partial write.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sidecar file locked by the process that owns the store.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.dir().join(name)
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

impl OperationStore for FileStore {
    fn save(&self, op: &Operation) -> Result<(), StoreError> {
        let dir = self.dir();
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, op)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;

        debug!(
            op_id = %op.id,
            processed = op.processed_count,
            total = op.total_count,
            path = %self.path.display(),
            "operation saved"
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<Operation>, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn claim(&self) -> Result<Option<WriterLease>, StoreError> {
        std::fs::create_dir_all(self.dir())?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(path = %self.lock_path().display(), "store lock acquired");
                Ok(Some(WriterLease {
                    _file: Some(file),
                    flag: None,
                }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store, used by the demo and tests.
#[derive(Default)]
pub struct MemoryStore {
    record: Mutex<Option<Operation>>,
    writer: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store as if a previous process had saved `op`.
    pub fn with_operation(op: Operation) -> Self {
        Self {
            record: Mutex::new(Some(op)),
            ..Self::default()
        }
    }
}

impl OperationStore for MemoryStore {
    fn save(&self, op: &Operation) -> Result<(), StoreError> {
        let mut record = self
            .record
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        *record = Some(op.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Operation>, StoreError> {
        let record = self
            .record
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        Ok(record.clone())
    }

    fn claim(&self) -> Result<Option<WriterLease>, StoreError> {
        let claimed = self
            .writer
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        Ok(claimed.then(|| WriterLease {
            _file: None,
            flag: Some(Arc::clone(&self.writer)),
        }))
    }
}
