//! State shared by every connection to one database file: the file handle,
//! the lock table, the write-ahead log index and the commit sequence used
//! to invalidate connection caches.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::{
    config::{DatabaseConfig, JournalMode, Synchronous},
    storage::{
        header::DatabaseHeader,
        journal::rollback_hot_journal,
        vfs::{Vfs, VfsFile, sidecar_path},
        wal::Wal,
    },
    types::{
        HEADER_SIZE,
        error::{DatabaseError, Result},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    None,
    Shared,
    Reserved,
    Pending,
    Exclusive,
}

#[derive(Debug, Default)]
struct LockState {
    shared: usize,
    reserved: bool,
    pending: bool,
    exclusive: bool,
    wal_writer: bool,
}

/// In-process lock table. Rollback-journal mode uses the shared/reserved/
/// pending/exclusive ladder; WAL mode only needs the single writer lock.
#[derive(Debug, Default)]
pub struct LockTable {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl LockTable {
    fn acquire(
        &self,
        timeout: Duration,
        what: &str,
        mut blocked: impl FnMut(&LockState) -> bool,
        grant: impl FnOnce(&mut LockState),
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while blocked(&state) {
            if Instant::now() >= deadline || self.cond.wait_until(&mut state, deadline).timed_out() {
                if blocked(&state) {
                    debug!(lock = what, "lock contention, reporting busy");
                    return Err(DatabaseError::Busy);
                }
                break;
            }
        }
        grant(&mut state);
        Ok(())
    }

    pub fn lock_shared(&self, timeout: Duration) -> Result<()> {
        self.acquire(
            timeout,
            "shared",
            |s| s.pending || s.exclusive,
            |s| s.shared += 1,
        )
    }

    /// Caller must already hold a shared lock.
    pub fn lock_reserved(&self, timeout: Duration) -> Result<()> {
        self.acquire(timeout, "reserved", |s| s.reserved, |s| s.reserved = true)
    }

    /// Caller must hold the reserved lock. Pending is taken at once so no new
    /// readers arrive; exclusive waits for the other readers to leave. On
    /// `Busy` the pending lock stays held until the caller unlocks.
    pub fn lock_exclusive(&self, timeout: Duration) -> Result<()> {
        self.state.lock().pending = true;
        self.acquire(timeout, "exclusive", |s| s.shared > 1, |s| s.exclusive = true)
    }

    /// Drops from `from` down to `to` (either `Shared` or `None`).
    pub fn unlock(&self, from: LockLevel, to: LockLevel) {
        let mut state = self.state.lock();
        if from >= LockLevel::Reserved && to < LockLevel::Reserved {
            state.reserved = false;
            state.pending = false;
            state.exclusive = false;
        }
        if from >= LockLevel::Shared && to == LockLevel::None {
            state.shared = state.shared.saturating_sub(1);
        }
        drop(state);
        self.cond.notify_all();
    }

    pub fn lock_wal_writer(&self, timeout: Duration) -> Result<()> {
        self.acquire(timeout, "wal writer", |s| s.wal_writer, |s| s.wal_writer = true)
    }

    pub fn unlock_wal_writer(&self) {
        self.state.lock().wal_writer = false;
        self.cond.notify_all();
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().shared
    }
}

pub struct SharedFile {
    path: PathBuf,
    vfs: Arc<dyn Vfs>,
    db_file: Arc<dyn VfsFile>,
    page_size: usize,
    journal_mode: JournalMode,
    synchronous: Synchronous,
    pub locks: LockTable,
    wal: Option<Mutex<Wal>>,
    commit_seq: AtomicU64,
}

impl std::fmt::Debug for SharedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFile")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("journal_mode", &self.journal_mode)
            .finish()
    }
}

impl SharedFile {
    /// Opens the database file for the first connection, replaying a hot
    /// journal or recovering the write-ahead log before anyone reads it.
    pub fn open(vfs: Arc<dyn Vfs>, path: &Path, config: &DatabaseConfig) -> Result<Arc<Self>> {
        config.validate()?;
        if !vfs.exists(path) && (!config.create_if_missing || config.read_only) {
            return Err(DatabaseError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("database file {} does not exist", path.display()),
            )));
        }
        let db_file = vfs.open(path, config.create_if_missing && !config.read_only)?;
        let sync = config.synchronous != Synchronous::Off;

        let journal_path = sidecar_path(path, "-journal");
        if !config.read_only {
            rollback_hot_journal(vfs.as_ref(), &journal_path, db_file.as_ref(), sync)?;
        }

        let file_size = db_file.size()?;
        let (page_size, header_wal) = if file_size == 0 {
            (config.page_size, false)
        } else {
            let mut bytes = [0u8; HEADER_SIZE];
            if db_file.read_at(&mut bytes, 0)? < HEADER_SIZE {
                return Err(DatabaseError::NotADatabase {
                    reason: "file shorter than the database header".to_string(),
                });
            }
            let header = DatabaseHeader::from_bytes(&bytes)?;
            (header.page_size, header.file_format_read_version == 2)
        };

        let journal_mode = if header_wal {
            JournalMode::Wal
        } else {
            config.journal_mode
        };
        let wal = match journal_mode {
            JournalMode::Wal => {
                let wal_path = sidecar_path(path, "-wal");
                Some(Mutex::new(Wal::open(vfs.as_ref(), &wal_path, page_size)?))
            }
            JournalMode::Delete => None,
        };

        info!(
            path = %path.display(),
            page_size,
            ?journal_mode,
            "opened database file"
        );
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            vfs,
            db_file,
            page_size,
            journal_mode,
            synchronous: config.synchronous,
            locks: LockTable::default(),
            wal,
            commit_seq: AtomicU64::new(0),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn vfs(&self) -> &dyn Vfs {
        self.vfs.as_ref()
    }

    pub fn db_file(&self) -> &dyn VfsFile {
        self.db_file.as_ref()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn journal_mode(&self) -> JournalMode {
        self.journal_mode
    }

    pub fn journal_path(&self) -> PathBuf {
        sidecar_path(&self.path, "-journal")
    }

    pub fn wal(&self) -> Option<&Mutex<Wal>> {
        self.wal.as_ref()
    }

    pub fn commit_seq(&self) -> u64 {
        self.commit_seq.load(Ordering::Acquire)
    }

    /// Called by a committing writer before it releases its locks.
    pub fn bump_commit_seq(&self) -> u64 {
        self.commit_seq.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Drop for SharedFile {
    fn drop(&mut self) {
        let Some(wal) = self.wal.as_ref() else {
            return;
        };
        let mut wal = wal.lock();
        let sync = self.synchronous != Synchronous::Off;
        match wal.checkpoint(self.db_file.as_ref(), sync) {
            Ok(result) if result.reset || wal.max_frame() == 0 => {
                let wal_path = wal.path().to_path_buf();
                if let Err(e) = self.vfs.delete(&wal_path) {
                    warn!(error = %e, "could not delete write-ahead log on close");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "final checkpoint failed; log kept for recovery"),
        }
    }
}
