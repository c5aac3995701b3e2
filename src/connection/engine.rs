//! Registry of open database files.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock, Weak},
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    config::DatabaseConfig,
    connection::Connection,
    storage::{
        shared::SharedFile,
        vfs::{OsVfs, Vfs},
    },
    types::error::Result,
};

/// Hands out connections. Connections opened through the same engine share
/// one [`SharedFile`] per database path, and with it the lock table, the
/// write-ahead log index and the commit sequence. The registry only holds
/// weak references: the file state lives as long as its last connection.
pub struct Engine {
    vfs: Arc<dyn Vfs>,
    files: Mutex<HashMap<PathBuf, Weak<SharedFile>>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("open_files", &self.open_files())
            .finish()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_vfs(Arc::new(OsVfs))
    }

    pub fn with_vfs(vfs: Arc<dyn Vfs>) -> Self {
        Self {
            vfs,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Engine behind [`Connection::open`].
    pub(crate) fn global() -> &'static Engine {
        static ENGINE: OnceLock<Engine> = OnceLock::new();
        ENGINE.get_or_init(Engine::new)
    }

    /// Opens a connection to `path`, joining the file's existing shared state
    /// if another connection from this engine has it open.
    pub fn connect(&self, path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Connection> {
        let shared = self.shared_file(path.as_ref(), &config)?;
        Connection::with_shared(shared, config)
    }

    /// Number of database files with at least one live connection.
    pub fn open_files(&self) -> usize {
        self.files
            .lock()
            .values()
            .filter(|file| file.strong_count() > 0)
            .count()
    }

    fn shared_file(&self, path: &Path, config: &DatabaseConfig) -> Result<Arc<SharedFile>> {
        let key = registry_key(path);
        let mut files = self.files.lock();
        files.retain(|_, file| file.strong_count() > 0);
        if let Some(shared) = files.get(&key).and_then(Weak::upgrade) {
            debug!(path = %key.display(), "joining open database file");
            return Ok(shared);
        }
        let shared = SharedFile::open(Arc::clone(&self.vfs), path, config)?;
        files.insert(key, Arc::downgrade(&shared));
        Ok(shared)
    }
}

/// Canonical form of `path`, so different spellings of one file share state.
/// Files that do not exist yet are resolved through their parent directory.
fn registry_key(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    match (std::fs::canonicalize(parent), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}
