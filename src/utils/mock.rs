use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::{
    config::DatabaseConfig,
    connection::{Connection, Engine},
    types::error::Result,
};

/// A scratch database in its own temporary directory, removed on drop
/// together with its journal and log files.
pub struct TempDatabase {
    dir: TempDir,
    pub path: PathBuf,
    pub config: DatabaseConfig,
    engine: Engine,
}

impl TempDatabase {
    pub fn new() -> Self {
        Self::with_prefix("litecore")
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self::with_config(prefix, DatabaseConfig::default())
    }

    pub fn with_config(prefix: &str, config: DatabaseConfig) -> Self {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .expect("Failed to create temporary directory");
        let path = dir.path().join(format!("{prefix}.db"));
        Self {
            dir,
            path,
            config,
            engine: Engine::new(),
        }
    }

    /// Opens a connection. Connections from one `TempDatabase` share file
    /// state the way connections in one process do.
    pub fn connect(&self) -> Result<Connection> {
        self.engine.connect(&self.path, self.config.clone())
    }

    /// Opens through a fresh engine, as a newly started process would: the
    /// file is recovered from whatever journal or log is on disk.
    pub fn reopen(&self) -> Result<Connection> {
        Engine::new().connect(&self.path, self.config.clone())
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn wal_path(&self) -> PathBuf {
        crate::storage::vfs::sidecar_path(&self.path, "-wal")
    }

    pub fn journal_path(&self) -> PathBuf {
        crate::storage::vfs::sidecar_path(&self.path, "-journal")
    }
}

impl Default for TempDatabase {
    fn default() -> Self {
        Self::new()
    }
}
