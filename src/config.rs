use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{
    DEFAULT_PAGE_SIZE,
    error::{DatabaseError, Result},
    is_valid_page_size,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JournalMode {
    /// Rollback journal deleted at commit.
    #[default]
    Delete,
    /// Write-ahead log with snapshot readers.
    Wal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Synchronous {
    Off,
    Normal,
    #[default]
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Page size for newly created databases. Existing files keep theirs.
    pub page_size: usize,
    /// Pages held by each connection's cache.
    pub cache_size: usize,
    pub journal_mode: JournalMode,
    pub synchronous: Synchronous,
    /// Milliseconds to wait on a lock before reporting `Busy`.
    pub busy_timeout: u64,
    /// WAL frames that trigger a checkpoint after commit; 0 disables.
    pub wal_autocheckpoint: u32,
    pub create_if_missing: bool,
    pub read_only: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: 2000,
            journal_mode: JournalMode::Delete,
            synchronous: Synchronous::Full,
            busy_timeout: 0,
            wal_autocheckpoint: 1000,
            create_if_missing: true,
            read_only: false,
        }
    }
}

impl DatabaseConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_cache_size(mut self, pages: usize) -> Self {
        self.cache_size = pages;
        self
    }

    pub fn with_journal_mode(mut self, mode: JournalMode) -> Self {
        self.journal_mode = mode;
        self
    }

    pub fn with_synchronous(mut self, synchronous: Synchronous) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn with_busy_timeout(mut self, millis: u64) -> Self {
        self.busy_timeout = millis;
        self
    }

    pub fn with_wal_autocheckpoint(mut self, frames: u32) -> Self {
        self.wal_autocheckpoint = frames;
        self
    }

    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn busy_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.busy_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_page_size(self.page_size) {
            return Err(DatabaseError::misuse(format!(
                "page size {} is not a power of two between 512 and 65536",
                self.page_size
            )));
        }
        if self.cache_size < 2 {
            return Err(DatabaseError::misuse("cache must hold at least 2 pages"));
        }
        Ok(())
    }
}
