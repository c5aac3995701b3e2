//! The pager: page reads and writes for one connection, transactions,
//! savepoints and the freelist, on top of the shared per-file state.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tracing::{debug, info, trace, warn};

use crate::{
    config::{DatabaseConfig, JournalMode, Synchronous},
    storage::{
        cache::{PageCache, PageRef},
        header::DatabaseHeader,
        journal::{Journal, rollback_hot_journal},
        shared::{LockLevel, SharedFile},
        wal::{CheckpointResult, Snapshot},
    },
    types::{
        HEADER_SIZE, MAX_PAGE_COUNT, PageId,
        error::{DatabaseError, Result},
        page::Node,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    None,
    Read,
    Write,
}

struct Savepoint {
    db_size: u32,
    pre_images: HashMap<PageId, PageRef>,
}

pub struct Pager {
    shared: Arc<SharedFile>,
    cache: PageCache,
    page_size: usize,
    usable_size: usize,
    synchronous: Synchronous,
    busy_timeout: Duration,
    wal_autocheckpoint: u32,
    read_only: bool,

    state: TransactionState,
    lock: LockLevel,
    snapshot: Option<Snapshot>,
    wal_writer: bool,
    db_size: u32,
    orig_db_size: u32,
    journal: Option<Journal>,
    header_bumped: bool,
    db_written: bool,
    seen_commit_seq: u64,
    savepoints: Vec<Savepoint>,
    generations: HashMap<PageId, u64>,
}

impl Pager {
    pub fn new(shared: Arc<SharedFile>, config: &DatabaseConfig) -> Self {
        let page_size = shared.page_size();
        Self {
            cache: PageCache::new(config.cache_size),
            page_size,
            usable_size: page_size,
            synchronous: config.synchronous,
            busy_timeout: config.busy_timeout_duration(),
            wal_autocheckpoint: config.wal_autocheckpoint,
            read_only: config.read_only,
            state: TransactionState::None,
            lock: LockLevel::None,
            snapshot: None,
            wal_writer: false,
            db_size: 0,
            orig_db_size: 0,
            journal: None,
            header_bumped: false,
            db_written: false,
            seen_commit_seq: shared.commit_seq(),
            savepoints: Vec::new(),
            generations: HashMap::new(),
            shared,
        }
    }

    pub fn shared(&self) -> &Arc<SharedFile> {
        &self.shared
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn usable_size(&self) -> usize {
        self.usable_size
    }

    pub fn db_size(&self) -> u32 {
        self.db_size
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn journal_mode(&self) -> JournalMode {
        self.shared.journal_mode()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_busy_timeout(&mut self, timeout: Duration) {
        self.busy_timeout = timeout;
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    // ---- transactions ----

    pub fn begin_read(&mut self) -> Result<()> {
        if self.state != TransactionState::None {
            return Ok(());
        }
        // The file size is only meaningful once the lock or snapshot is held;
        // a reader that waited on a committing writer must see its result.
        let (file_pages, seq) = match self.shared.wal() {
            Some(wal) => {
                let mut wal = wal.lock();
                let snapshot = wal.begin_read();
                self.snapshot = Some(snapshot);
                let file_pages = match self.file_pages() {
                    Ok(pages) => pages,
                    Err(e) => {
                        wal.end_read(snapshot);
                        self.snapshot = None;
                        return Err(e);
                    }
                };
                self.db_size = if snapshot.db_size != 0 {
                    snapshot.db_size
                } else {
                    file_pages
                };
                (file_pages, self.shared.commit_seq())
            }
            None => {
                self.shared.locks.lock_shared(self.busy_timeout)?;
                self.lock = LockLevel::Shared;
                let file_pages = match self.file_pages() {
                    Ok(pages) => pages,
                    Err(e) => {
                        self.shared.locks.unlock(LockLevel::Shared, LockLevel::None);
                        self.lock = LockLevel::None;
                        return Err(e);
                    }
                };
                self.db_size = file_pages;
                (file_pages, self.shared.commit_seq())
            }
        };
        if seq != self.seen_commit_seq {
            trace!(seq, "database changed since last transaction; clearing cache");
            self.cache.clear();
            self.seen_commit_seq = seq;
        }
        self.state = TransactionState::Read;

        let uses_file_size = self.snapshot.is_none_or(|s| s.db_size == 0);
        if uses_file_size && self.db_size > 0 {
            match self.header() {
                Ok(header) => self.db_size = header.effective_page_count(file_pages),
                Err(e) => {
                    self.end_transaction();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn file_pages(&self) -> Result<u32> {
        Ok((self.shared.db_file().size()? / self.page_size as u64) as u32)
    }

    /// Upgrades to a write transaction. On `Busy` the read transaction (if
    /// any) stays open.
    pub fn begin_write(&mut self) -> Result<()> {
        if self.read_only {
            return Err(DatabaseError::ReadOnly);
        }
        match self.state {
            TransactionState::Write => return Ok(()),
            TransactionState::None => self.begin_read()?,
            TransactionState::Read => {}
        }

        match self.shared.wal() {
            Some(wal) => {
                self.shared.locks.lock_wal_writer(self.busy_timeout)?;
                let current = self.snapshot.is_some_and(|s| wal.lock().is_current(s));
                if !current {
                    self.shared.locks.unlock_wal_writer();
                    debug!("read snapshot is stale; writer must restart");
                    return Err(DatabaseError::Busy);
                }
                self.wal_writer = true;
            }
            None => {
                self.shared.locks.lock_reserved(self.busy_timeout)?;
                self.lock = LockLevel::Reserved;
            }
        }

        self.state = TransactionState::Write;
        self.orig_db_size = self.db_size;
        self.header_bumped = false;
        self.db_written = false;
        debug!(db_size = self.db_size, "write transaction started");
        if self.db_size == 0 {
            self.initialize_database()?;
        }
        Ok(())
    }

    /// Writes page 1 of a brand new database: the header and an empty
    /// schema table. In WAL mode the page also goes straight to the main
    /// file, which must never be empty while the log holds frames.
    fn initialize_database(&mut self) -> Result<()> {
        let mut page = vec![0u8; self.page_size];
        let mut header = DatabaseHeader::new(self.page_size);
        let wal = self.journal_mode() == JournalMode::Wal;
        header.set_wal_mode(wal);
        header.write_to(&mut page[..HEADER_SIZE]);
        Node::new_leaf(true).encode(&mut page, HEADER_SIZE, self.usable_size)?;
        if wal {
            let db_file = self.shared.db_file();
            db_file.write_at(&page, 0)?;
            if self.synchronous != Synchronous::Off {
                db_file.sync()?;
            }
        }
        self.cache.insert(1, page, true)?;
        self.db_size = 1;
        info!(page_size = self.page_size, "initialized new database");
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        match self.state {
            TransactionState::None => Ok(()),
            TransactionState::Read => {
                self.end_transaction();
                Ok(())
            }
            TransactionState::Write => {
                if self.cache.dirty_count() == 0 && self.db_size == self.orig_db_size {
                    self.end_transaction();
                    return Ok(());
                }
                match self.journal_mode() {
                    JournalMode::Delete => {
                        self.commit_phase_one()?;
                        self.commit_phase_two()
                    }
                    JournalMode::Wal => self.commit_wal(),
                }
            }
        }
    }

    fn bump_header(&mut self) -> Result<()> {
        if self.header_bumped {
            return Ok(());
        }
        let mut header = self.header()?;
        header.file_change_counter = header.file_change_counter.wrapping_add(1);
        header.version_valid_for = header.file_change_counter;
        header.database_size_pages = self.db_size;
        header.set_wal_mode(self.journal_mode() == JournalMode::Wal);
        self.write_header(&header)?;
        self.header_bumped = true;
        Ok(())
    }

    /// Makes the journal durable and writes the transaction into the
    /// database file. After this returns a crash rolls back through the
    /// journal; only `commit_phase_two` makes the transaction permanent.
    pub fn commit_phase_one(&mut self) -> Result<()> {
        if self.state != TransactionState::Write || self.journal_mode() != JournalMode::Delete {
            return Err(DatabaseError::misuse(
                "commit phase one needs a rollback-journal write transaction",
            ));
        }
        self.bump_header()?;
        let sync = self.synchronous != Synchronous::Off;
        if let Some(journal) = self.journal.as_mut() {
            journal.seal(sync)?;
        }

        if self.lock < LockLevel::Exclusive {
            self.lock = LockLevel::Pending;
            self.shared.locks.lock_exclusive(self.busy_timeout)?;
            self.lock = LockLevel::Exclusive;
        }

        let dirty = self.cache.dirty_pages();
        self.db_written = true;
        let db_file = self.shared.db_file();
        for (page_id, data) in &dirty {
            db_file.write_at(data, (*page_id as u64 - 1) * self.page_size as u64)?;
        }
        let target = self.db_size as u64 * self.page_size as u64;
        if db_file.size()? > target {
            db_file.truncate(target)?;
        }
        if sync {
            db_file.sync()?;
        }
        debug!(pages = dirty.len(), db_size = self.db_size, "commit phase one complete");
        Ok(())
    }

    /// Deletes the journal, which is the commit point, and ends the
    /// transaction.
    pub fn commit_phase_two(&mut self) -> Result<()> {
        if !self.db_written {
            return Err(DatabaseError::misuse("commit phase two before phase one"));
        }
        if let Some(journal) = self.journal.take() {
            journal.delete(self.shared.vfs())?;
        }
        self.seen_commit_seq = self.shared.bump_commit_seq();
        self.cache.mark_all_clean();
        debug!(db_size = self.db_size, "transaction committed");
        self.end_transaction();
        Ok(())
    }

    fn commit_wal(&mut self) -> Result<()> {
        self.bump_header()?;
        let dirty = self.cache.dirty_pages();
        let sync = self.synchronous == Synchronous::Full;
        let frames = {
            let Some(wal) = self.shared.wal() else {
                return Err(DatabaseError::internal("log missing in WAL mode"));
            };
            let mut wal = wal.lock();
            wal.append_commit(&dirty, self.db_size, sync)?;
            self.seen_commit_seq = self.shared.bump_commit_seq();
            wal.max_frame()
        };
        self.cache.mark_all_clean();
        debug!(pages = dirty.len(), frames, "transaction committed to log");
        self.end_transaction();

        if self.wal_autocheckpoint > 0 && frames >= self.wal_autocheckpoint {
            if let Err(e) = self.checkpoint() {
                warn!(error = %e, "automatic checkpoint failed");
            }
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        let result = match self.state {
            TransactionState::Write => self.rollback_write(),
            _ => Ok(()),
        };
        self.end_transaction();
        result
    }

    fn rollback_write(&mut self) -> Result<()> {
        self.cache.discard_dirty();
        self.cache.truncate(self.orig_db_size);
        self.db_size = self.orig_db_size;
        let Some(journal) = self.journal.take() else {
            return Ok(());
        };
        if self.db_written {
            // The database file was partially overwritten; put it back.
            drop(journal);
            let sync = self.synchronous != Synchronous::Off;
            rollback_hot_journal(
                self.shared.vfs(),
                &self.shared.journal_path(),
                self.shared.db_file(),
                sync,
            )?;
            self.cache.clear();
            Ok(())
        } else {
            journal.delete(self.shared.vfs())
        }
    }

    fn end_transaction(&mut self) {
        if self.wal_writer {
            self.shared.locks.unlock_wal_writer();
            self.wal_writer = false;
        }
        if let Some(snapshot) = self.snapshot.take() {
            if let Some(wal) = self.shared.wal() {
                wal.lock().end_read(snapshot);
            }
        }
        if self.lock != LockLevel::None {
            self.shared.locks.unlock(self.lock, LockLevel::None);
            self.lock = LockLevel::None;
        }
        if self.state == TransactionState::Write {
            debug!("write transaction finished");
        }
        self.state = TransactionState::None;
        self.savepoints.clear();
        self.journal = None;
        self.header_bumped = false;
        self.db_written = false;
    }

    /// Copies the write-ahead log into the database file. A no-op in
    /// rollback-journal mode.
    pub fn checkpoint(&mut self) -> Result<CheckpointResult> {
        if self.state == TransactionState::Write {
            return Err(DatabaseError::misuse("cannot checkpoint inside a write transaction"));
        }
        let Some(wal) = self.shared.wal() else {
            return Ok(CheckpointResult {
                log_frames: 0,
                backfilled: 0,
                reset: false,
            });
        };
        let sync = self.synchronous != Synchronous::Off;
        let result = wal.lock().checkpoint(self.shared.db_file(), sync)?;
        Ok(result)
    }

    // ---- savepoints ----

    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.len()
    }

    /// Opens a savepoint and returns its depth index.
    pub fn open_savepoint(&mut self) -> Result<usize> {
        if self.state != TransactionState::Write {
            return Err(DatabaseError::misuse("savepoint outside a write transaction"));
        }
        self.savepoints.push(Savepoint {
            db_size: self.db_size,
            pre_images: HashMap::new(),
        });
        Ok(self.savepoints.len() - 1)
    }

    /// Forgets savepoint `depth` and every savepoint opened after it.
    pub fn release_savepoint(&mut self, depth: usize) {
        self.savepoints.truncate(depth);
    }

    /// Restores every page to its image when savepoint `depth` was opened.
    /// The savepoint itself stays open.
    pub fn rollback_to_savepoint(&mut self, depth: usize) -> Result<()> {
        if depth >= self.savepoints.len() {
            return Err(DatabaseError::misuse(format!("no savepoint at depth {depth}")));
        }
        let mut restore: HashMap<PageId, PageRef> = HashMap::new();
        for savepoint in self.savepoints.drain(depth..).rev() {
            // Older savepoints hold older images; they win.
            restore.extend(savepoint.pre_images);
            self.db_size = savepoint.db_size;
        }
        self.cache.truncate(self.db_size);
        for (page_id, image) in restore {
            if page_id <= self.db_size {
                self.cache.insert(page_id, image.as_ref().clone(), true)?;
            }
        }
        self.savepoints.push(Savepoint {
            db_size: self.db_size,
            pre_images: HashMap::new(),
        });
        self.header_bumped = false;
        for generation in self.generations.values_mut() {
            *generation += 1;
        }
        Ok(())
    }

    // ---- pages ----

    fn require_transaction(&self) -> Result<()> {
        if self.state == TransactionState::None {
            return Err(DatabaseError::misuse("page access outside a transaction"));
        }
        Ok(())
    }

    pub fn read_page(&mut self, page_id: PageId) -> Result<PageRef> {
        self.require_transaction()?;
        if page_id == 0 || page_id > self.db_size {
            return Err(DatabaseError::corrupt(
                page_id,
                format!("page {page_id} beyond end of database ({} pages)", self.db_size),
            ));
        }
        if let Some(page) = self.cache.get(page_id) {
            return Ok(page);
        }

        let mut buf = vec![0u8; self.page_size];
        let mut from_log = false;
        if let (Some(wal), Some(snapshot)) = (self.shared.wal(), self.snapshot) {
            let wal = wal.lock();
            if let Some(frame) = wal.find_frame(page_id, snapshot) {
                wal.read_frame(frame, &mut buf)?;
                from_log = true;
            }
        }
        if !from_log {
            self.shared
                .db_file()
                .read_exact_or_zero(&mut buf, (page_id as u64 - 1) * self.page_size as u64)?;
        }
        self.cache.insert(page_id, buf, false)
    }

    /// Mutable access to a page inside a write transaction. The first time a
    /// page is touched its original image goes to the journal and to every
    /// open savepoint.
    pub fn get_writable(&mut self, page_id: PageId) -> Result<&mut Vec<u8>> {
        if self.state != TransactionState::Write {
            return Err(DatabaseError::misuse("page write outside a write transaction"));
        }
        let current = self.read_page(page_id)?;

        if self.journal_mode() == JournalMode::Delete && page_id <= self.orig_db_size {
            if self.journal.is_none() {
                self.journal = Some(Journal::create(
                    self.shared.vfs(),
                    &self.shared.journal_path(),
                    self.page_size,
                    self.orig_db_size,
                )?);
            }
            if let Some(journal) = self.journal.as_mut() {
                if !journal.contains(page_id) && !self.cache.is_dirty(page_id) {
                    journal.append(page_id, &current)?;
                }
            }
        }
        for savepoint in &mut self.savepoints {
            if page_id <= savepoint.db_size {
                savepoint
                    .pre_images
                    .entry(page_id)
                    .or_insert_with(|| Arc::clone(&current));
            }
        }
        drop(current);

        self.cache
            .get_mut(page_id)
            .ok_or_else(|| DatabaseError::internal(format!("page {page_id} vanished from cache")))
    }

    pub fn header(&mut self) -> Result<DatabaseHeader> {
        let page = self.read_page(1)?;
        DatabaseHeader::from_bytes(&page[..HEADER_SIZE])
    }

    pub fn write_header(&mut self, header: &DatabaseHeader) -> Result<()> {
        let page = self.get_writable(1)?;
        header.write_to(&mut page[..HEADER_SIZE]);
        Ok(())
    }

    /// Takes a page from the freelist, or grows the file by one page.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        let mut header = self.header()?;
        let trunk = header.freelist_trunk_page;
        if trunk != 0 {
            if trunk > self.db_size {
                return Err(DatabaseError::corrupt(trunk, "freelist trunk beyond end of file"));
            }
            let data = self.read_page(trunk)?;
            let next = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            let count = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
            let max_leaves = self.usable_size / 4 - 2;
            if count > max_leaves {
                return Err(DatabaseError::corrupt(trunk, "freelist trunk overfull"));
            }
            drop(data);

            let page_id = if count > 0 {
                let at = 8 + 4 * (count - 1);
                let page = self.get_writable(trunk)?;
                let leaf = u32::from_be_bytes([page[at], page[at + 1], page[at + 2], page[at + 3]]);
                page[4..8].copy_from_slice(&((count - 1) as u32).to_be_bytes());
                if leaf < 2 || leaf > self.db_size {
                    return Err(DatabaseError::corrupt(trunk, format!("freelist leaf {leaf} out of range")));
                }
                leaf
            } else {
                header.freelist_trunk_page = next;
                trunk
            };
            header.freelist_pages_count = header.freelist_pages_count.saturating_sub(1);
            self.write_header(&header)?;
            self.get_writable(page_id)?.fill(0);
            trace!(page_id, "reused free page");
            return Ok(page_id);
        }

        if self.db_size >= MAX_PAGE_COUNT {
            return Err(DatabaseError::Full);
        }
        let page_id = self.db_size + 1;
        self.cache.insert(page_id, vec![0u8; self.page_size], true)?;
        self.db_size = page_id;
        trace!(page_id, "extended database");
        Ok(page_id)
    }

    /// Returns a page to the freelist.
    pub fn free_page(&mut self, page_id: PageId) -> Result<()> {
        if page_id < 2 || page_id > self.db_size {
            return Err(DatabaseError::corrupt(page_id, "freeing page out of range"));
        }
        let mut header = self.header()?;
        let trunk = header.freelist_trunk_page;
        let max_leaves = self.usable_size / 4 - 2;
        if trunk != 0 {
            let data = self.read_page(trunk)?;
            let count = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
            drop(data);
            if count < max_leaves {
                let page = self.get_writable(trunk)?;
                let at = 8 + 4 * count;
                page[at..at + 4].copy_from_slice(&page_id.to_be_bytes());
                page[4..8].copy_from_slice(&((count + 1) as u32).to_be_bytes());
                header.freelist_pages_count += 1;
                self.write_header(&header)?;
                return Ok(());
            }
        }

        let page = self.get_writable(page_id)?;
        page.fill(0);
        page[0..4].copy_from_slice(&trunk.to_be_bytes());
        header.freelist_trunk_page = page_id;
        header.freelist_pages_count += 1;
        self.write_header(&header)?;
        Ok(())
    }

    // ---- cursor generations ----

    pub fn tree_generation(&self, root: PageId) -> u64 {
        self.generations.get(&root).copied().unwrap_or(0)
    }

    /// Records a structural change to the tree rooted at `root`.
    pub fn bump_tree_generation(&mut self, root: PageId) -> u64 {
        let generation = self.generations.entry(root).or_insert(0);
        *generation += 1;
        *generation
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if self.state != TransactionState::None {
            if let Err(e) = self.rollback() {
                warn!(error = %e, "rollback on close failed");
            }
        }
    }
}
