//! Write-ahead log: committed page images appended to `<db>-wal` and an
//! in-memory index of the newest frame for every page.
//!
//! Header (32 bytes, big-endian): magic, format version, page size,
//! checkpoint sequence, salt-1, salt-2, checksum-1, checksum-2.
//! Frame header (24 bytes): page number, database size in pages for the
//! last frame of a commit (else 0), salt-1, salt-2, checksum-1, checksum-2.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::{
    storage::{
        cache::PageRef,
        vfs::{Vfs, VfsFile},
    },
    types::{PageId, error::Result},
    utils::hash::{random_u32, wal_checksum},
};

pub const WAL_MAGIC: u32 = 0x377f_0682;
const WAL_MAGIC_BIG_ENDIAN: u32 = 0x377f_0683;
pub const WAL_FORMAT_VERSION: u32 = 3_007_000;
pub const WAL_HEADER_SIZE: usize = 32;
pub const WAL_FRAME_HEADER_SIZE: usize = 24;

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// A reader's view of the log: frames up to `max_frame` are visible.
/// `db_size` is 0 when no commit is in the log and the database file decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub max_frame: u32,
    pub db_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointResult {
    /// Frames in the log when the checkpoint ran.
    pub log_frames: u32,
    /// Frames now copied into the database file.
    pub backfilled: u32,
    /// Whether the log was emptied afterwards.
    pub reset: bool,
}

pub struct Wal {
    path: PathBuf,
    file: Arc<dyn VfsFile>,
    page_size: usize,
    big_endian: bool,
    checkpoint_seq: u32,
    salt: [u32; 2],
    header_written: bool,
    last_checksum: (u32, u32),
    frames: HashMap<PageId, Vec<u32>>,
    commits: BTreeMap<u32, u32>,
    max_frame: u32,
    backfilled: u32,
    readers: BTreeMap<u32, usize>,
}

impl Wal {
    /// Opens the log and rebuilds the frame index from the frames that
    /// belong to fully committed transactions.
    pub fn open(vfs: &dyn Vfs, path: &Path, page_size: usize) -> Result<Self> {
        let file = vfs.open(path, true)?;
        let mut wal = Self {
            path: path.to_path_buf(),
            file,
            page_size,
            big_endian: false,
            checkpoint_seq: 0,
            salt: [random_u32(), random_u32()],
            header_written: false,
            last_checksum: (0, 0),
            frames: HashMap::new(),
            commits: BTreeMap::new(),
            max_frame: 0,
            backfilled: 0,
            readers: BTreeMap::new(),
        };
        wal.recover()?;
        Ok(wal)
    }

    fn frame_size(&self) -> usize {
        WAL_FRAME_HEADER_SIZE + self.page_size
    }

    fn frame_offset(&self, frame: u32) -> u64 {
        WAL_HEADER_SIZE as u64 + (frame as u64 - 1) * self.frame_size() as u64
    }

    fn recover(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        if self.file.read_at(&mut header, 0)? < WAL_HEADER_SIZE {
            return Ok(());
        }
        let magic = read_u32(&header, 0);
        if magic != WAL_MAGIC && magic != WAL_MAGIC_BIG_ENDIAN {
            warn!(path = %self.path.display(), "ignoring log with invalid magic");
            return Ok(());
        }
        let big_endian = magic == WAL_MAGIC_BIG_ENDIAN;
        let checksum = wal_checksum(&header[..24], (0, 0), big_endian);
        if read_u32(&header, 4) != WAL_FORMAT_VERSION
            || read_u32(&header, 8) as usize != self.page_size
            || checksum != (read_u32(&header, 24), read_u32(&header, 28))
        {
            warn!(path = %self.path.display(), "ignoring log with invalid header");
            return Ok(());
        }

        self.big_endian = big_endian;
        self.checkpoint_seq = read_u32(&header, 12);
        self.salt = [read_u32(&header, 16), read_u32(&header, 20)];
        self.header_written = true;
        self.last_checksum = checksum;

        let mut running = checksum;
        let mut pending: Vec<(PageId, u32)> = Vec::new();
        let mut frame_buf = vec![0u8; self.frame_size()];
        let mut frame = 1u32;
        loop {
            if self.file.read_at(&mut frame_buf, self.frame_offset(frame))? < frame_buf.len() {
                break;
            }
            let page_id = read_u32(&frame_buf, 0);
            let commit_size = read_u32(&frame_buf, 4);
            if page_id == 0
                || read_u32(&frame_buf, 8) != self.salt[0]
                || read_u32(&frame_buf, 12) != self.salt[1]
            {
                break;
            }
            running = wal_checksum(&frame_buf[..8], running, self.big_endian);
            running = wal_checksum(&frame_buf[WAL_FRAME_HEADER_SIZE..], running, self.big_endian);
            if running != (read_u32(&frame_buf, 16), read_u32(&frame_buf, 20)) {
                break;
            }
            pending.push((page_id, frame));
            if commit_size != 0 {
                for (page_id, f) in pending.drain(..) {
                    self.frames.entry(page_id).or_default().push(f);
                }
                self.commits.insert(frame, commit_size);
                self.max_frame = frame;
                self.last_checksum = running;
            }
            frame += 1;
        }
        if self.max_frame > 0 {
            info!(
                path = %self.path.display(),
                frames = self.max_frame,
                dropped = pending.len(),
                "recovered write-ahead log"
            );
        }
        Ok(())
    }

    pub fn max_frame(&self) -> u32 {
        self.max_frame
    }

    pub fn backfilled(&self) -> u32 {
        self.backfilled
    }

    pub fn reader_count(&self) -> usize {
        self.readers.values().sum()
    }

    pub fn current_snapshot(&self) -> Snapshot {
        Snapshot {
            max_frame: self.max_frame,
            db_size: self.commits.get(&self.max_frame).copied().unwrap_or(0),
        }
    }

    /// Takes and registers a snapshot of the newest commit.
    pub fn begin_read(&mut self) -> Snapshot {
        let snapshot = self.current_snapshot();
        *self.readers.entry(snapshot.max_frame).or_default() += 1;
        snapshot
    }

    pub fn end_read(&mut self, snapshot: Snapshot) {
        if let Some(count) = self.readers.get_mut(&snapshot.max_frame) {
            *count -= 1;
            if *count == 0 {
                self.readers.remove(&snapshot.max_frame);
            }
        }
    }

    pub fn is_current(&self, snapshot: Snapshot) -> bool {
        snapshot.max_frame == self.max_frame
    }

    /// Newest frame holding `page_id` that is visible in `snapshot`.
    pub fn find_frame(&self, page_id: PageId, snapshot: Snapshot) -> Option<u32> {
        self.frames
            .get(&page_id)?
            .iter()
            .rev()
            .find(|f| **f <= snapshot.max_frame)
            .copied()
    }

    pub fn read_frame(&self, frame: u32, buf: &mut [u8]) -> Result<()> {
        let offset = self.frame_offset(frame) + WAL_FRAME_HEADER_SIZE as u64;
        self.file.read_exact_or_zero(&mut buf[..self.page_size], offset)?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        let magic = if self.big_endian {
            WAL_MAGIC_BIG_ENDIAN
        } else {
            WAL_MAGIC
        };
        header[0..4].copy_from_slice(&magic.to_be_bytes());
        header[4..8].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
        header[8..12].copy_from_slice(&(self.page_size as u32).to_be_bytes());
        header[12..16].copy_from_slice(&self.checkpoint_seq.to_be_bytes());
        header[16..20].copy_from_slice(&self.salt[0].to_be_bytes());
        header[20..24].copy_from_slice(&self.salt[1].to_be_bytes());
        let checksum = wal_checksum(&header[..24], (0, 0), self.big_endian);
        header[24..28].copy_from_slice(&checksum.0.to_be_bytes());
        header[28..32].copy_from_slice(&checksum.1.to_be_bytes());
        self.file.write_at(&header, 0)?;
        self.last_checksum = checksum;
        self.header_written = true;
        Ok(())
    }

    /// Appends one transaction. The last frame carries `db_size` and is the
    /// commit record; the index only learns about the frames once every one
    /// of them is written.
    pub fn append_commit(&mut self, pages: &[(PageId, PageRef)], db_size: u32, sync: bool) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        if !self.header_written {
            self.write_header()?;
        }

        let mut running = self.last_checksum;
        let mut buffer = Vec::with_capacity(pages.len() * self.frame_size());
        for (i, (page_id, data)) in pages.iter().enumerate() {
            let commit_size = if i + 1 == pages.len() { db_size } else { 0 };
            let mut frame_header = [0u8; WAL_FRAME_HEADER_SIZE];
            frame_header[0..4].copy_from_slice(&page_id.to_be_bytes());
            frame_header[4..8].copy_from_slice(&commit_size.to_be_bytes());
            frame_header[8..12].copy_from_slice(&self.salt[0].to_be_bytes());
            frame_header[12..16].copy_from_slice(&self.salt[1].to_be_bytes());
            running = wal_checksum(&frame_header[..8], running, self.big_endian);
            running = wal_checksum(&data[..self.page_size], running, self.big_endian);
            frame_header[16..20].copy_from_slice(&running.0.to_be_bytes());
            frame_header[20..24].copy_from_slice(&running.1.to_be_bytes());
            buffer.extend_from_slice(&frame_header);
            buffer.extend_from_slice(&data[..self.page_size]);
        }
        let first = self.max_frame + 1;
        self.file.write_at(&buffer, self.frame_offset(first))?;
        if sync {
            self.file.sync()?;
        }

        for (i, (page_id, _)) in pages.iter().enumerate() {
            self.frames.entry(*page_id).or_default().push(first + i as u32);
        }
        self.max_frame = first + pages.len() as u32 - 1;
        self.commits.insert(self.max_frame, db_size);
        self.last_checksum = running;
        debug!(frames = pages.len(), max_frame = self.max_frame, db_size, "appended commit to log");
        Ok(())
    }

    /// Copies committed frames into the database file, never past the
    /// oldest snapshot still in use, and empties the log once everything is
    /// copied and nobody is reading it.
    pub fn checkpoint(&mut self, db_file: &dyn VfsFile, sync: bool) -> Result<CheckpointResult> {
        let oldest_reader = self.readers.keys().next().copied();
        let limit = oldest_reader.map_or(self.max_frame, |r| r.min(self.max_frame));

        if limit > self.backfilled {
            if sync {
                self.file.sync()?;
            }
            let mut pages: Vec<(&PageId, &Vec<u32>)> = self.frames.iter().collect();
            pages.sort_by_key(|(id, _)| **id);
            let mut buf = vec![0u8; self.page_size];
            for (page_id, frames) in pages {
                let Some(&frame) = frames.iter().rev().find(|f| **f <= limit) else {
                    continue;
                };
                if frame <= self.backfilled {
                    continue;
                }
                self.read_frame(frame, &mut buf)?;
                db_file.write_at(&buf, (*page_id as u64 - 1) * self.page_size as u64)?;
            }
            if let Some((_, &db_size)) = self.commits.range(..=limit).next_back() {
                db_file.truncate(db_size as u64 * self.page_size as u64)?;
            }
            if sync {
                db_file.sync()?;
            }
            self.backfilled = limit;
        }

        let log_frames = self.max_frame;
        let reset = self.max_frame > 0 && self.backfilled == self.max_frame && self.readers.is_empty();
        if reset {
            self.restart()?;
        }
        info!(log_frames, backfilled = self.backfilled, reset, "checkpoint complete");
        Ok(CheckpointResult {
            log_frames,
            backfilled: if reset { log_frames } else { self.backfilled },
            reset,
        })
    }

    /// Starts a new log generation. New salts make any old frames left in the
    /// file fail validation.
    fn restart(&mut self) -> Result<()> {
        self.checkpoint_seq = self.checkpoint_seq.wrapping_add(1);
        self.salt = [self.salt[0].wrapping_add(1), random_u32()];
        self.frames.clear();
        self.commits.clear();
        self.max_frame = 0;
        self.backfilled = 0;
        self.file.truncate(0)?;
        self.header_written = false;
        self.last_checksum = (0, 0);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
