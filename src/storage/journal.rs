//! Rollback journal: original page images recorded before a write
//! transaction touches the database file.
//!
//! Layout: a 512-byte header `[magic 8][record count 4][nonce 4]
//! [initial page count 4][sector size 4][page size 4]`, then records of
//! `[page number 4][page image][checksum 4]`. All integers are big-endian.
//! The checksum is the nonce plus every 200th byte of the image, the same
//! sum other readers of the format verify before playing a record back.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::{
    storage::vfs::{Vfs, VfsFile},
    types::{
        PageId,
        error::{DatabaseError, Result},
        is_valid_page_size,
    },
    utils::hash::{journal_checksum, random_u32},
};

pub const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];
pub const JOURNAL_HEADER_SIZE: usize = 512;
const SECTOR_SIZE: u32 = 512;

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

pub struct Journal {
    path: PathBuf,
    file: Arc<dyn VfsFile>,
    page_size: usize,
    nonce: u32,
    initial_size: u32,
    record_count: u32,
    journaled: HashSet<PageId>,
}

impl Journal {
    /// Creates (or truncates) the journal and writes a header whose record
    /// count is still zero.
    pub fn create(vfs: &dyn Vfs, path: &Path, page_size: usize, initial_size: u32) -> Result<Self> {
        let file = vfs.open(path, true)?;
        file.truncate(0)?;
        let journal = Self {
            path: path.to_path_buf(),
            file,
            page_size,
            nonce: random_u32(),
            initial_size,
            record_count: 0,
            journaled: HashSet::new(),
        };
        journal.write_header(0)?;
        debug!(path = %path.display(), initial_size, "journal opened");
        Ok(journal)
    }

    fn write_header(&self, record_count: u32) -> Result<()> {
        let mut header = vec![0u8; JOURNAL_HEADER_SIZE];
        header[..8].copy_from_slice(&JOURNAL_MAGIC);
        header[8..12].copy_from_slice(&record_count.to_be_bytes());
        header[12..16].copy_from_slice(&self.nonce.to_be_bytes());
        header[16..20].copy_from_slice(&self.initial_size.to_be_bytes());
        header[20..24].copy_from_slice(&SECTOR_SIZE.to_be_bytes());
        header[24..28].copy_from_slice(&(self.page_size as u32).to_be_bytes());
        self.file.write_at(&header, 0)?;
        Ok(())
    }

    fn record_size(&self) -> usize {
        4 + self.page_size + 4
    }

    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.journaled.contains(&page_id)
    }

    /// Appends the original image of `page_id`.
    pub fn append(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        if self.journaled.contains(&page_id) {
            return Ok(());
        }
        let mut record = Vec::with_capacity(self.record_size());
        record.extend_from_slice(&page_id.to_be_bytes());
        record.extend_from_slice(data);
        record.extend_from_slice(&journal_checksum(self.nonce, data).to_be_bytes());
        let offset = JOURNAL_HEADER_SIZE as u64 + self.record_count as u64 * self.record_size() as u64;
        self.file.write_at(&record, offset)?;
        self.record_count += 1;
        self.journaled.insert(page_id);
        Ok(())
    }

    /// Makes the journal durable: records first, then the record count that
    /// turns them into a hot journal.
    pub fn seal(&mut self, sync: bool) -> Result<()> {
        if sync {
            self.file.sync()?;
        }
        self.write_header(self.record_count)?;
        if sync {
            self.file.sync()?;
        }
        Ok(())
    }

    /// Deleting the journal is the commit point for rollback-journal mode.
    pub fn delete(self, vfs: &dyn Vfs) -> Result<()> {
        let Journal { path, file, .. } = self;
        drop(file);
        vfs.delete(&path)?;
        Ok(())
    }
}

/// Rolls back a journal left behind by a crashed writer. Returns true when
/// pages were restored. The journal is deleted in every case.
pub fn rollback_hot_journal(
    vfs: &dyn Vfs,
    journal_path: &Path,
    db_file: &dyn VfsFile,
    sync: bool,
) -> Result<bool> {
    if !vfs.exists(journal_path) {
        return Ok(false);
    }
    let file = vfs.open(journal_path, false)?;
    let mut header = vec![0u8; JOURNAL_HEADER_SIZE];
    let read = file.read_at(&mut header, 0)?;
    if read < 28 || header[..8] != JOURNAL_MAGIC {
        warn!(path = %journal_path.display(), "discarding journal with invalid header");
        drop(file);
        vfs.delete(journal_path)?;
        return Ok(false);
    }

    let record_count = read_u32(&header, 8);
    let nonce = read_u32(&header, 12);
    let initial_size = read_u32(&header, 16);
    let page_size = read_u32(&header, 24) as usize;
    if record_count == 0 {
        debug!(path = %journal_path.display(), "discarding unsealed journal");
        drop(file);
        vfs.delete(journal_path)?;
        return Ok(false);
    }
    if !is_valid_page_size(page_size) {
        return Err(DatabaseError::corrupt(0, "hot journal has invalid page size"));
    }

    let record_size = 4 + page_size + 4;
    let mut record = vec![0u8; record_size];
    let mut restored = 0u32;
    for i in 0..record_count {
        let offset = JOURNAL_HEADER_SIZE as u64 + i as u64 * record_size as u64;
        if file.read_at(&mut record, offset)? < record_size {
            break;
        }
        let page_id = read_u32(&record, 0);
        let data = &record[4..4 + page_size];
        let checksum = read_u32(&record, 4 + page_size);
        if page_id == 0 || journal_checksum(nonce, data) != checksum {
            warn!(record = i, "journal record failed its checksum; stopping playback");
            break;
        }
        db_file.write_at(data, (page_id as u64 - 1) * page_size as u64)?;
        restored += 1;
    }
    db_file.truncate(initial_size as u64 * page_size as u64)?;
    if sync {
        db_file.sync()?;
    }
    drop(file);
    vfs.delete(journal_path)?;
    info!(
        path = %journal_path.display(),
        restored, initial_size, "rolled back hot journal"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::vfs::OsVfs;

    #[test]
    fn test_hot_journal_restores_original_pages() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("a.db");
        let journal_path = dir.path().join("a.db-journal");
        let db = OsVfs.open(&db_path, true).unwrap();
        db.write_at(&vec![1u8; 512], 0).unwrap();

        let mut journal = Journal::create(&OsVfs, &journal_path, 512, 1).unwrap();
        journal.append(1, &vec![1u8; 512]).unwrap();
        journal.seal(false).unwrap();

        // The crashed transaction overwrote page 1 and grew the file.
        db.write_at(&vec![2u8; 1024], 0).unwrap();
        assert!(rollback_hot_journal(&OsVfs, &journal_path, db.as_ref(), false).unwrap());

        let mut page = vec![0u8; 512];
        db.read_at(&mut page, 0).unwrap();
        assert!(page.iter().all(|b| *b == 1));
        assert_eq!(db.size().unwrap(), 512);
        assert!(!journal_path.exists());
    }

    #[test]
    fn test_unsealed_journal_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("b.db");
        let journal_path = dir.path().join("b.db-journal");
        let db = OsVfs.open(&db_path, true).unwrap();
        db.write_at(&vec![3u8; 512], 0).unwrap();

        let mut journal = Journal::create(&OsVfs, &journal_path, 512, 1).unwrap();
        journal.append(1, &vec![9u8; 512]).unwrap();
        drop(journal);

        assert!(!rollback_hot_journal(&OsVfs, &journal_path, db.as_ref(), false).unwrap());
        let mut page = vec![0u8; 512];
        db.read_at(&mut page, 0).unwrap();
        assert!(page.iter().all(|b| *b == 3));
    }

    #[test]
    fn test_sealed_journal_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.db-journal");
        let image: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut journal = Journal::create(&OsVfs, &path, 1024, 3).unwrap();
        journal.append(2, &image).unwrap();
        journal.seal(false).unwrap();
        let nonce = journal.nonce;
        drop(journal);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), JOURNAL_HEADER_SIZE + 4 + 1024 + 4);
        assert_eq!(bytes[..8], JOURNAL_MAGIC);
        assert_eq!(read_u32(&bytes, 8), 1);
        assert_eq!(read_u32(&bytes, 12), nonce);
        assert_eq!(read_u32(&bytes, 16), 3);
        assert_eq!(read_u32(&bytes, 20), 512);
        assert_eq!(read_u32(&bytes, 24), 1024);

        let record = &bytes[JOURNAL_HEADER_SIZE..];
        assert_eq!(read_u32(record, 0), 2);
        assert_eq!(&record[4..1028], &image[..]);
        let expected = [824, 624, 424, 224, 24]
            .iter()
            .fold(nonce, |sum, &at| sum.wrapping_add(image[at] as u32));
        assert_eq!(read_u32(record, 1028), expected);
    }

    #[test]
    fn test_duplicate_append_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal =
            Journal::create(&OsVfs, &dir.path().join("c-journal"), 512, 4).unwrap();
        journal.append(2, &vec![0u8; 512]).unwrap();
        journal.append(2, &vec![5u8; 512]).unwrap();
        assert_eq!(journal.record_count(), 1);
        assert!(journal.contains(2));
    }
}
