//! File system capabilities injected into the pager.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

/// A file opened through a [`Vfs`]. All methods take `&self` so one handle
/// can be shared by every connection to the same database.
pub trait VfsFile: Send + Sync {
    /// Reads into `buf` at `offset`, returning the number of bytes read.
    /// Fewer bytes than requested means the file ended.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;
    fn truncate(&self, size: u64) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
    fn size(&self) -> io::Result<u64>;

    /// Like `read_at`, but zero-fills whatever lies past the end of file.
    fn read_exact_or_zero(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let read = self.read_at(buf, offset)?;
        buf[read..].fill(0);
        Ok(read)
    }
}

pub trait Vfs: Send + Sync {
    fn open(&self, path: &Path, create: bool) -> io::Result<Arc<dyn VfsFile>>;
    fn delete(&self, path: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
}

/// Operating system files.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsVfs;

impl Vfs for OsVfs {
    fn open(&self, path: &Path, create: bool) -> io::Result<Arc<dyn VfsFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)?;
        Ok(Arc::new(OsFile {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        }))
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

pub struct OsFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl std::fmt::Debug for OsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsFile").field("path", &self.path).finish()
    }
}

impl VfsFile for OsFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.file.lock().set_len(size)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.lock().sync_all()
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }
}

/// Path of a sidecar file such as `<db>-wal` or `<db>-journal`.
pub fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
