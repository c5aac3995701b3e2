pub mod btree;
pub mod cache;
pub mod cursor;
pub mod header;
pub mod journal;
pub mod pager;
pub mod schema;
pub mod shared;
pub mod vfs;
pub mod wal;

pub const DATABASE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
/// Library version written to the file header (3.45.0 encoding).
pub const LIBRARY_VERSION_NUMBER: u32 = 3_045_000;
