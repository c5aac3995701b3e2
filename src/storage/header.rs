use crate::{
    storage::{DATABASE_MAGIC, LIBRARY_VERSION_NUMBER},
    types::{
        DEFAULT_PAGE_SIZE, HEADER_SIZE,
        error::{DatabaseError, Result},
        is_valid_page_size,
    },
};

/// The 100-byte header at the start of page 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub page_size: usize,
    pub file_format_write_version: u8,
    pub file_format_read_version: u8,
    pub reserved_space: u8,
    pub file_change_counter: u32,
    pub database_size_pages: u32,
    pub freelist_trunk_page: u32,
    pub freelist_pages_count: u32,
    pub schema_cookie: u32,
    pub schema_format_number: u32,
    pub default_page_cache_size: u32,
    pub largest_root_btree_page: u32,
    pub text_encoding: u32,
    pub user_version: u32,
    pub incremental_vacuum_mode: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
    pub library_version_number: u32,
}

impl Default for DatabaseHeader {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn write_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

impl DatabaseHeader {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            file_format_write_version: 1,
            file_format_read_version: 1,
            reserved_space: 0,
            file_change_counter: 1,
            database_size_pages: 1,
            freelist_trunk_page: 0,
            freelist_pages_count: 0,
            schema_cookie: 0,
            schema_format_number: 4,
            default_page_cache_size: 0,
            largest_root_btree_page: 0,
            text_encoding: 1,
            user_version: 0,
            incremental_vacuum_mode: 0,
            application_id: 0,
            version_valid_for: 1,
            library_version_number: LIBRARY_VERSION_NUMBER,
        }
    }

    pub fn usable_size(&self) -> usize {
        self.page_size - self.reserved_space as usize
    }

    /// Read and write versions are 2 while the database is in WAL mode.
    pub fn set_wal_mode(&mut self, wal: bool) {
        let version = if wal { 2 } else { 1 };
        self.file_format_write_version = version;
        self.file_format_read_version = version;
    }

    pub fn write_to(&self, buffer: &mut [u8]) {
        buffer[..16].copy_from_slice(DATABASE_MAGIC);
        // 65536 does not fit in two bytes and is written as 1.
        let stored_page_size: u16 = if self.page_size == 65536 {
            1
        } else {
            self.page_size as u16
        };
        buffer[16..18].copy_from_slice(&stored_page_size.to_be_bytes());
        buffer[18] = self.file_format_write_version;
        buffer[19] = self.file_format_read_version;
        buffer[20] = self.reserved_space;
        buffer[21] = 64;
        buffer[22] = 32;
        buffer[23] = 32;
        write_u32(buffer, 24, self.file_change_counter);
        write_u32(buffer, 28, self.database_size_pages);
        write_u32(buffer, 32, self.freelist_trunk_page);
        write_u32(buffer, 36, self.freelist_pages_count);
        write_u32(buffer, 40, self.schema_cookie);
        write_u32(buffer, 44, self.schema_format_number);
        write_u32(buffer, 48, self.default_page_cache_size);
        write_u32(buffer, 52, self.largest_root_btree_page);
        write_u32(buffer, 56, self.text_encoding);
        write_u32(buffer, 60, self.user_version);
        write_u32(buffer, 64, self.incremental_vacuum_mode);
        write_u32(buffer, 68, self.application_id);
        buffer[72..92].fill(0);
        write_u32(buffer, 92, self.version_valid_for);
        write_u32(buffer, 96, self.library_version_number);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; HEADER_SIZE];
        self.write_to(&mut buffer);
        buffer
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(DatabaseError::NotADatabase {
                reason: "header too short".to_string(),
            });
        }
        if &bytes[..16] != DATABASE_MAGIC {
            return Err(DatabaseError::NotADatabase {
                reason: "invalid magic string".to_string(),
            });
        }

        let raw_page_size = u16::from_be_bytes([bytes[16], bytes[17]]);
        let page_size = if raw_page_size == 1 {
            65536
        } else {
            raw_page_size as usize
        };
        if !is_valid_page_size(page_size) {
            return Err(DatabaseError::NotADatabase {
                reason: format!("unsupported page size: {}", page_size),
            });
        }

        let file_format_write_version = bytes[18];
        let file_format_read_version = bytes[19];
        if file_format_read_version > 2 {
            return Err(DatabaseError::NotADatabase {
                reason: format!("unsupported read version {}", file_format_read_version),
            });
        }
        let reserved_space = bytes[20];
        if page_size - (reserved_space as usize) < 480 {
            return Err(DatabaseError::NotADatabase {
                reason: "usable page size below 480 bytes".to_string(),
            });
        }

        let text_encoding = read_u32(bytes, 56);
        if text_encoding > 1 {
            return Err(DatabaseError::NotADatabase {
                reason: "only UTF-8 databases are supported".to_string(),
            });
        }

        Ok(Self {
            page_size,
            file_format_write_version,
            file_format_read_version,
            reserved_space,
            file_change_counter: read_u32(bytes, 24),
            database_size_pages: read_u32(bytes, 28),
            freelist_trunk_page: read_u32(bytes, 32),
            freelist_pages_count: read_u32(bytes, 36),
            schema_cookie: read_u32(bytes, 40),
            schema_format_number: read_u32(bytes, 44),
            default_page_cache_size: read_u32(bytes, 48),
            largest_root_btree_page: read_u32(bytes, 52),
            text_encoding,
            user_version: read_u32(bytes, 60),
            incremental_vacuum_mode: read_u32(bytes, 64),
            application_id: read_u32(bytes, 68),
            version_valid_for: read_u32(bytes, 92),
            library_version_number: read_u32(bytes, 96),
        })
    }

    /// The in-header page count is only trusted when the change counter it
    /// was written with is still current; otherwise the file size decides.
    pub fn effective_page_count(&self, file_pages: u32) -> u32 {
        if self.database_size_pages != 0 && self.version_valid_for == self.file_change_counter {
            self.database_size_pages
        } else {
            file_pages
        }
    }
}
