pub mod error;
pub mod page;
pub mod record;
pub mod row;
pub mod value;
pub mod varint;

// Common type aliases
pub type PageId = u32;
pub type RowId = i64;

// Constants following the SQLite file format
pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 65536;
pub const MAX_PAGE_COUNT: u32 = 4_294_967_294;
pub const HEADER_SIZE: usize = 100; // Database header size on page 1

pub const LEAF_HEADER_SIZE: usize = 8;
pub const INTERIOR_HEADER_SIZE: usize = 12;
pub const CELL_POINTER_SIZE: usize = 2;

/// Returns true for page sizes the file format can express.
pub fn is_valid_page_size(page_size: usize) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) && page_size.is_power_of_two()
}
