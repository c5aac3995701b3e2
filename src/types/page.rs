use serde::{Deserialize, Serialize};

use crate::types::{
    CELL_POINTER_SIZE, INTERIOR_HEADER_SIZE, LEAF_HEADER_SIZE, PageId, RowId,
    error::{DatabaseError, Result},
    varint::{read_varint, varint_len, write_varint},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageType {
    InteriorIndex = 2,
    InteriorTable = 5,
    LeafIndex = 10,
    LeafTable = 13,
}

impl PageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            2 => Some(PageType::InteriorIndex),
            5 => Some(PageType::InteriorTable),
            10 => Some(PageType::LeafIndex),
            13 => Some(PageType::LeafTable),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, PageType::LeafIndex | PageType::LeafTable)
    }

    pub fn is_table(&self) -> bool {
        matches!(self, PageType::InteriorTable | PageType::LeafTable)
    }

    pub fn header_size(&self) -> usize {
        if self.is_leaf() {
            LEAF_HEADER_SIZE
        } else {
            INTERIOR_HEADER_SIZE
        }
    }

    pub fn leaf_of(is_table: bool) -> Self {
        if is_table {
            PageType::LeafTable
        } else {
            PageType::LeafIndex
        }
    }

    pub fn interior_of(is_table: bool) -> Self {
        if is_table {
            PageType::InteriorTable
        } else {
            PageType::InteriorIndex
        }
    }
}

/// Largest payload a cell may hold without spilling to overflow pages.
pub fn max_local_payload(is_table: bool, usable_size: usize) -> usize {
    if is_table {
        usable_size - 35
    } else {
        ((usable_size - 12) * 64 / 255) - 23
    }
}

/// Cells are never shorter than a freeblock header on disk.
const MIN_CELL_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    TableLeaf { row_id: RowId, payload: Vec<u8> },
    TableInterior { left_child: PageId, row_id: RowId },
    IndexLeaf { payload: Vec<u8> },
    IndexInterior { left_child: PageId, payload: Vec<u8> },
}

impl Cell {
    pub fn row_id(&self) -> Option<RowId> {
        match self {
            Cell::TableLeaf { row_id, .. } | Cell::TableInterior { row_id, .. } => Some(*row_id),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Cell::TableLeaf { payload, .. }
            | Cell::IndexLeaf { payload }
            | Cell::IndexInterior { payload, .. } => Some(payload),
            Cell::TableInterior { .. } => None,
        }
    }

    pub fn left_child(&self) -> Option<PageId> {
        match self {
            Cell::TableInterior { left_child, .. } | Cell::IndexInterior { left_child, .. } => {
                Some(*left_child)
            }
            _ => None,
        }
    }

    pub fn set_left_child(&mut self, child: PageId) {
        match self {
            Cell::TableInterior { left_child, .. } | Cell::IndexInterior { left_child, .. } => {
                *left_child = child
            }
            _ => {}
        }
    }

    /// Turns an index entry into the form it takes in a node of the given kind.
    pub fn into_index_cell(self, leaf: bool, child: PageId) -> Cell {
        let payload = match self {
            Cell::IndexLeaf { payload } | Cell::IndexInterior { payload, .. } => payload,
            other => return other,
        };
        if leaf {
            Cell::IndexLeaf { payload }
        } else {
            Cell::IndexInterior {
                left_child: child,
                payload,
            }
        }
    }

    /// Bytes this cell occupies in the content area.
    pub fn size(&self) -> usize {
        let raw = match self {
            Cell::TableLeaf { row_id, payload } => {
                varint_len(payload.len() as u64) + varint_len(*row_id as u64) + payload.len()
            }
            Cell::TableInterior { row_id, .. } => 4 + varint_len(*row_id as u64),
            Cell::IndexLeaf { payload } => varint_len(payload.len() as u64) + payload.len(),
            Cell::IndexInterior { payload, .. } => {
                4 + varint_len(payload.len() as u64) + payload.len()
            }
        };
        raw.max(MIN_CELL_SIZE)
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Cell::TableLeaf { row_id, payload } => {
                write_varint(out, payload.len() as u64);
                write_varint(out, *row_id as u64);
                out.extend_from_slice(payload);
            }
            Cell::TableInterior { left_child, row_id } => {
                out.extend_from_slice(&left_child.to_be_bytes());
                write_varint(out, *row_id as u64);
            }
            Cell::IndexLeaf { payload } => {
                write_varint(out, payload.len() as u64);
                out.extend_from_slice(payload);
            }
            Cell::IndexInterior {
                left_child,
                payload,
            } => {
                out.extend_from_slice(&left_child.to_be_bytes());
                write_varint(out, payload.len() as u64);
                out.extend_from_slice(payload);
            }
        }
    }

    fn read(page_type: PageType, bytes: &[u8], usable_size: usize) -> Result<Cell> {
        let child_at = |bytes: &[u8]| -> Result<PageId> {
            let raw = bytes
                .get(..4)
                .ok_or_else(|| DatabaseError::corrupt(0, "cell extends past page end"))?;
            Ok(PageId::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
        };
        let payload_at = |bytes: &[u8], len: u64| -> Result<Vec<u8>> {
            if len as usize > max_local_payload(page_type.is_table(), usable_size) {
                return Err(DatabaseError::corrupt(0, "cell payload spills to overflow pages"));
            }
            bytes
                .get(..len as usize)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| DatabaseError::corrupt(0, "cell extends past page end"))
        };

        match page_type {
            PageType::LeafTable => {
                let (len, a) = read_varint(bytes)?;
                let (row_id, b) = read_varint(&bytes[a..])?;
                let payload = payload_at(&bytes[a + b..], len)?;
                Ok(Cell::TableLeaf {
                    row_id: row_id as RowId,
                    payload,
                })
            }
            PageType::InteriorTable => {
                let left_child = child_at(bytes)?;
                let (row_id, _) = read_varint(&bytes[4..])?;
                Ok(Cell::TableInterior {
                    left_child,
                    row_id: row_id as RowId,
                })
            }
            PageType::LeafIndex => {
                let (len, a) = read_varint(bytes)?;
                Ok(Cell::IndexLeaf {
                    payload: payload_at(&bytes[a..], len)?,
                })
            }
            PageType::InteriorIndex => {
                let left_child = child_at(bytes)?;
                let (len, a) = read_varint(&bytes[4..])?;
                Ok(Cell::IndexInterior {
                    left_child,
                    payload: payload_at(&bytes[4 + a..], len)?,
                })
            }
        }
    }
}

/*
 * B-tree page layout
 * ┌───────────────────────────────────────────────────────────────┐
 * │ [database header, 100 bytes, page 1 only]                     │
 * │ flag(1) | first freeblock(2) | cell count(2) |                │
 * │ content start(2) | fragmented bytes(1) | right child(4)*      │
 * ├───────────────────────────────────────────────────────────────┤
 * │ cell pointer array, 2 bytes per cell, big-endian, key order   │
 * ├───────────────────────────────────────────────────────────────┤
 * │ free space                                                    │
 * ├───────────────────────────────────────────────────────────────┤
 * │ cell content area, growing toward the start of the page       │
 * └───────────────────────────────────────────────────────────────┘
 *   * interior pages only
 */

/// Decoded view of a b-tree page.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub page_type: PageType,
    pub cells: Vec<Cell>,
    pub right_child: Option<PageId>,
}

impl Node {
    pub fn new_leaf(is_table: bool) -> Self {
        Self {
            page_type: PageType::leaf_of(is_table),
            cells: Vec::new(),
            right_child: None,
        }
    }

    pub fn new_interior(is_table: bool, right_child: PageId) -> Self {
        Self {
            page_type: PageType::interior_of(is_table),
            cells: Vec::new(),
            right_child: Some(right_child),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.page_type.is_leaf()
    }

    pub fn is_table(&self) -> bool {
        self.page_type.is_table()
    }

    /// Child page to the left of cell `index`, or the right child when
    /// `index == cells.len()`.
    pub fn child(&self, index: usize) -> Option<PageId> {
        if index < self.cells.len() {
            self.cells[index].left_child()
        } else {
            self.right_child
        }
    }

    pub fn set_child(&mut self, index: usize, child: PageId) {
        if index < self.cells.len() {
            self.cells[index].set_left_child(child);
        } else {
            self.right_child = Some(child);
        }
    }

    pub fn child_count(&self) -> usize {
        if self.is_leaf() { 0 } else { self.cells.len() + 1 }
    }

    /// Bytes needed to store the cells of this node, excluding the page header.
    pub fn content_size(&self) -> usize {
        self.cells
            .iter()
            .map(|c| c.size() + CELL_POINTER_SIZE)
            .sum()
    }

    pub fn encoded_size(&self, header_offset: usize) -> usize {
        header_offset + self.page_type.header_size() + self.content_size()
    }

    pub fn fits(&self, header_offset: usize, usable_size: usize) -> bool {
        self.encoded_size(header_offset) <= usable_size
    }

    pub fn decode(page: &[u8], header_offset: usize, usable_size: usize) -> Result<Self> {
        let h = header_offset;
        if page.len() < h + LEAF_HEADER_SIZE {
            return Err(DatabaseError::corrupt(0, "page shorter than b-tree header"));
        }
        let page_type = PageType::from_u8(page[h]).ok_or_else(|| {
            DatabaseError::corrupt(0, format!("invalid b-tree page type {}", page[h]))
        })?;
        let cell_count = u16::from_be_bytes([page[h + 3], page[h + 4]]) as usize;
        let right_child = if page_type.is_leaf() {
            None
        } else {
            Some(PageId::from_be_bytes([
                page[h + 8],
                page[h + 9],
                page[h + 10],
                page[h + 11],
            ]))
        };

        let pointers_start = h + page_type.header_size();
        if pointers_start + cell_count * CELL_POINTER_SIZE > usable_size {
            return Err(DatabaseError::corrupt(0, "cell pointer array exceeds page"));
        }
        let mut cells = Vec::with_capacity(cell_count);
        for i in 0..cell_count {
            let at = pointers_start + i * CELL_POINTER_SIZE;
            let offset = u16::from_be_bytes([page[at], page[at + 1]]) as usize;
            if offset < pointers_start + cell_count * CELL_POINTER_SIZE || offset >= usable_size {
                return Err(DatabaseError::corrupt(
                    0,
                    format!("cell pointer {offset} outside content area"),
                ));
            }
            cells.push(Cell::read(page_type, &page[offset..usable_size], usable_size)?);
        }
        Ok(Self {
            page_type,
            cells,
            right_child,
        })
    }

    /// Writes the node into `page`, packing cells at the end of the usable
    /// area. Bytes before `header_offset` are left untouched.
    pub fn encode(&self, page: &mut [u8], header_offset: usize, usable_size: usize) -> Result<()> {
        let needed = self.encoded_size(header_offset);
        if needed > usable_size {
            return Err(DatabaseError::internal(format!(
                "node needs {needed} bytes but page holds {usable_size}"
            )));
        }
        let h = header_offset;
        page[h..usable_size].fill(0);
        page[h] = self.page_type.as_u8();

        let pointers_start = h + self.page_type.header_size();
        let mut content_start = usable_size;
        let mut scratch = Vec::new();
        for (i, cell) in self.cells.iter().enumerate() {
            scratch.clear();
            cell.write(&mut scratch);
            content_start -= cell.size();
            page[content_start..content_start + scratch.len()].copy_from_slice(&scratch);
            let at = pointers_start + i * CELL_POINTER_SIZE;
            page[at..at + 2].copy_from_slice(&(content_start as u16).to_be_bytes());
        }

        page[h + 3..h + 5].copy_from_slice(&(self.cells.len() as u16).to_be_bytes());
        // A content start of 65536 is stored as zero.
        let stored_start = if content_start == 65536 { 0 } else { content_start as u16 };
        page[h + 5..h + 7].copy_from_slice(&stored_start.to_be_bytes());
        if let Some(right) = self.right_child {
            page[h + 8..h + 12].copy_from_slice(&right.to_be_bytes());
        }
        Ok(())
    }
}
