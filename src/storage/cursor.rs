//! Positioned iteration over a single B-tree.
//!
//! A cursor keeps the root-to-leaf path it is resting on. Any structural
//! change to the tree bumps the tree's generation in the pager; a cursor
//! whose generation is stale refuses to move unless the change was its own,
//! in which case it re-seeks to the key it remembered.

use std::cmp::Ordering;

use crate::{
    storage::{
        btree::{self, MAX_DEPTH, PathFrame, SearchKey, TreeKind, compare_cell, load_node, search_node},
        pager::Pager,
    },
    types::{
        PageId, RowId,
        error::{DatabaseError, Result},
        page::Cell,
        record,
        value::Value,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOp {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

#[derive(Debug, Clone, PartialEq)]
enum SavedKey {
    RowId(RowId),
    Index(Vec<Value>),
}

impl SavedKey {
    fn as_search(&self) -> SearchKey<'_> {
        match self {
            SavedKey::RowId(row_id) => SearchKey::RowId(*row_id),
            SavedKey::Index(key) => SearchKey::Index(key),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CursorState {
    Unpositioned,
    Valid,
    AtEnd,
    RequireSeek { key: SavedKey, deleted: bool },
}

#[derive(Debug)]
pub struct Cursor {
    root: PageId,
    kind: TreeKind,
    stack: Vec<PathFrame>,
    state: CursorState,
    generation: u64,
}

impl Cursor {
    pub fn new(root: PageId, kind: TreeKind) -> Self {
        Self {
            root,
            kind,
            stack: Vec::new(),
            state: CursorState::Unpositioned,
            generation: 0,
        }
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    /// True when the cursor rests on an entry.
    pub fn is_valid(&self) -> bool {
        self.state == CursorState::Valid
    }

    fn reset(&mut self, pager: &Pager) {
        self.stack.clear();
        self.generation = pager.tree_generation(self.root);
        self.state = CursorState::Unpositioned;
    }

    fn check_generation(&self, pager: &Pager) -> Result<()> {
        if self.generation != pager.tree_generation(self.root) {
            return Err(DatabaseError::CursorInvalidated { root: self.root });
        }
        Ok(())
    }

    fn push(&mut self, pager: &mut Pager, page_id: PageId, index_of: impl Fn(&PathFrame) -> usize) -> Result<()> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(DatabaseError::corrupt(page_id, "tree too deep"));
        }
        let node = load_node(pager, page_id, self.kind)?;
        let mut frame = PathFrame {
            page_id,
            node,
            index: 0,
            dirty: false,
        };
        frame.index = index_of(&frame);
        self.stack.push(frame);
        Ok(())
    }

    fn top(&self) -> Result<&PathFrame> {
        self.stack
            .last()
            .ok_or_else(|| DatabaseError::misuse("cursor is not positioned"))
    }

    fn child_at_top(&self) -> Result<PageId> {
        let top = self.top()?;
        top.node
            .child(top.index)
            .ok_or_else(|| DatabaseError::corrupt(top.page_id, "interior page without child"))
    }

    /// Descends from the current top frame's selected child to the leftmost leaf.
    fn descend_leftmost(&mut self, pager: &mut Pager) -> Result<()> {
        loop {
            let top = self.top()?;
            if top.node.is_leaf() {
                return Ok(());
            }
            let child = self.child_at_top()?;
            self.push(pager, child, |_| 0)?;
        }
    }

    fn descend_rightmost(&mut self, pager: &mut Pager) -> Result<()> {
        loop {
            let top = self.top()?;
            if top.node.is_leaf() {
                let frame = self.stack.last_mut().ok_or_else(|| DatabaseError::internal("empty stack"))?;
                frame.index = frame.node.cells.len().saturating_sub(1);
                return Ok(());
            }
            let child = self.child_at_top()?;
            self.push(pager, child, |f| f.node.child_count().saturating_sub(1))?;
        }
    }

    /// Moves up from an exhausted leaf position to the next entry in order.
    fn normalize_forward(&mut self, pager: &mut Pager) -> Result<bool> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                self.state = CursorState::AtEnd;
                return Ok(false);
            };
            if top.node.is_leaf() {
                if top.index < top.node.cells.len() {
                    self.state = CursorState::Valid;
                    return Ok(true);
                }
                self.stack.pop();
                continue;
            }
            if top.index < top.node.cells.len() {
                if self.kind.is_table() {
                    top.index += 1;
                    self.descend_leftmost(pager)?;
                    continue;
                }
                self.state = CursorState::Valid;
                return Ok(true);
            }
            self.stack.pop();
        }
    }

    /// Moves up from a position before the start of a leaf to the previous entry.
    fn normalize_backward(&mut self, pager: &mut Pager) -> Result<bool> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                self.state = CursorState::AtEnd;
                return Ok(false);
            };
            if top.node.is_leaf() {
                if top.index < top.node.cells.len() {
                    self.state = CursorState::Valid;
                    return Ok(true);
                }
                self.stack.pop();
                continue;
            }
            if top.index == 0 {
                self.stack.pop();
                continue;
            }
            top.index -= 1;
            if self.kind.is_table() {
                self.descend_rightmost(pager)?;
                continue;
            }
            self.state = CursorState::Valid;
            return Ok(true);
        }
    }

    pub fn first(&mut self, pager: &mut Pager) -> Result<bool> {
        self.reset(pager);
        self.push(pager, self.root, |_| 0)?;
        self.descend_leftmost(pager)?;
        self.normalize_forward(pager)
    }

    pub fn last(&mut self, pager: &mut Pager) -> Result<bool> {
        self.reset(pager);
        self.push(pager, self.root, |f| f.node.child_count().saturating_sub(1))?;
        self.descend_rightmost(pager)?;
        let top = self.top()?;
        if top.node.cells.is_empty() {
            // An empty rightmost leaf: step back through the parents.
            if let Some(frame) = self.stack.last_mut() {
                frame.index = usize::MAX;
            }
        }
        self.normalize_backward(pager)
    }

    pub fn next(&mut self, pager: &mut Pager) -> Result<bool> {
        match &self.state {
            CursorState::RequireSeek { key, deleted } => {
                let key = key.clone();
                let op = if *deleted { SeekOp::Ge } else { SeekOp::Gt };
                self.check_generation(pager)?;
                return self.seek_saved(pager, &key, op);
            }
            CursorState::Valid => {}
            CursorState::AtEnd => return Ok(false),
            CursorState::Unpositioned => return Err(DatabaseError::misuse("cursor is not positioned")),
        }
        self.check_generation(pager)?;
        let top = self
            .stack
            .last_mut()
            .ok_or_else(|| DatabaseError::internal("valid cursor without path"))?;
        top.index += 1;
        if !top.node.is_leaf() {
            self.descend_leftmost(pager)?;
        }
        self.normalize_forward(pager)
    }

    pub fn prev(&mut self, pager: &mut Pager) -> Result<bool> {
        match &self.state {
            CursorState::RequireSeek { key, .. } => {
                let key = key.clone();
                self.check_generation(pager)?;
                return self.seek_saved(pager, &key, SeekOp::Lt);
            }
            CursorState::Valid => {}
            CursorState::AtEnd => return Ok(false),
            CursorState::Unpositioned => return Err(DatabaseError::misuse("cursor is not positioned")),
        }
        self.check_generation(pager)?;
        let top = self
            .stack
            .last_mut()
            .ok_or_else(|| DatabaseError::internal("valid cursor without path"))?;
        if top.node.is_leaf() {
            if top.index == 0 {
                top.index = usize::MAX;
            } else {
                top.index -= 1;
            }
            return self.normalize_backward(pager);
        }
        // Resting on an interior index entry: its predecessor is the last
        // entry of the subtree to its left.
        self.descend_rightmost(pager)?;
        if self.top()?.node.cells.is_empty() {
            if let Some(frame) = self.stack.last_mut() {
                frame.index = usize::MAX;
            }
        }
        self.normalize_backward(pager)
    }

    fn seek_saved(&mut self, pager: &mut Pager, key: &SavedKey, op: SeekOp) -> Result<bool> {
        self.seek(pager, key.as_search(), op)
    }

    /// Positions the cursor relative to `key`. Returns whether it landed on
    /// an entry; for [`SeekOp::Eq`] the entry must match the key (as a prefix
    /// for index keys).
    pub fn seek(&mut self, pager: &mut Pager, key: SearchKey<'_>, op: SeekOp) -> Result<bool> {
        match op {
            SeekOp::Ge | SeekOp::Gt => self.lower_bound(pager, key, op == SeekOp::Gt),
            SeekOp::Eq => {
                if !self.lower_bound(pager, key, false)? {
                    return Ok(false);
                }
                let cell = self.current()?;
                Ok(compare_cell(cell, key)? == Ordering::Equal)
            }
            SeekOp::Le | SeekOp::Lt => {
                if self.lower_bound(pager, key, op == SeekOp::Le)? {
                    self.prev(pager)
                } else {
                    self.last(pager)
                }
            }
        }
    }

    fn lower_bound(&mut self, pager: &mut Pager, key: SearchKey<'_>, strict: bool) -> Result<bool> {
        self.reset(pager);
        let mut page_id = self.root;
        loop {
            if self.stack.len() >= MAX_DEPTH {
                return Err(DatabaseError::corrupt(page_id, "tree too deep"));
            }
            let node = load_node(pager, page_id, self.kind)?;
            let index = search_node(&node, key, strict)?;
            let next = if node.is_leaf() { None } else { node.child(index) };
            self.stack.push(PathFrame {
                page_id,
                node,
                index,
                dirty: false,
            });
            match next {
                Some(child) => page_id = child,
                None => break,
            }
        }
        self.normalize_forward(pager)
    }

    fn current(&self) -> Result<&Cell> {
        if self.state != CursorState::Valid {
            return Err(DatabaseError::misuse("cursor does not point at an entry"));
        }
        let frame = self.top()?;
        frame
            .node
            .cells
            .get(frame.index)
            .ok_or_else(|| DatabaseError::internal("cursor index out of range"))
    }

    /// Brings a cursor that moved itself by mutation back onto its key.
    fn restore(&mut self, pager: &mut Pager) -> Result<()> {
        if let CursorState::RequireSeek { key, deleted } = &self.state {
            if *deleted {
                return Err(DatabaseError::misuse("cursor entry was deleted"));
            }
            let key = key.clone();
            self.check_generation(pager)?;
            if !self.seek_saved(pager, &key, SeekOp::Eq)? {
                return Err(DatabaseError::internal("entry vanished after insert"));
            }
        }
        self.check_generation(pager)
    }

    fn cell(&mut self, pager: &mut Pager) -> Result<&Cell> {
        self.restore(pager)?;
        self.current()
    }

    pub fn row_id(&mut self, pager: &mut Pager) -> Result<RowId> {
        self.cell(pager)?
            .row_id()
            .ok_or_else(|| DatabaseError::misuse("index cursor has no rowid"))
    }

    /// Raw record bytes of the current entry.
    pub fn payload(&mut self, pager: &mut Pager) -> Result<&[u8]> {
        self.cell(pager)?
            .payload()
            .ok_or_else(|| DatabaseError::internal("interior table cell has no payload"))
    }

    pub fn index_key(&mut self, pager: &mut Pager) -> Result<Vec<Value>> {
        let payload = self.payload(pager)?;
        record::decode(payload)
    }

    /// Remembers the key to come back to. The generation recorded is the one
    /// this cursor's own write produced, so a later write through any other
    /// cursor still invalidates it.
    fn after_mutation(&mut self, pager: &Pager, key: SavedKey, deleted: bool) {
        self.stack.clear();
        self.generation = pager.tree_generation(self.root);
        self.state = CursorState::RequireSeek { key, deleted };
    }

    pub fn insert_row(&mut self, pager: &mut Pager, row_id: RowId, payload: Vec<u8>) -> Result<()> {
        if !self.kind.is_table() {
            return Err(DatabaseError::misuse("row insert into an index"));
        }
        btree::insert_row(pager, self.root, row_id, payload)?;
        self.after_mutation(pager, SavedKey::RowId(row_id), false);
        Ok(())
    }

    pub fn insert_index(&mut self, pager: &mut Pager, key: &[Value]) -> Result<()> {
        if self.kind.is_table() {
            return Err(DatabaseError::misuse("index insert into a table"));
        }
        btree::insert_index_entry(pager, self.root, key)?;
        self.after_mutation(pager, SavedKey::Index(key.to_vec()), false);
        Ok(())
    }

    /// Deletes the current entry. Afterwards `next` lands on its successor
    /// and `prev` on its predecessor.
    pub fn delete(&mut self, pager: &mut Pager) -> Result<()> {
        let key = match self.kind {
            TreeKind::Table => SavedKey::RowId(self.row_id(pager)?),
            TreeKind::Index => SavedKey::Index(self.index_key(pager)?),
        };
        let path = self.stack.clone();
        btree::delete_at(pager, self.root, self.kind, path)?;
        self.after_mutation(pager, key, true);
        Ok(())
    }

    /// Largest rowid in a table tree.
    pub fn max_row_id(&mut self, pager: &mut Pager) -> Result<Option<RowId>> {
        if self.last(pager)? {
            Ok(Some(self.row_id(pager)?))
        } else {
            Ok(None)
        }
    }

    pub fn count(&self, pager: &mut Pager) -> Result<u64> {
        btree::count_entries(pager, self.root, self.kind)
    }
}
