//! B-tree structure maintenance. Table trees are B+ trees keyed by rowid
//! with all rows in the leaves; index trees keep entries in interior nodes
//! too. Root pages never move, so schema entries stay valid.

use std::{cmp::Ordering, collections::HashSet, mem};

use tracing::trace;

use crate::{
    storage::pager::Pager,
    types::{
        CELL_POINTER_SIZE, HEADER_SIZE, PageId, RowId,
        error::{DatabaseError, Result},
        page::{Cell, Node, PageType},
        record::{self, compare_prefix},
        value::Value,
    },
};

/// Deepest tree accepted; anything deeper is treated as a cycle.
pub const MAX_DEPTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Table,
    Index,
}

impl TreeKind {
    pub fn is_table(self) -> bool {
        self == TreeKind::Table
    }
}

/// A search key into a tree: a rowid for tables, a (possibly partial) key for
/// indexes.
#[derive(Debug, Clone, Copy)]
pub enum SearchKey<'a> {
    RowId(RowId),
    Index(&'a [Value]),
}

pub fn header_offset(page_id: PageId) -> usize {
    if page_id == 1 { HEADER_SIZE } else { 0 }
}

pub fn load_node(pager: &mut Pager, page_id: PageId, kind: TreeKind) -> Result<Node> {
    let usable = pager.usable_size();
    let page = pager.read_page(page_id)?;
    let node = Node::decode(&page, header_offset(page_id), usable).map_err(|e| e.at_page(page_id))?;
    if node.is_table() != kind.is_table() {
        return Err(DatabaseError::corrupt(page_id, "page belongs to a different tree kind"));
    }
    Ok(node)
}

pub fn store_node(pager: &mut Pager, page_id: PageId, node: &Node) -> Result<()> {
    let usable = pager.usable_size();
    let page = pager.get_writable(page_id)?;
    node.encode(page, header_offset(page_id), usable)
}

/// Orders a cell relative to a search key.
pub fn compare_cell(cell: &Cell, key: SearchKey<'_>) -> Result<Ordering> {
    match (cell.row_id(), key) {
        (Some(row_id), SearchKey::RowId(target)) => Ok(row_id.cmp(&target)),
        (None, SearchKey::Index(target)) => {
            let payload = cell
                .payload()
                .ok_or_else(|| DatabaseError::internal("index cell without payload"))?;
            let stored = record::decode(payload)?;
            Ok(compare_prefix(target, &stored).reverse())
        }
        _ => Err(DatabaseError::internal("search key kind does not match tree kind")),
    }
}

/// Index of the first cell ordered after `key` (`strict`) or not before it.
pub fn search_node(node: &Node, key: SearchKey<'_>, strict: bool) -> Result<usize> {
    let (mut lo, mut hi) = (0, node.cells.len());
    while lo < hi {
        let mid = (lo + hi) / 2;
        let ord = compare_cell(&node.cells[mid], key)?;
        let go_right = if strict {
            ord != Ordering::Greater
        } else {
            ord == Ordering::Less
        };
        if go_right {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// One level of a root-to-leaf path. `index` is the child followed (interior)
/// or the cell position (leaf).
#[derive(Debug, Clone)]
pub struct PathFrame {
    pub page_id: PageId,
    pub node: Node,
    pub index: usize,
    pub dirty: bool,
}

pub fn create_tree(pager: &mut Pager, kind: TreeKind) -> Result<PageId> {
    let page_id = pager.allocate_page()?;
    store_node(pager, page_id, &Node::new_leaf(kind.is_table()))?;
    trace!(page_id, ?kind, "created tree");
    Ok(page_id)
}

/// Frees every page below `root` and leaves the root as an empty leaf.
pub fn clear_tree(pager: &mut Pager, root: PageId, kind: TreeKind) -> Result<()> {
    let root_node = load_node(pager, root, kind)?;
    let mut pending: Vec<(PageId, usize)> = Vec::new();
    for i in 0..root_node.child_count() {
        if let Some(child) = root_node.child(i) {
            pending.push((child, 1));
        }
    }
    let mut seen = HashSet::new();
    while let Some((page_id, depth)) = pending.pop() {
        if depth > MAX_DEPTH || !seen.insert(page_id) {
            return Err(DatabaseError::corrupt(page_id, "cycle while clearing tree"));
        }
        let node = load_node(pager, page_id, kind)?;
        for i in 0..node.child_count() {
            if let Some(child) = node.child(i) {
                pending.push((child, depth + 1));
            }
        }
        pager.free_page(page_id)?;
    }
    store_node(pager, root, &Node::new_leaf(kind.is_table()))?;
    pager.bump_tree_generation(root);
    Ok(())
}

/// Frees every page of the tree, root included.
pub fn destroy_tree(pager: &mut Pager, root: PageId, kind: TreeKind) -> Result<()> {
    if root == 1 {
        return Err(DatabaseError::misuse("cannot destroy the schema table"));
    }
    clear_tree(pager, root, kind)?;
    pager.free_page(root)?;
    trace!(root, "destroyed tree");
    Ok(())
}

/// Number of entries in the tree.
pub fn count_entries(pager: &mut Pager, root: PageId, kind: TreeKind) -> Result<u64> {
    let mut pending = vec![(root, 0usize)];
    let mut total = 0u64;
    while let Some((page_id, depth)) = pending.pop() {
        if depth > MAX_DEPTH {
            return Err(DatabaseError::corrupt(page_id, "tree too deep"));
        }
        let node = load_node(pager, page_id, kind)?;
        if node.is_leaf() || !kind.is_table() {
            total += node.cells.len() as u64;
        }
        for i in 0..node.child_count() {
            if let Some(child) = node.child(i) {
                pending.push((child, depth + 1));
            }
        }
    }
    Ok(total)
}

fn min_fill(usable: usize, page_type: PageType) -> usize {
    (usable - page_type.header_size()) / 4
}

fn is_underfull(node: &Node, usable: usize) -> bool {
    node.cells.is_empty() || node.content_size() < min_fill(usable, node.page_type)
}

/// Splits `cells` into nodes that each fit in a non-root page. Returns the
/// nodes and the cells that divide them; divider `j` still needs its left
/// child pointed at node `j`.
fn distribute(
    page_type: PageType,
    cells: Vec<Cell>,
    right_child: Option<PageId>,
    usable: usize,
) -> Result<(Vec<Node>, Vec<Cell>)> {
    let capacity = usable - page_type.header_size();
    let costs: Vec<usize> = cells.iter().map(|c| c.size() + CELL_POINTER_SIZE).collect();
    let total: usize = costs.iter().sum();
    let n = cells.len();

    // Table leaves synthesize their dividers; every other kind promotes a cell.
    let consume = page_type != PageType::LeafTable;
    let mut cuts: Vec<usize> = Vec::new();
    if total > capacity {
        let groups = total.div_ceil(capacity).max(2);
        let target = total.div_ceil(groups);
        let after_cut = if consume { 2 } else { 1 };
        let mut acc = 0;
        let mut i = 0;
        while i < n {
            if acc + costs[i] > capacity {
                if acc == 0 {
                    return Err(DatabaseError::internal("cell larger than a page"));
                }
                let mut cut = i;
                if consume && n - cut < after_cut {
                    cut -= 1;
                }
                let group_start = cuts.last().map_or(0, |c| c + usize::from(consume));
                if cut <= group_start {
                    return Err(DatabaseError::internal("cannot split node around large cell"));
                }
                cuts.push(cut);
                i = cut + usize::from(consume);
                acc = 0;
                continue;
            }
            acc += costs[i];
            i += 1;
            if acc >= target && n - i >= after_cut && cuts.len() + 1 < groups {
                cuts.push(i);
                i += usize::from(consume);
                acc = 0;
            }
        }
    }

    let mut nodes = Vec::with_capacity(cuts.len() + 1);
    let mut dividers = Vec::with_capacity(cuts.len());
    let mut current = Node {
        page_type,
        cells: Vec::new(),
        right_child: None,
    };
    let mut cut_iter = cuts.iter().peekable();
    for (i, cell) in cells.into_iter().enumerate() {
        if cut_iter.peek() == Some(&&i) {
            cut_iter.next();
            let mut finished = mem::replace(
                &mut current,
                Node {
                    page_type,
                    cells: Vec::new(),
                    right_child: None,
                },
            );
            if consume {
                let divider = match (page_type, cell) {
                    (PageType::LeafIndex, cell) => cell.into_index_cell(false, 0),
                    (_, cell) => {
                        finished.right_child = cell.left_child();
                        cell
                    }
                };
                dividers.push(divider);
                nodes.push(finished);
                continue;
            }
            let row_id = finished
                .cells
                .last()
                .and_then(Cell::row_id)
                .ok_or_else(|| DatabaseError::internal("empty group in table leaf split"))?;
            dividers.push(Cell::TableInterior {
                left_child: 0,
                row_id,
            });
            nodes.push(finished);
        }
        current.cells.push(cell);
    }
    current.right_child = right_child;
    nodes.push(current);
    Ok((nodes, dividers))
}

/// Rewrites the children of `parent` starting at child `first`, replacing
/// `old_pages` with as many pages as `cells` need. The last old page keeps
/// the last group so the pointer after the inserted dividers stays valid.
fn rebuild_children(
    pager: &mut Pager,
    parent: &mut Node,
    first: usize,
    old_pages: &[PageId],
    page_type: PageType,
    cells: Vec<Cell>,
    right_child: Option<PageId>,
) -> Result<()> {
    let usable = pager.usable_size();
    let (nodes, dividers) = distribute(page_type, cells, right_child, usable)?;
    let Some((&last_page, reusable)) = old_pages.split_last() else {
        return Err(DatabaseError::internal("rebuild without pages"));
    };

    let mut reusable = reusable.iter().copied();
    let mut pages = Vec::with_capacity(nodes.len());
    for _ in 0..nodes.len() - 1 {
        let page_id = match reusable.next() {
            Some(page_id) => page_id,
            None => pager.allocate_page()?,
        };
        pages.push(page_id);
    }
    pages.push(last_page);
    for leftover in reusable {
        pager.free_page(leftover)?;
    }

    for (page_id, node) in pages.iter().zip(&nodes) {
        store_node(pager, *page_id, node)?;
    }
    for (j, mut divider) in dividers.into_iter().enumerate() {
        divider.set_left_child(pages[j]);
        parent.cells.insert(first + j, divider);
    }
    trace!(
        old = old_pages.len(),
        new = nodes.len(),
        "redistributed sibling cells"
    );
    Ok(())
}

/// Concatenates two siblings and the divider between them.
fn combine(left: Node, divider: Cell, right: Node) -> Result<(Vec<Cell>, Option<PageId>)> {
    if left.page_type != right.page_type {
        return Err(DatabaseError::corrupt(0, "siblings have different page types"));
    }
    let mut cells = left.cells;
    match left.page_type {
        PageType::LeafTable => {}
        PageType::LeafIndex => cells.push(divider.into_index_cell(true, 0)),
        PageType::InteriorTable => cells.push(Cell::TableInterior {
            left_child: left.right_child.unwrap_or(0),
            row_id: divider.row_id().unwrap_or(0),
        }),
        PageType::InteriorIndex => {
            cells.push(divider.into_index_cell(false, left.right_child.unwrap_or(0)))
        }
    }
    cells.extend(right.cells);
    Ok((cells, right.right_child))
}

/// Restores size invariants along `path` after its last node changed.
/// Overfull nodes are split, underfull ones merged with or refilled from a
/// sibling, walking up to the root.
pub fn balance(pager: &mut Pager, kind: TreeKind, path: &mut Vec<PathFrame>) -> Result<()> {
    let usable = pager.usable_size();
    let mut level = path.len() - 1;
    loop {
        if level == 0 {
            let hoff = header_offset(path[0].page_id);
            if !path[0].node.fits(hoff, usable) {
                let child = pager.allocate_page()?;
                let content = mem::replace(&mut path[0].node, Node::new_interior(kind.is_table(), child));
                path[0].index = 0;
                path[0].dirty = true;
                path.insert(
                    1,
                    PathFrame {
                        page_id: child,
                        node: content,
                        index: 0,
                        dirty: true,
                    },
                );
                level = 1;
                continue;
            }
            if !path[0].dirty {
                return Ok(());
            }
            let root_id = path[0].page_id;
            if !path[0].node.is_leaf() && path[0].node.cells.is_empty() {
                if let Some(only_child) = path[0].node.right_child {
                    let child = load_node(pager, only_child, kind)?;
                    if child.fits(hoff, usable) {
                        path[0].node = child;
                        pager.free_page(only_child)?;
                        trace!(root = root_id, "root absorbed its only child");
                    }
                }
            }
            return store_node(pager, root_id, &path[0].node);
        }

        let (upper, lower) = path.split_at_mut(level);
        let parent = &mut upper[level - 1];
        let frame = &mut lower[0];
        if frame.dirty {
            if !frame.node.fits(0, usable) {
                let cells = mem::take(&mut frame.node.cells);
                rebuild_children(
                    pager,
                    &mut parent.node,
                    parent.index,
                    &[frame.page_id],
                    frame.node.page_type,
                    cells,
                    frame.node.right_child,
                )?;
                parent.dirty = true;
            } else if is_underfull(&frame.node, usable) && !parent.node.cells.is_empty() {
                let at = parent.index;
                let page_type = frame.node.page_type;
                let this = Node {
                    page_type,
                    cells: mem::take(&mut frame.node.cells),
                    right_child: frame.node.right_child,
                };
                let (first, pages, left, right) = if at > 0 {
                    let sibling_id = parent
                        .node
                        .child(at - 1)
                        .ok_or_else(|| DatabaseError::corrupt(parent.page_id, "missing child"))?;
                    let sibling = load_node(pager, sibling_id, kind)?;
                    (at - 1, [sibling_id, frame.page_id], sibling, this)
                } else {
                    let sibling_id = parent
                        .node
                        .child(1)
                        .ok_or_else(|| DatabaseError::corrupt(parent.page_id, "missing child"))?;
                    let sibling = load_node(pager, sibling_id, kind)?;
                    (0, [frame.page_id, sibling_id], this, sibling)
                };
                let divider = parent.node.cells.remove(first);
                let (cells, right_child) =
                    combine(left, divider, right).map_err(|e| e.at_page(parent.page_id))?;
                rebuild_children(pager, &mut parent.node, first, &pages, page_type, cells, right_child)?;
                parent.dirty = true;
            } else {
                store_node(pager, frame.page_id, &frame.node)?;
            }
        }
        path.truncate(level);
        level -= 1;
    }
}

/// Descends to the leaf where `key` belongs. Table searches stop at the first
/// rowid not below the key; index searches go past equal entries so duplicates
/// keep insertion order.
pub fn descend_for_insert(
    pager: &mut Pager,
    root: PageId,
    kind: TreeKind,
    key: SearchKey<'_>,
) -> Result<Vec<PathFrame>> {
    let strict = !kind.is_table();
    let mut path = Vec::new();
    let mut page_id = root;
    loop {
        if path.len() > MAX_DEPTH {
            return Err(DatabaseError::corrupt(page_id, "tree too deep"));
        }
        let node = load_node(pager, page_id, kind)?;
        let index = search_node(&node, key, strict)?;
        let next = if node.is_leaf() { None } else { node.child(index) };
        path.push(PathFrame {
            page_id,
            node,
            index,
            dirty: false,
        });
        match next {
            Some(child) => page_id = child,
            None => return Ok(path),
        }
    }
}

/// Inserts (or, for an existing rowid, replaces) a row in a table tree.
pub fn insert_row(pager: &mut Pager, root: PageId, row_id: RowId, payload: Vec<u8>) -> Result<()> {
    let max = crate::types::page::max_local_payload(true, pager.usable_size());
    if payload.len() > max {
        return Err(DatabaseError::TooBig {
            size: payload.len(),
            max,
        });
    }
    let mut path = descend_for_insert(pager, root, TreeKind::Table, SearchKey::RowId(row_id))?;
    let leaf = path
        .last_mut()
        .ok_or_else(|| DatabaseError::internal("empty insert path"))?;
    let cell = Cell::TableLeaf { row_id, payload };
    let replace = leaf
        .node
        .cells
        .get(leaf.index)
        .and_then(Cell::row_id)
        .is_some_and(|r| r == row_id);
    if replace {
        leaf.node.cells[leaf.index] = cell;
    } else {
        leaf.node.cells.insert(leaf.index, cell);
    }
    leaf.dirty = true;
    balance(pager, TreeKind::Table, &mut path)?;
    pager.bump_tree_generation(root);
    Ok(())
}

/// Inserts an index entry. Entries are complete keys (the rowid is the last
/// column), so equal keys only arise from genuine duplicates.
pub fn insert_index_entry(pager: &mut Pager, root: PageId, key: &[Value]) -> Result<()> {
    let payload = record::encode(key);
    let max = crate::types::page::max_local_payload(false, pager.usable_size());
    if payload.len() > max {
        return Err(DatabaseError::TooBig {
            size: payload.len(),
            max,
        });
    }
    let mut path = descend_for_insert(pager, root, TreeKind::Index, SearchKey::Index(key))?;
    let leaf = path
        .last_mut()
        .ok_or_else(|| DatabaseError::internal("empty insert path"))?;
    leaf.node.cells.insert(leaf.index, Cell::IndexLeaf { payload });
    leaf.dirty = true;
    balance(pager, TreeKind::Index, &mut path)?;
    pager.bump_tree_generation(root);
    Ok(())
}

/// Removes the entry the path points at. An index entry living in an
/// interior node is replaced by its in-order predecessor from a leaf.
pub fn delete_at(pager: &mut Pager, root: PageId, kind: TreeKind, mut path: Vec<PathFrame>) -> Result<()> {
    let entry_level = path
        .len()
        .checked_sub(1)
        .ok_or_else(|| DatabaseError::internal("delete without position"))?;
    let top = &mut path[entry_level];
    if top.node.is_leaf() {
        if top.index >= top.node.cells.len() {
            return Err(DatabaseError::internal("delete past end of leaf"));
        }
        top.node.cells.remove(top.index);
        top.dirty = true;
    } else {
        let at = top.index;
        let left_child = top
            .node
            .child(at)
            .ok_or_else(|| DatabaseError::corrupt(top.page_id, "interior entry without child"))?;
        let mut page_id = left_child;
        let predecessor = loop {
            if path.len() > MAX_DEPTH {
                return Err(DatabaseError::corrupt(page_id, "tree too deep"));
            }
            let mut node = load_node(pager, page_id, kind)?;
            if node.is_leaf() {
                let cell = node
                    .cells
                    .pop()
                    .ok_or_else(|| DatabaseError::corrupt(page_id, "empty leaf below entry"))?;
                let index = node.cells.len();
                path.push(PathFrame {
                    page_id,
                    node,
                    index,
                    dirty: true,
                });
                break cell;
            }
            let index = node.cells.len();
            let next = node
                .right_child
                .ok_or_else(|| DatabaseError::corrupt(page_id, "interior page without right child"))?;
            path.push(PathFrame {
                page_id,
                node,
                index,
                dirty: false,
            });
            page_id = next;
        };
        let holder = &mut path[entry_level];
        holder.node.cells[at] = predecessor.into_index_cell(false, left_child);
        holder.dirty = true;
    }
    balance(pager, kind, &mut path)?;
    pager.bump_tree_generation(root);
    Ok(())
}

/// Shape of a tree as seen by [`check_tree`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeStats {
    pub entries: u64,
    pub depth: usize,
    pub pages: usize,
    pub underfull: usize,
}

#[derive(Debug, Clone)]
enum Bound {
    RowId(RowId),
    Key(Vec<Value>),
}

fn cell_bound(cell: &Cell) -> Result<Bound> {
    match (cell.row_id(), cell.payload()) {
        (Some(row_id), _) => Ok(Bound::RowId(row_id)),
        (None, Some(payload)) => Ok(Bound::Key(record::decode(payload)?)),
        _ => Err(DatabaseError::internal("cell without key")),
    }
}

fn bound_cmp(a: &Bound, b: &Bound) -> Ordering {
    match (a, b) {
        (Bound::RowId(a), Bound::RowId(b)) => a.cmp(b),
        (Bound::Key(a), Bound::Key(b)) => record::compare_keys(a, b),
        (Bound::RowId(_), Bound::Key(_)) => Ordering::Less,
        (Bound::Key(_), Bound::RowId(_)) => Ordering::Greater,
    }
}

/// Walks the whole tree verifying key order, page types, uniform leaf depth
/// and that no page is reachable twice.
pub fn check_tree(pager: &mut Pager, root: PageId, kind: TreeKind) -> Result<TreeStats> {
    struct Work {
        page_id: PageId,
        depth: usize,
        lower: Option<Bound>,
        upper: Option<Bound>,
    }

    let usable = pager.usable_size();
    let mut stats = TreeStats::default();
    let mut leaf_depth: Option<usize> = None;
    let mut seen = HashSet::new();
    let mut pending = vec![Work {
        page_id: root,
        depth: 1,
        lower: None,
        upper: None,
    }];

    while let Some(work) = pending.pop() {
        let page_id = work.page_id;
        if work.depth > MAX_DEPTH {
            return Err(DatabaseError::corrupt(page_id, "tree too deep"));
        }
        if !seen.insert(page_id) {
            return Err(DatabaseError::corrupt(page_id, "page referenced twice"));
        }
        let node = load_node(pager, page_id, kind)?;
        stats.pages += 1;
        stats.depth = stats.depth.max(work.depth);
        if page_id != root && is_underfull(&node, usable) {
            stats.underfull += 1;
        }

        let keys = node.cells.iter().map(cell_bound).collect::<Result<Vec<_>>>()?;
        for pair in keys.windows(2) {
            let ord = bound_cmp(&pair[0], &pair[1]);
            if ord == Ordering::Greater || (kind.is_table() && ord == Ordering::Equal) {
                return Err(DatabaseError::corrupt(page_id, "keys out of order"));
            }
        }
        if let (Some(lower), Some(first)) = (&work.lower, keys.first()) {
            let ord = bound_cmp(first, lower);
            if ord == Ordering::Less || (kind.is_table() && ord == Ordering::Equal) {
                return Err(DatabaseError::corrupt(page_id, "key below parent divider"));
            }
        }
        if let (Some(upper), Some(last)) = (&work.upper, keys.last()) {
            if bound_cmp(last, upper) == Ordering::Greater {
                return Err(DatabaseError::corrupt(page_id, "key above parent divider"));
            }
        }

        if node.is_leaf() {
            match leaf_depth {
                Some(depth) if depth != work.depth => {
                    return Err(DatabaseError::corrupt(page_id, "leaves at different depths"));
                }
                _ => leaf_depth = Some(work.depth),
            }
            stats.entries += node.cells.len() as u64;
            continue;
        }
        if !kind.is_table() {
            stats.entries += node.cells.len() as u64;
        }
        for i in 0..node.child_count() {
            let child = node
                .child(i)
                .ok_or_else(|| DatabaseError::corrupt(page_id, "interior page without child"))?;
            if child < 2 || child > pager.db_size() {
                return Err(DatabaseError::corrupt(page_id, format!("child page {child} out of range")));
            }
            let lower = if i == 0 { work.lower.clone() } else { Some(keys[i - 1].clone()) };
            let upper = if i < keys.len() { Some(keys[i].clone()) } else { work.upper.clone() };
            pending.push(Work {
                page_id: child,
                depth: work.depth + 1,
                lower,
                upper,
            });
        }
    }
    Ok(stats)
}
