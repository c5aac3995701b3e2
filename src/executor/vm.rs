//! The bytecode interpreter.

use std::{
    cmp::Ordering,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering as AtomicOrdering},
    },
};

use tracing::{debug, trace};

use crate::{
    executor::{
        functions::{self, AggState},
        program::{Insn, Program, Root},
        rowset::RowSet,
        sorter::Sorter,
    },
    storage::{
        btree::{self, SearchKey, TreeKind},
        cursor::{Cursor, SeekOp},
        pager::{Pager, TransactionState},
    },
    types::{
        PageId, RowId,
        error::{DatabaseError, Result},
        record,
        value::Value,
    },
};

/// What the connection lends the machine for one `step`.
pub struct VmContext<'a> {
    pub pager: &'a mut Pager,
    pub params: &'a [Value],
    pub interrupt: &'a AtomicBool,
    /// Open a statement savepoint when the program starts writing. Set while
    /// an explicit transaction is active so a failing statement only undoes
    /// its own changes.
    pub statement_savepoint: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Row(Vec<Value>),
    Done,
}

pub struct Vm {
    program: Arc<Program>,
    pc: usize,
    stack: Vec<Value>,
    mem: Vec<Value>,
    cursors: Vec<Option<Cursor>>,
    sorters: Vec<Option<Sorter>>,
    rowsets: Vec<RowSet>,
    aggs: Vec<AggState>,
    changes: u64,
    last_insert_rowid: Option<RowId>,
    savepoint: Option<usize>,
    started: bool,
    halted: bool,
}

impl Vm {
    pub fn new(program: Arc<Program>) -> Self {
        let mut vm = Self {
            program,
            pc: 0,
            stack: Vec::new(),
            mem: Vec::new(),
            cursors: Vec::new(),
            sorters: Vec::new(),
            rowsets: Vec::new(),
            aggs: Vec::new(),
            changes: 0,
            last_insert_rowid: None,
            savepoint: None,
            started: false,
            halted: false,
        };
        vm.reset();
        vm
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Rewinds to the first instruction and drops all run state.
    pub fn reset(&mut self) {
        let p = &self.program;
        self.pc = 0;
        self.stack.clear();
        self.mem = vec![Value::Null; p.mem_count];
        self.cursors = (0..p.cursor_count).map(|_| None).collect();
        self.sorters = (0..p.sorter_count).map(|_| None).collect();
        self.rowsets = (0..p.rowset_count).map(|_| RowSet::new()).collect();
        self.aggs = vec![AggState::default(); p.agg_count];
        self.changes = 0;
        self.last_insert_rowid = None;
        self.savepoint = None;
        self.started = false;
        self.halted = false;
    }

    pub fn changes(&self) -> u64 {
        self.changes
    }

    pub fn last_insert_rowid(&self) -> Option<RowId> {
        self.last_insert_rowid
    }

    /// Depth of the statement savepoint this run opened, if any.
    pub fn statement_savepoint(&self) -> Option<usize> {
        self.savepoint
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| DatabaseError::internal(format!("stack underflow at {}", self.pc)))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        if self.stack.len() < n {
            return Err(DatabaseError::internal(format!("stack underflow at {}", self.pc)));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn peek_n(&self, n: usize) -> Result<&[Value]> {
        if self.stack.len() < n {
            return Err(DatabaseError::internal(format!("stack underflow at {}", self.pc)));
        }
        Ok(&self.stack[self.stack.len() - n..])
    }

    fn mem(&self, index: usize) -> Result<&Value> {
        self.mem
            .get(index)
            .ok_or_else(|| DatabaseError::internal(format!("memory cell {index} out of range")))
    }

    fn mem_mut(&mut self, index: usize) -> Result<&mut Value> {
        self.mem
            .get_mut(index)
            .ok_or_else(|| DatabaseError::internal(format!("memory cell {index} out of range")))
    }

    fn cursor(&mut self, index: usize) -> Result<&mut Cursor> {
        self.cursors
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(|| DatabaseError::internal(format!("cursor {index} is not open")))
    }

    fn sorter(&mut self, index: usize) -> Result<&mut Sorter> {
        self.sorters
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(|| DatabaseError::internal(format!("sorter {index} is not open")))
    }

    fn rowset(&mut self, index: usize) -> Result<&mut RowSet> {
        self.rowsets
            .get_mut(index)
            .ok_or_else(|| DatabaseError::internal(format!("rowset {index} out of range")))
    }

    fn agg(&mut self, index: usize) -> Result<&mut AggState> {
        self.aggs
            .get_mut(index)
            .ok_or_else(|| DatabaseError::internal(format!("aggregate slot {index} out of range")))
    }

    fn resolve_root(&self, root: Root) -> Result<PageId> {
        match root {
            Root::Page(page_id) => Ok(page_id),
            Root::Mem(index) => match self.mem(index)? {
                Value::Integer(page_id) if *page_id > 0 => Ok(*page_id as PageId),
                other => Err(DatabaseError::internal(format!("bad root page {other:?}"))),
            },
        }
    }

    /// Runs until the next result row or the end of the program.
    pub fn step(&mut self, ctx: &mut VmContext<'_>) -> Result<StepResult> {
        if self.halted {
            return Ok(StepResult::Done);
        }
        self.started = true;
        let program = Arc::clone(&self.program);
        loop {
            if ctx.interrupt.load(AtomicOrdering::Relaxed) {
                debug!(pc = self.pc, "statement interrupted");
                return Err(DatabaseError::Interrupted);
            }
            let Some(insn) = program.insns.get(self.pc) else {
                self.halted = true;
                return Ok(StepResult::Done);
            };
            trace!(pc = self.pc, ?insn, "exec");
            self.pc += 1;
            match insn {
                Insn::Goto(addr) => self.pc = *addr,
                Insn::JumpIfTrue(addr) => {
                    if self.pop()?.truthiness() == Some(true) {
                        self.pc = *addr;
                    }
                }
                Insn::JumpIfFalse(addr) => {
                    if self.pop()?.truthiness() != Some(true) {
                        self.pc = *addr;
                    }
                }
                Insn::JumpIfNull(addr) => {
                    if self.pop()?.is_null() {
                        self.pc = *addr;
                    }
                }
                Insn::Halt => {
                    self.halted = true;
                    return Ok(StepResult::Done);
                }
                Insn::Transaction { write } => self.begin(ctx, *write)?,

                Insn::Push(value) => self.stack.push(value.clone()),
                Insn::Param(slot) => {
                    let value = ctx.params.get(*slot).cloned().unwrap_or(Value::Null);
                    self.stack.push(value);
                }
                Insn::Pop => {
                    self.pop()?;
                }
                Insn::Load(index) => {
                    let value = self.mem(*index)?.clone();
                    self.stack.push(value);
                }
                Insn::Store(index) => {
                    let value = self.pop()?;
                    *self.mem_mut(*index)? = value;
                }

                Insn::Open { cursor, root, kind, .. } => {
                    let root = self.resolve_root(*root)?;
                    let slot = self
                        .cursors
                        .get_mut(*cursor)
                        .ok_or_else(|| DatabaseError::internal(format!("cursor {cursor} out of range")))?;
                    *slot = Some(Cursor::new(root, *kind));
                }
                Insn::Close(cursor) => {
                    if let Some(slot) = self.cursors.get_mut(*cursor) {
                        *slot = None;
                    }
                }
                Insn::Rewind { cursor, on_empty } => {
                    let found = ctx.pager.db_size() > 0 && self.cursor(*cursor)?.first(ctx.pager)?;
                    if !found {
                        self.pc = *on_empty;
                    }
                }
                Insn::Last { cursor, on_empty } => {
                    let found = ctx.pager.db_size() > 0 && self.cursor(*cursor)?.last(ctx.pager)?;
                    if !found {
                        self.pc = *on_empty;
                    }
                }
                Insn::Next { cursor, on_more } => {
                    if self.cursor(*cursor)?.next(ctx.pager)? {
                        self.pc = *on_more;
                    }
                }
                Insn::Prev { cursor, on_more } => {
                    if self.cursor(*cursor)?.prev(ctx.pager)? {
                        self.pc = *on_more;
                    }
                }
                Insn::SeekRowid { cursor, on_missing } => {
                    let key = self.pop()?;
                    let found = match exact_rowid(&key) {
                        Some(row_id) if ctx.pager.db_size() > 0 => {
                            self.cursor(*cursor)?
                                .seek(ctx.pager, SearchKey::RowId(row_id), SeekOp::Eq)?
                        }
                        _ => false,
                    };
                    if !found {
                        self.pc = *on_missing;
                    }
                }
                Insn::SeekTable { cursor, op, on_missing } => {
                    let key = self.pop()?;
                    let found = match rowid_bound(&key, *op) {
                        Some((row_id, op)) if ctx.pager.db_size() > 0 => {
                            self.cursor(*cursor)?.seek(ctx.pager, SearchKey::RowId(row_id), op)?
                        }
                        _ => false,
                    };
                    if !found {
                        self.pc = *on_missing;
                    }
                }
                Insn::SeekIndex { cursor, op, argc, on_missing } => {
                    let key = self.pop_n(*argc)?;
                    let found = ctx.pager.db_size() > 0
                        && self.cursor(*cursor)?.seek(ctx.pager, SearchKey::Index(&key), *op)?;
                    if !found {
                        self.pc = *on_missing;
                    }
                }
                Insn::Column { cursor, column } => {
                    let value = {
                        let cursor = self.cursor(*cursor)?;
                        let payload = cursor.payload(ctx.pager)?;
                        record::decode_column(payload, *column)?
                    };
                    self.stack.push(value);
                }
                Insn::RowId { cursor } => {
                    let cursor = self.cursor(*cursor)?;
                    let row_id = match cursor.kind() {
                        TreeKind::Table => cursor.row_id(ctx.pager)?,
                        TreeKind::Index => index_row_id(&cursor.index_key(ctx.pager)?)?,
                    };
                    self.stack.push(Value::Integer(row_id));
                }

                Insn::Binary(op) => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    self.stack.push(functions::binary(*op, &left, &right));
                }
                Insn::Unary(op) => {
                    let value = self.pop()?;
                    self.stack.push(functions::unary(*op, &value));
                }
                Insn::IsNull { negated } => {
                    let value = self.pop()?;
                    self.stack.push(Value::from_bool(value.is_null() != *negated));
                }
                Insn::Like { negated, escape } => {
                    let pattern = self.pop()?;
                    let subject = self.pop()?;
                    let mut result = functions::like_values(&pattern, &subject, *escape);
                    if *negated {
                        result = functions::unary(crate::planner::expression::UnaryOperator::Not, &result);
                    }
                    self.stack.push(result);
                }
                Insn::Function { func, argc } => {
                    let args = self.pop_n(*argc)?;
                    self.stack.push(func.call(args)?);
                }
                Insn::Affinity(affinity) => {
                    let value = self.pop()?;
                    self.stack.push(value.apply_affinity(*affinity));
                }
                Insn::MustBeInt => {
                    let value = self.pop()?;
                    self.stack.push(Value::Integer(functions::must_be_int(value)?));
                }

                Insn::AggStep { func, slot, argc } => {
                    let args = self.pop_n(*argc)?;
                    self.agg(*slot)?.step(*func, args.first())?;
                }
                Insn::AggFinal { func, slot } => {
                    let value = self.agg(*slot)?.finalize(*func)?;
                    self.stack.push(value);
                }

                Insn::MakeRecord { argc } => {
                    let values = self.pop_n(*argc)?;
                    self.stack.push(Value::Blob(record::encode(&values)));
                }
                Insn::NewRowid { cursor } => {
                    let max = if ctx.pager.db_size() > 0 {
                        self.cursor(*cursor)?.max_row_id(ctx.pager)?
                    } else {
                        None
                    };
                    let row_id = match max {
                        None => 1,
                        Some(max) => max.checked_add(1).ok_or(DatabaseError::Full)?,
                    };
                    self.stack.push(Value::Integer(row_id.max(1)));
                }
                Insn::Insert { cursor, count, last_rowid } => {
                    let payload = match self.pop()? {
                        Value::Blob(bytes) => bytes,
                        other => return Err(DatabaseError::internal(format!("insert of non-record {other:?}"))),
                    };
                    let row_id = match self.pop()? {
                        Value::Integer(row_id) => row_id,
                        other => return Err(DatabaseError::internal(format!("non-integer rowid {other:?}"))),
                    };
                    self.cursor(*cursor)?.insert_row(ctx.pager, row_id, payload)?;
                    if *count {
                        self.changes += 1;
                    }
                    if *last_rowid {
                        self.last_insert_rowid = Some(row_id);
                    }
                }
                Insn::Delete { cursor, count } => {
                    self.cursor(*cursor)?.delete(ctx.pager)?;
                    if *count {
                        self.changes += 1;
                    }
                }
                Insn::IdxInsert { cursor, argc } => {
                    let key = self.pop_n(*argc)?;
                    self.cursor(*cursor)?.insert_index(ctx.pager, &key)?;
                }
                Insn::IdxDelete { cursor, argc } => {
                    let key = self.pop_n(*argc)?;
                    let cursor = self.cursor(*cursor)?;
                    if !cursor.seek(ctx.pager, SearchKey::Index(&key), SeekOp::Eq)? {
                        return Err(DatabaseError::corrupt(cursor.root(), "index entry missing for row"));
                    }
                    cursor.delete(ctx.pager)?;
                }
                Insn::UniqueCheck { cursor, argc, message } => {
                    let values = self.peek_n(argc + 1)?.to_vec();
                    let (key, row_id) = values.split_at(*argc);
                    let row_id = index_row_id(row_id)?;
                    if !key.iter().any(Value::is_null) && ctx.pager.db_size() > 0 {
                        let cursor = self.cursor(*cursor)?;
                        let mut more = cursor.seek(ctx.pager, SearchKey::Index(key), SeekOp::Ge)?;
                        while more {
                            let entry = cursor.index_key(ctx.pager)?;
                            if record::compare_prefix(key, &entry) != Ordering::Equal {
                                break;
                            }
                            if index_row_id(&entry)? != row_id {
                                return Err(DatabaseError::constraint(message.clone()));
                            }
                            more = cursor.next(ctx.pager)?;
                        }
                    }
                }
                Insn::RowidUniqueCheck { cursor, message } => {
                    let row_id = match self.peek_n(1)?.first() {
                        Some(Value::Integer(row_id)) => *row_id,
                        other => return Err(DatabaseError::internal(format!("non-integer rowid {other:?}"))),
                    };
                    let exists = ctx.pager.db_size() > 0
                        && self.cursor(*cursor)?.seek(ctx.pager, SearchKey::RowId(row_id), SeekOp::Eq)?;
                    if exists {
                        return Err(DatabaseError::constraint(message.clone()));
                    }
                }
                Insn::NotNullCheck { message } => {
                    if self.peek_n(1)?.first().is_some_and(Value::is_null) {
                        return Err(DatabaseError::constraint(message.clone()));
                    }
                }

                Insn::SorterOpen { sorter, order } => {
                    let slot = self
                        .sorters
                        .get_mut(*sorter)
                        .ok_or_else(|| DatabaseError::internal(format!("sorter {sorter} out of range")))?;
                    *slot = Some(Sorter::new(order.clone()));
                }
                Insn::SorterInsert { sorter, argc } => {
                    let record = self.pop_n(*argc)?;
                    self.sorter(*sorter)?.insert(record);
                }
                Insn::SorterSort { sorter, on_empty } => {
                    if !self.sorter(*sorter)?.sort() {
                        self.pc = *on_empty;
                    }
                }
                Insn::SorterNext { sorter, on_more } => {
                    if self.sorter(*sorter)?.next() {
                        self.pc = *on_more;
                    }
                }
                Insn::SorterColumn { sorter, column } => {
                    let value = self.sorter(*sorter)?.column(*column).cloned().unwrap_or(Value::Null);
                    self.stack.push(value);
                }
                Insn::RowSetAdd { set } => {
                    let row_id = match self.pop()? {
                        Value::Integer(row_id) => row_id,
                        other => return Err(DatabaseError::internal(format!("non-integer rowid {other:?}"))),
                    };
                    self.rowset(*set)?.add(row_id);
                }
                Insn::RowSetNext { set, on_done } => match self.rowset(*set)?.next() {
                    Some(row_id) => self.stack.push(Value::Integer(row_id)),
                    None => self.pc = *on_done,
                },

                Insn::IfZero { mem, target } => {
                    if *self.mem(*mem)? == Value::Integer(0) {
                        self.pc = *target;
                    }
                }
                Insn::DecrJumpZero { mem, target } => {
                    let reached = match self.mem_mut(*mem)? {
                        Value::Integer(n) => {
                            *n = n.saturating_sub(1);
                            *n == 0
                        }
                        _ => false,
                    };
                    if reached {
                        self.pc = *target;
                    }
                }
                Insn::IfPosDecr { mem, target } => {
                    let skip = match self.mem_mut(*mem)? {
                        Value::Integer(n) if *n > 0 => {
                            *n -= 1;
                            true
                        }
                        _ => false,
                    };
                    if skip {
                        self.pc = *target;
                    }
                }

                Insn::CreateTree { kind, mem } => {
                    let root = btree::create_tree(ctx.pager, *kind)?;
                    debug!(root, ?kind, "created tree");
                    *self.mem_mut(*mem)? = Value::Integer(root as i64);
                }
                Insn::DestroyTree { root, kind } => {
                    btree::destroy_tree(ctx.pager, *root, *kind)?;
                    debug!(root, ?kind, "destroyed tree");
                }
                Insn::BumpSchemaCookie => {
                    let mut header = ctx.pager.header()?;
                    header.schema_cookie = header.schema_cookie.wrapping_add(1);
                    ctx.pager.write_header(&header)?;
                }

                Insn::ResultRow { argc } => {
                    let row = self.pop_n(*argc)?;
                    return Ok(StepResult::Row(row));
                }
                Insn::Noop => {}
            }
        }
    }

    fn begin(&mut self, ctx: &mut VmContext<'_>, write: bool) -> Result<()> {
        if write {
            ctx.pager.begin_write()?;
            if ctx.statement_savepoint && self.savepoint.is_none() {
                self.savepoint = Some(ctx.pager.open_savepoint()?);
            }
        } else {
            ctx.pager.begin_read()?;
        }
        debug_assert!(ctx.pager.state() != TransactionState::None);
        let cookie = if ctx.pager.db_size() > 0 {
            ctx.pager.header()?.schema_cookie
        } else {
            0
        };
        if cookie != self.program.schema_cookie {
            debug!(
                compiled = self.program.schema_cookie,
                current = cookie,
                "schema changed since statement was prepared"
            );
            return Err(DatabaseError::SchemaChanged);
        }
        Ok(())
    }
}

/// The rowid stored as the last column of an index key.
fn index_row_id(key: &[Value]) -> Result<RowId> {
    match key.last() {
        Some(Value::Integer(row_id)) => Ok(*row_id),
        _ => Err(DatabaseError::corrupt(0, "index entry without rowid")),
    }
}

/// A value usable as an exact rowid key.
fn exact_rowid(value: &Value) -> Option<RowId> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Real(r) if r.fract() == 0.0 && r.abs() < 9.2e18 => Some(*r as i64),
        Value::Text(s) => match crate::types::value::parse_numeric(s)? {
            Value::Integer(i) => Some(i),
            _ => None,
        },
        _ => None,
    }
}

/// Turns a comparison bound on the rowid into an integer seek. Returns
/// `None` when no rowid can satisfy it (NULL, or text above all numbers).
fn rowid_bound(value: &Value, op: SeekOp) -> Option<(RowId, SeekOp)> {
    let number = match value {
        Value::Integer(i) => return Some((*i, op)),
        Value::Real(r) => *r,
        Value::Text(s) => match crate::types::value::parse_numeric(s)? {
            Value::Integer(i) => return Some((i, op)),
            Value::Real(r) => r,
            _ => return None,
        },
        _ => return None,
    };
    if number.is_nan() {
        return None;
    }
    let clamp = |r: f64| r.clamp(i64::MIN as f64, i64::MAX as f64) as i64;
    Some(match op {
        SeekOp::Ge | SeekOp::Gt if number.fract() != 0.0 => (clamp(number.ceil()), SeekOp::Ge),
        SeekOp::Le | SeekOp::Lt if number.fract() != 0.0 => (clamp(number.floor()), SeekOp::Le),
        _ => (clamp(number), op),
    })
}
