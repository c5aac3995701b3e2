//! Bytecode for the virtual machine.

use std::fmt;

use crate::{
    executor::functions::{AggregateFunction, ScalarFunction},
    planner::{
        expression::{BinaryOperator, UnaryOperator},
        types::{SortOrder, TransactionMode},
    },
    storage::{btree::TreeKind, cursor::SeekOp},
    types::{
        PageId,
        value::{Affinity, Value},
    },
};

pub type Addr = usize;

/// Where a cursor finds its root page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    Page(PageId),
    /// Root page number held in a memory cell (trees created by this program).
    Mem(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    // Control flow. Jump instructions pop their operand.
    Goto(Addr),
    JumpIfTrue(Addr),
    /// Jumps when the operand is false or NULL.
    JumpIfFalse(Addr),
    JumpIfNull(Addr),
    Halt,

    /// Starts (or joins) a transaction and checks the schema cookie the
    /// program was compiled against.
    Transaction { write: bool },

    // Stack and memory cells.
    Push(Value),
    Param(usize),
    Pop,
    Load(usize),
    Store(usize),

    // Cursors.
    Open { cursor: usize, root: Root, kind: TreeKind, write: bool },
    Close(usize),
    Rewind { cursor: usize, on_empty: Addr },
    Last { cursor: usize, on_empty: Addr },
    Next { cursor: usize, on_more: Addr },
    Prev { cursor: usize, on_more: Addr },
    /// Pops a rowid and positions on it; jumps when absent or not an integer.
    SeekRowid { cursor: usize, on_missing: Addr },
    /// Pops a rowid bound and seeks a table cursor relative to it.
    SeekTable { cursor: usize, op: SeekOp, on_missing: Addr },
    /// Pops `argc` key values and seeks an index cursor.
    SeekIndex { cursor: usize, op: SeekOp, argc: usize, on_missing: Addr },
    Column { cursor: usize, column: usize },
    RowId { cursor: usize },

    // Expressions.
    Binary(BinaryOperator),
    Unary(UnaryOperator),
    IsNull { negated: bool },
    /// Pops pattern then subject.
    Like { negated: bool, escape: Option<char> },
    Function { func: ScalarFunction, argc: usize },
    Affinity(Affinity),
    /// Converts the top value to an integer or fails with a type mismatch.
    MustBeInt,

    // Aggregates.
    AggStep { func: AggregateFunction, slot: usize, argc: usize },
    AggFinal { func: AggregateFunction, slot: usize },

    // Records and writes.
    MakeRecord { argc: usize },
    NewRowid { cursor: usize },
    /// Pops the record and then the rowid. `count` adds to the change
    /// counter; `last_rowid` records the rowid for `last_insert_rowid`.
    Insert { cursor: usize, count: bool, last_rowid: bool },
    Delete { cursor: usize, count: bool },
    /// Pops `argc` values (indexed columns then rowid).
    IdxInsert { cursor: usize, argc: usize },
    IdxDelete { cursor: usize, argc: usize },
    /// Peeks `argc` indexed values plus the rowid above them and fails when
    /// another row already holds the same non-NULL key.
    UniqueCheck { cursor: usize, argc: usize, message: String },
    /// Peeks a rowid and fails when the table already has it.
    RowidUniqueCheck { cursor: usize, message: String },
    /// Peeks a value and fails when it is NULL.
    NotNullCheck { message: String },

    // Sorting and rowid sets.
    SorterOpen { sorter: usize, order: Vec<SortOrder> },
    SorterInsert { sorter: usize, argc: usize },
    SorterSort { sorter: usize, on_empty: Addr },
    SorterNext { sorter: usize, on_more: Addr },
    SorterColumn { sorter: usize, column: usize },
    RowSetAdd { set: usize },
    /// Pushes the next rowid, or jumps when the set is exhausted.
    RowSetNext { set: usize, on_done: Addr },

    // Counters for LIMIT / OFFSET.
    /// Jumps when the cell holds zero.
    IfZero { mem: usize, target: Addr },
    /// Decrements the cell and jumps once it reaches zero.
    DecrJumpZero { mem: usize, target: Addr },
    /// Decrements a positive cell and jumps; falls through once it is spent.
    IfPosDecr { mem: usize, target: Addr },

    // Schema changes.
    CreateTree { kind: TreeKind, mem: usize },
    DestroyTree { root: PageId, kind: TreeKind },
    BumpSchemaCookie,

    ResultRow { argc: usize },
    Noop,
}

impl Insn {
    pub fn target_mut(&mut self) -> Option<&mut Addr> {
        match self {
            Insn::Goto(addr) | Insn::JumpIfTrue(addr) | Insn::JumpIfFalse(addr) | Insn::JumpIfNull(addr) => Some(addr),
            Insn::Rewind { on_empty, .. }
            | Insn::Last { on_empty, .. }
            | Insn::SorterSort { on_empty, .. } => Some(on_empty),
            Insn::Next { on_more, .. } | Insn::Prev { on_more, .. } | Insn::SorterNext { on_more, .. } => Some(on_more),
            Insn::SeekRowid { on_missing, .. }
            | Insn::SeekTable { on_missing, .. }
            | Insn::SeekIndex { on_missing, .. } => Some(on_missing),
            Insn::RowSetNext { on_done, .. } => Some(on_done),
            Insn::IfZero { target, .. } | Insn::DecrJumpZero { target, .. } | Insn::IfPosDecr { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }

    /// Whether executing this instruction can modify the database.
    pub fn writes(&self) -> bool {
        matches!(
            self,
            Insn::Transaction { write: true }
                | Insn::Insert { .. }
                | Insn::Delete { .. }
                | Insn::IdxInsert { .. }
                | Insn::IdxDelete { .. }
                | Insn::CreateTree { .. }
                | Insn::DestroyTree { .. }
                | Insn::BumpSchemaCookie
        )
    }
}

/// Statements the connection carries out itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Begin(TransactionMode),
    Commit,
    Rollback,
    Savepoint(String),
    Release(String),
    RollbackTo(String),
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub insns: Vec<Insn>,
    pub mem_count: usize,
    pub cursor_count: usize,
    pub sorter_count: usize,
    pub rowset_count: usize,
    pub agg_count: usize,
    pub column_names: Vec<String>,
    /// Parameter slot names; positional slots are `None`.
    pub parameters: Vec<Option<String>>,
    /// Schema cookie the program was compiled against.
    pub schema_cookie: u32,
    pub control: Option<Control>,
}

impl Program {
    pub fn is_read_only(&self) -> bool {
        self.control.is_none() && !self.insns.iter().any(Insn::writes)
    }

    pub fn changes_schema(&self) -> bool {
        self.insns.contains(&Insn::BumpSchemaCookie)
    }

    /// 1-based slot of a named parameter (`:name`, `@name`, `$name`).
    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameters
            .iter()
            .position(|p| p.as_deref() == Some(name))
            .map(|i| i + 1)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(control) = &self.control {
            return writeln!(f, "{control:?}");
        }
        for (addr, insn) in self.insns.iter().enumerate() {
            writeln!(f, "{addr:>4}  {insn:?}")?;
        }
        Ok(())
    }
}

/// Emits instructions with symbolic jump targets that are resolved once the
/// program is complete.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    insns: Vec<Insn>,
    labels: Vec<Option<Addr>>,
    mem_count: usize,
    cursor_count: usize,
    sorter_count: usize,
    rowset_count: usize,
    agg_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, insn: Insn) -> Addr {
        self.insns.push(insn);
        self.insns.len() - 1
    }

    /// Emits a jump instruction whose target is `label`.
    pub fn emit_jump(&mut self, mut insn: Insn, label: Label) {
        if let Some(target) = insn.target_mut() {
            *target = label.0;
        }
        self.insns.push(insn);
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next instruction emitted.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.insns.len());
    }

    pub fn alloc_mem(&mut self) -> usize {
        self.mem_count += 1;
        self.mem_count - 1
    }

    pub fn alloc_cursor(&mut self) -> usize {
        self.cursor_count += 1;
        self.cursor_count - 1
    }

    pub fn alloc_sorter(&mut self) -> usize {
        self.sorter_count += 1;
        self.sorter_count - 1
    }

    pub fn alloc_rowset(&mut self) -> usize {
        self.rowset_count += 1;
        self.rowset_count - 1
    }

    pub fn alloc_agg(&mut self) -> usize {
        self.agg_count += 1;
        self.agg_count - 1
    }

    pub fn finish(mut self, column_names: Vec<String>, parameters: Vec<Option<String>>, schema_cookie: u32) -> Program {
        let end = self.insns.len();
        for insn in &mut self.insns {
            if let Some(target) = insn.target_mut() {
                *target = self.labels.get(*target).copied().flatten().unwrap_or(end);
            }
        }
        Program {
            insns: self.insns,
            mem_count: self.mem_count,
            cursor_count: self.cursor_count,
            sorter_count: self.sorter_count,
            rowset_count: self.rowset_count,
            agg_count: self.agg_count,
            column_names,
            parameters,
            schema_cookie,
            control: None,
        }
    }
}
