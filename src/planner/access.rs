//! Access path selection: which b-tree each table of a query is read
//! through, in which join order, and the loop code that drives it.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::{
    executor::program::{Insn, Label, ProgramBuilder, Root},
    planner::{
        compiler::{ExprContext, compile_expr},
        expression::{BinaryOperator, Expression},
        scope::{ColumnTarget, Scope},
    },
    storage::{btree::TreeKind, cursor::SeekOp, schema::IndexSchema},
    types::{
        error::Result,
        value::{Affinity, Value},
    },
};

/// Row count assumed for tables that have not been analyzed.
pub const DEFAULT_ROW_ESTIMATE: u64 = 1_000_000;
/// Joins with more tables than this are ordered greedily.
const MAX_PERMUTED_TABLES: usize = 6;
/// Relative cost of decoding a row during a full scan.
const SCAN_ROW_COST: f64 = 4.0;
/// Rows an equality on an index's first column is assumed to match.
const INDEX_EQ_ROWS: f64 = 10.0;
/// Output reduction assumed for each filter term the path does not consume.
const TERM_SELECTIVITY: f64 = 0.25;

/// Row estimates per table, keyed by lower-cased table name.
pub type RowEstimates = HashMap<String, u64>;

#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub value: Expression,
    pub inclusive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccessPath {
    FullScan,
    RowidEq(Expression),
    RowidRange { lower: Option<Bound>, upper: Option<Bound> },
    /// Equality on the first `values.len()` index columns.
    IndexEq { index: IndexSchema, values: Vec<Expression> },
    /// Range on the first index column.
    IndexRange { index: IndexSchema, lower: Option<Bound>, upper: Option<Bound> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Access {
    /// Position of the table in the scope.
    pub table: usize,
    pub path: AccessPath,
    pub cost: f64,
    /// Estimated rows produced per outer iteration.
    pub rows: f64,
}

#[derive(Debug, Clone)]
struct Constraint {
    target: ColumnTarget,
    op: BinaryOperator,
    value: Expression,
}

fn constraint_from(
    scope: &Scope,
    table: usize,
    bound: &BTreeSet<usize>,
    column: &Expression,
    op: BinaryOperator,
    value: &Expression,
) -> Option<Constraint> {
    let Expression::Column(column) = column else {
        return None;
    };
    let (position, target) = scope.resolve(column).ok()?;
    if position != table {
        return None;
    }
    let value_tables = scope.tables_of(value).ok()?;
    if !value_tables.is_subset(bound) || value_tables.contains(&table) {
        return None;
    }
    Some(Constraint {
        target,
        op,
        value: value.clone(),
    })
}

/// Terms of the form `column op value` on `table` whose value only reads
/// tables in `bound`.
fn constraints(scope: &Scope, table: usize, bound: &BTreeSet<usize>, terms: &[Expression]) -> Vec<Constraint> {
    let mut out = Vec::new();
    for term in terms {
        match term {
            Expression::BinaryOp(b)
                if b.operator.is_comparison() && b.operator != BinaryOperator::NotEqual =>
            {
                if let Some(c) = constraint_from(scope, table, bound, &b.left, b.operator, &b.right) {
                    out.push(c);
                } else if let Some(c) = constraint_from(scope, table, bound, &b.right, b.operator.flipped(), &b.left) {
                    out.push(c);
                }
            }
            Expression::Between {
                expr,
                low,
                high,
                negated: false,
            } => {
                out.extend(constraint_from(scope, table, bound, expr, BinaryOperator::GreaterThanOrEqual, low));
                out.extend(constraint_from(scope, table, bound, expr, BinaryOperator::LessThanOrEqual, high));
            }
            _ => {}
        }
    }
    out
}

fn find(constraints: &[Constraint], target: ColumnTarget, op: BinaryOperator) -> Option<&Constraint> {
    constraints.iter().find(|c| c.target == target && c.op == op)
}

fn bounds(constraints: &[Constraint], target: ColumnTarget) -> (Option<Bound>, Option<Bound>) {
    let mut lower = None;
    let mut upper = None;
    for c in constraints.iter().filter(|c| c.target == target) {
        let bound = || Bound {
            value: c.value.clone(),
            inclusive: matches!(c.op, BinaryOperator::GreaterThanOrEqual | BinaryOperator::LessThanOrEqual),
        };
        match c.op {
            BinaryOperator::GreaterThan | BinaryOperator::GreaterThanOrEqual if lower.is_none() => lower = Some(bound()),
            BinaryOperator::LessThan | BinaryOperator::LessThanOrEqual if upper.is_none() => upper = Some(bound()),
            _ => {}
        }
    }
    (lower, upper)
}

fn range_rows(n: f64, lower: &Option<Bound>, upper: &Option<Bound>) -> f64 {
    match (lower.is_some(), upper.is_some()) {
        (true, true) => n / 64.0,
        _ => n / 4.0,
    }
}

fn index_target(scope: &Scope, table: usize, column: usize) -> ColumnTarget {
    if scope.tables[table].table.rowid_alias == Some(column) {
        ColumnTarget::RowId
    } else {
        ColumnTarget::Column(column)
    }
}

/// Picks the cheapest way to read `table` once the tables in `bound` are
/// positioned.
pub fn choose_access(
    scope: &Scope,
    table: usize,
    bound: &BTreeSet<usize>,
    terms: &[Expression],
    estimates: &RowEstimates,
) -> Access {
    let name = scope.tables[table].table.name.to_ascii_lowercase();
    let n = estimates.get(&name).copied().unwrap_or(DEFAULT_ROW_ESTIMATE).max(1) as f64;
    let log = n.max(2.0).log2();
    let constraints = constraints(scope, table, bound, terms);

    // (path, cost, rows, terms consumed)
    let mut candidates: Vec<(AccessPath, f64, f64, usize)> = vec![(AccessPath::FullScan, n * SCAN_ROW_COST, n, 0)];

    if let Some(c) = find(&constraints, ColumnTarget::RowId, BinaryOperator::Equal) {
        candidates.push((AccessPath::RowidEq(c.value.clone()), log, 1.0, 1));
    }
    let (lower, upper) = bounds(&constraints, ColumnTarget::RowId);
    if lower.is_some() || upper.is_some() {
        let rows = range_rows(n, &lower, &upper);
        let used = lower.is_some() as usize + upper.is_some() as usize;
        candidates.push((AccessPath::RowidRange { lower, upper }, log + rows, rows, used));
    }

    for index in &scope.tables[table].indexes {
        let mut values = Vec::new();
        for &column in &index.columns {
            match find(&constraints, index_target(scope, table, column), BinaryOperator::Equal) {
                Some(c) => values.push(c.value.clone()),
                None => break,
            }
        }
        if !values.is_empty() {
            let k = values.len();
            let rows = if index.unique && k == index.columns.len() {
                1.0
            } else {
                (INDEX_EQ_ROWS / k as f64).clamp(1.0, n)
            };
            candidates.push((
                AccessPath::IndexEq {
                    index: index.clone(),
                    values,
                },
                log + rows * (log + 1.0),
                rows,
                k,
            ));
            continue;
        }
        let Some(&first) = index.columns.first() else {
            continue;
        };
        let (lower, upper) = bounds(&constraints, index_target(scope, table, first));
        if lower.is_some() || upper.is_some() {
            let rows = range_rows(n, &lower, &upper);
            let used = lower.is_some() as usize + upper.is_some() as usize;
            candidates.push((
                AccessPath::IndexRange {
                    index: index.clone(),
                    lower,
                    upper,
                },
                log + rows * (log + 1.0),
                rows,
                used,
            ));
        }
    }

    let mut best = 0;
    for (i, candidate) in candidates.iter().enumerate() {
        if candidate.1 < candidates[best].1 {
            best = i;
        }
    }
    let (path, cost, rows, used) = candidates.swap_remove(best);

    let mut now_bound = bound.clone();
    now_bound.insert(table);
    let evaluable = terms
        .iter()
        .filter(|t| {
            scope
                .tables_of(t)
                .is_ok_and(|tables| tables.contains(&table) && tables.is_subset(&now_bound))
        })
        .count();
    let extra = evaluable.saturating_sub(used) as i32;
    Access {
        table,
        path,
        cost,
        rows: (rows * TERM_SELECTIVITY.powi(extra)).max(1.0),
    }
}

fn plan_cost(plan: &[Access]) -> f64 {
    let mut outer = 1.0;
    let mut total = 0.0;
    for access in plan {
        total += outer * access.cost;
        outer *= access.rows;
    }
    total
}

fn permute(
    scope: &Scope,
    terms: &[Expression],
    estimates: &RowEstimates,
    current: &mut Vec<Access>,
    best: &mut Option<(f64, Vec<Access>)>,
) {
    let cost = plan_cost(current);
    if best.as_ref().is_some_and(|(best_cost, _)| cost >= *best_cost) {
        return;
    }
    if current.len() == scope.len() {
        *best = Some((cost, current.clone()));
        return;
    }
    let bound: BTreeSet<usize> = current.iter().map(|a| a.table).collect();
    for table in 0..scope.len() {
        if bound.contains(&table) {
            continue;
        }
        current.push(choose_access(scope, table, &bound, terms, estimates));
        permute(scope, terms, estimates, current, best);
        current.pop();
    }
}

/// Chooses the join order and the access path of every table. The first
/// entry is the outermost loop.
pub fn plan_join(scope: &Scope, terms: &[Expression], estimates: &RowEstimates) -> Vec<Access> {
    if scope.len() <= MAX_PERMUTED_TABLES {
        let mut best = None;
        permute(scope, terms, estimates, &mut Vec::new(), &mut best);
        let plan = best.map(|(_, plan)| plan).unwrap_or_default();
        debug!(
            order = ?plan.iter().map(|a| scope.tables[a.table].name.as_str()).collect::<Vec<_>>(),
            cost = plan_cost(&plan),
            "chose join order"
        );
        return plan;
    }

    let mut plan: Vec<Access> = Vec::with_capacity(scope.len());
    let mut bound = BTreeSet::new();
    while plan.len() < scope.len() {
        let mut next: Option<Access> = None;
        for table in (0..scope.len()).filter(|t| !bound.contains(t)) {
            let access = choose_access(scope, table, &bound, terms, estimates);
            if next.as_ref().is_none_or(|n| access.cost * access.rows < n.cost * n.rows) {
                next = Some(access);
            }
        }
        let Some(access) = next else {
            break;
        };
        bound.insert(access.table);
        plan.push(access);
    }
    plan
}

#[derive(Debug, Clone, Copy)]
enum LoopKind {
    Scan { cursor: usize },
    Once,
}

/// Labels of an open loop. `next` continues with the following row.
#[derive(Debug, Clone, Copy)]
pub struct LoopHandle {
    kind: LoopKind,
    top: Label,
    pub next: Label,
    pub exit: Label,
}

fn emit_value(b: &mut ProgramBuilder, cx: &ExprContext<'_>, value: &Expression, affinity: Option<Affinity>) -> Result<()> {
    compile_expr(b, cx, value)?;
    if let Some(affinity) = affinity {
        b.emit(Insn::Affinity(affinity));
    }
    Ok(())
}

/// Emits the start of the loop for `access`. The table's cursor must
/// already be open.
pub fn open_loop(b: &mut ProgramBuilder, cx: &ExprContext<'_>, access: &Access) -> Result<LoopHandle> {
    let table = &cx.scope.tables[access.table];
    let cursor = table.cursor;
    let top = b.new_label();
    let next = b.new_label();
    let exit = b.new_label();

    let kind = match &access.path {
        AccessPath::FullScan => {
            b.emit_jump(Insn::Rewind { cursor, on_empty: 0 }, exit);
            b.bind(top);
            LoopKind::Scan { cursor }
        }
        AccessPath::RowidEq(value) => {
            compile_expr(b, cx, value)?;
            b.emit_jump(Insn::SeekRowid { cursor, on_missing: 0 }, exit);
            b.bind(top);
            LoopKind::Once
        }
        AccessPath::RowidRange { lower, upper } => {
            match lower {
                Some(lower) => {
                    compile_expr(b, cx, &lower.value)?;
                    let op = if lower.inclusive { SeekOp::Ge } else { SeekOp::Gt };
                    b.emit_jump(Insn::SeekTable { cursor, op, on_missing: 0 }, exit);
                }
                None => b.emit_jump(Insn::Rewind { cursor, on_empty: 0 }, exit),
            }
            b.bind(top);
            if let Some(upper) = upper {
                b.emit(Insn::RowId { cursor });
                emit_value(b, cx, &upper.value, Some(Affinity::Numeric))?;
                let past = if upper.inclusive {
                    BinaryOperator::GreaterThan
                } else {
                    BinaryOperator::GreaterThanOrEqual
                };
                b.emit(Insn::Binary(past));
                b.emit_jump(Insn::JumpIfTrue(0), exit);
            }
            LoopKind::Scan { cursor }
        }
        AccessPath::IndexEq { index, values } => {
            let index_cursor = b.alloc_cursor();
            b.emit(Insn::Open {
                cursor: index_cursor,
                root: Root::Page(index.root_page),
                kind: TreeKind::Index,
                write: false,
            });
            let mut cells = Vec::with_capacity(values.len());
            for (j, value) in values.iter().enumerate() {
                let affinity = table.table.columns[index.columns[j]].affinity;
                emit_value(b, cx, value, Some(affinity))?;
                let cell = b.alloc_mem();
                b.emit(Insn::Store(cell));
                b.emit(Insn::Load(cell));
                b.emit_jump(Insn::JumpIfNull(0), exit);
                cells.push(cell);
            }
            for &cell in &cells {
                b.emit(Insn::Load(cell));
            }
            b.emit_jump(
                Insn::SeekIndex {
                    cursor: index_cursor,
                    op: SeekOp::Ge,
                    argc: cells.len(),
                    on_missing: 0,
                },
                exit,
            );
            b.bind(top);
            for (j, &cell) in cells.iter().enumerate() {
                b.emit(Insn::Column {
                    cursor: index_cursor,
                    column: j,
                });
                b.emit(Insn::Load(cell));
                b.emit(Insn::Binary(BinaryOperator::NotEqual));
                b.emit_jump(Insn::JumpIfTrue(0), exit);
            }
            b.emit(Insn::RowId { cursor: index_cursor });
            b.emit_jump(Insn::SeekRowid { cursor, on_missing: 0 }, next);
            LoopKind::Scan { cursor: index_cursor }
        }
        AccessPath::IndexRange { index, lower, upper } => {
            let index_cursor = b.alloc_cursor();
            b.emit(Insn::Open {
                cursor: index_cursor,
                root: Root::Page(index.root_page),
                kind: TreeKind::Index,
                write: false,
            });
            let affinity = index
                .columns
                .first()
                .map(|&c| table.table.columns[c].affinity);
            let upper_cell = match upper {
                Some(upper) => {
                    emit_value(b, cx, &upper.value, affinity)?;
                    let cell = b.alloc_mem();
                    b.emit(Insn::Store(cell));
                    b.emit(Insn::Load(cell));
                    b.emit_jump(Insn::JumpIfNull(0), exit);
                    Some((cell, upper.inclusive))
                }
                None => None,
            };
            match lower {
                Some(lower) => {
                    emit_value(b, cx, &lower.value, affinity)?;
                    let cell = b.alloc_mem();
                    b.emit(Insn::Store(cell));
                    b.emit(Insn::Load(cell));
                    b.emit_jump(Insn::JumpIfNull(0), exit);
                    b.emit(Insn::Load(cell));
                    let op = if lower.inclusive { SeekOp::Ge } else { SeekOp::Gt };
                    b.emit_jump(
                        Insn::SeekIndex {
                            cursor: index_cursor,
                            op,
                            argc: 1,
                            on_missing: 0,
                        },
                        exit,
                    );
                }
                None => {
                    // NULLs sort first and never satisfy a range.
                    b.emit(Insn::Push(Value::Null));
                    b.emit_jump(
                        Insn::SeekIndex {
                            cursor: index_cursor,
                            op: SeekOp::Gt,
                            argc: 1,
                            on_missing: 0,
                        },
                        exit,
                    );
                }
            }
            b.bind(top);
            if let Some((cell, inclusive)) = upper_cell {
                b.emit(Insn::Column {
                    cursor: index_cursor,
                    column: 0,
                });
                b.emit(Insn::Load(cell));
                let past = if inclusive {
                    BinaryOperator::GreaterThan
                } else {
                    BinaryOperator::GreaterThanOrEqual
                };
                b.emit(Insn::Binary(past));
                b.emit_jump(Insn::JumpIfTrue(0), exit);
            }
            b.emit(Insn::RowId { cursor: index_cursor });
            b.emit_jump(Insn::SeekRowid { cursor, on_missing: 0 }, next);
            LoopKind::Scan { cursor: index_cursor }
        }
    };
    Ok(LoopHandle { kind, top, next, exit })
}

pub fn close_loop(b: &mut ProgramBuilder, handle: LoopHandle) {
    b.bind(handle.next);
    if let LoopKind::Scan { cursor } = handle.kind {
        b.emit_jump(Insn::Next { cursor, on_more: 0 }, handle.top);
    }
    b.bind(handle.exit);
}
