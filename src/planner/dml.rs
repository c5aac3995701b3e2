use crate::{
    executor::program::{Insn, ProgramBuilder, Root},
    planner::{
        access,
        compiler::{Compiler, ExprContext, Sink, compile_expr},
        expression::{BinaryOperator, Expression},
        scope::{ColumnTarget, Scope},
        types::{DeleteStatement, InsertSource, InsertStatement, TableRef, UpdateStatement},
    },
    storage::{
        btree::TreeKind,
        schema::{IndexSchema, SCHEMA_TABLE, SCHEMA_TABLE_ALIAS, TableSchema},
    },
    types::{
        error::{DatabaseError, Result},
        value::Value,
    },
};

const ROWID_NAMES: &[&str] = &["rowid", "oid", "_rowid_"];

/// Where the values of one inserted row come from.
enum RowSource<'a> {
    Exprs(&'a [Expression]),
    /// Columns of the current sorter entry.
    Sorter(usize),
}

fn reject_schema_table(name: &str) -> Result<()> {
    if name.eq_ignore_ascii_case(SCHEMA_TABLE) || name.eq_ignore_ascii_case(SCHEMA_TABLE_ALIAS) {
        return Err(DatabaseError::semantic(format!("table {name} may not be modified")));
    }
    Ok(())
}

fn target_of(table: &TableSchema, name: &str) -> Option<ColumnTarget> {
    match table.get_column_index(name) {
        Some(i) if table.rowid_alias == Some(i) => Some(ColumnTarget::RowId),
        Some(i) => Some(ColumnTarget::Column(i)),
        None if ROWID_NAMES.iter().any(|n| n.eq_ignore_ascii_case(name)) => Some(ColumnTarget::RowId),
        None => None,
    }
}

pub(super) fn unique_message(table: &TableSchema, columns: &[usize]) -> String {
    let names: Vec<String> = columns
        .iter()
        .map(|&c| format!("{}.{}", table.name, table.columns[c].name))
        .collect();
    format!("UNIQUE constraint failed: {}", names.join(", "))
}

fn rowid_message(table: &TableSchema) -> String {
    let column = table
        .rowid_alias
        .map_or("rowid", |alias| table.columns[alias].name.as_str());
    format!("UNIQUE constraint failed: {}.{column}", table.name)
}

/// Opens a write cursor on every index of the table.
fn open_indexes(b: &mut ProgramBuilder, indexes: Vec<IndexSchema>) -> Vec<(IndexSchema, usize)> {
    indexes
        .into_iter()
        .map(|index| {
            let cursor = b.alloc_cursor();
            b.emit(Insn::Open {
                cursor,
                root: Root::Page(index.root_page),
                kind: TreeKind::Index,
                write: true,
            });
            (index, cursor)
        })
        .collect()
}

/// Pushes the index key of a row held in memory cells: the indexed columns
/// followed by the rowid.
fn push_index_key(b: &mut ProgramBuilder, index: &IndexSchema, cells: &[usize], row_id: usize) {
    for &column in &index.columns {
        b.emit(Insn::Load(cells[column]));
    }
    b.emit(Insn::Load(row_id));
}

fn emit_not_null_checks(b: &mut ProgramBuilder, table: &TableSchema, cells: &[usize]) {
    for column in table.columns.iter().filter(|c| c.not_null) {
        if table.rowid_alias == Some(column.position) {
            continue;
        }
        b.emit(Insn::Load(cells[column.position]));
        b.emit(Insn::NotNullCheck {
            message: format!("NOT NULL constraint failed: {}.{}", table.name, column.name),
        });
        b.emit(Insn::Pop);
    }
}

fn emit_unique_checks(b: &mut ProgramBuilder, table: &TableSchema, indexes: &[(IndexSchema, usize)], cells: &[usize], row_id: usize) {
    for (index, cursor) in indexes.iter().filter(|(index, _)| index.unique) {
        push_index_key(b, index, cells, row_id);
        b.emit(Insn::UniqueCheck {
            cursor: *cursor,
            argc: index.columns.len(),
            message: unique_message(table, &index.columns),
        });
        for _ in 0..=index.columns.len() {
            b.emit(Insn::Pop);
        }
    }
}

/// Pushes the rowid and the encoded record of a row held in memory cells.
/// The rowid alias column is stored as NULL.
fn push_row(b: &mut ProgramBuilder, table: &TableSchema, cells: &[usize], row_id: usize) {
    b.emit(Insn::Load(row_id));
    for (i, &cell) in cells.iter().enumerate() {
        if table.rowid_alias == Some(i) {
            b.emit(Insn::Push(Value::Null));
        } else {
            b.emit(Insn::Load(cell));
        }
    }
    b.emit(Insn::MakeRecord { argc: cells.len() });
}

impl Compiler<'_> {
    fn writable_table(&self, name: &str) -> Result<(TableSchema, Vec<IndexSchema>)> {
        reject_schema_table(name)?;
        let table = self
            .schema
            .table(name)
            .ok_or_else(|| DatabaseError::semantic(format!("no such table: {name}")))?
            .clone();
        let indexes = self.schema.indexes_of(&table.name).cloned().collect();
        Ok((table, indexes))
    }

    pub(crate) fn compile_insert(&self, b: &mut ProgramBuilder, insert: &InsertStatement) -> Result<()> {
        let (table, indexes) = self.writable_table(&insert.table)?;
        let targets: Vec<ColumnTarget> = if insert.columns.is_empty() {
            (0..table.columns.len())
                .map(|i| {
                    if table.rowid_alias == Some(i) {
                        ColumnTarget::RowId
                    } else {
                        ColumnTarget::Column(i)
                    }
                })
                .collect()
        } else {
            insert
                .columns
                .iter()
                .map(|name| {
                    target_of(&table, name).ok_or_else(|| {
                        DatabaseError::semantic(format!("table {} has no column named {name}", table.name))
                    })
                })
                .collect::<Result<_>>()?
        };
        let arity = |values: usize| -> Result<()> {
            if values != targets.len() {
                return Err(DatabaseError::semantic(format!(
                    "{values} values for {} columns",
                    targets.len()
                )));
            }
            Ok(())
        };

        b.emit(Insn::Transaction { write: true });
        let cursor = b.alloc_cursor();
        b.emit(Insn::Open {
            cursor,
            root: Root::Page(table.root_page),
            kind: TreeKind::Table,
            write: true,
        });
        let indexes = open_indexes(b, indexes);

        match &insert.source {
            InsertSource::Values(rows) => {
                for row in rows {
                    arity(row.len())?;
                    self.emit_insert_row(b, &table, &targets, RowSource::Exprs(row), cursor, &indexes)?;
                }
            }
            InsertSource::DefaultValues => {
                self.emit_insert_row(b, &table, &[], RowSource::Exprs(&[]), cursor, &indexes)?;
            }
            InsertSource::Select(select) => {
                // Materialized first so the insert never reads its own rows.
                let sorter = b.alloc_sorter();
                b.emit(Insn::SorterOpen { sorter, order: Vec::new() });
                let columns = self.compile_select(b, select, Sink::Sorter(sorter))?;
                arity(columns.len())?;
                let top = b.new_label();
                let done = b.new_label();
                b.emit_jump(Insn::SorterSort { sorter, on_empty: 0 }, done);
                b.bind(top);
                self.emit_insert_row(b, &table, &targets, RowSource::Sorter(sorter), cursor, &indexes)?;
                b.emit_jump(Insn::SorterNext { sorter, on_more: 0 }, top);
                b.bind(done);
            }
        }
        Ok(())
    }

    fn emit_insert_row(
        &self,
        b: &mut ProgramBuilder,
        table: &TableSchema,
        targets: &[ColumnTarget],
        source: RowSource<'_>,
        cursor: usize,
        indexes: &[(IndexSchema, usize)],
    ) -> Result<()> {
        let empty = Scope::empty();
        let cx = ExprContext::row(&empty);
        let emit_value = |b: &mut ProgramBuilder, k: usize| -> Result<()> {
            match &source {
                RowSource::Exprs(exprs) => compile_expr(b, &cx, &exprs[k]),
                RowSource::Sorter(sorter) => {
                    b.emit(Insn::SorterColumn { sorter: *sorter, column: k });
                    Ok(())
                }
            }
        };

        let row_id = b.alloc_mem();
        match targets.iter().position(|t| *t == ColumnTarget::RowId) {
            Some(k) => {
                let automatic = b.new_label();
                let chosen = b.new_label();
                emit_value(b, k)?;
                b.emit(Insn::Store(row_id));
                b.emit(Insn::Load(row_id));
                b.emit_jump(Insn::JumpIfNull(0), automatic);
                b.emit(Insn::Load(row_id));
                b.emit(Insn::MustBeInt);
                b.emit(Insn::Store(row_id));
                b.emit_jump(Insn::Goto(0), chosen);
                b.bind(automatic);
                b.emit(Insn::NewRowid { cursor });
                b.emit(Insn::Store(row_id));
                b.bind(chosen);
            }
            None => {
                b.emit(Insn::NewRowid { cursor });
                b.emit(Insn::Store(row_id));
            }
        }

        let mut cells = Vec::with_capacity(table.columns.len());
        for column in &table.columns {
            let cell = b.alloc_mem();
            if table.rowid_alias == Some(column.position) {
                b.emit(Insn::Load(row_id));
            } else {
                match targets.iter().position(|t| *t == ColumnTarget::Column(column.position)) {
                    Some(k) => emit_value(b, k)?,
                    None => match &column.default {
                        Some(default) => compile_expr(b, &cx, default)?,
                        None => {
                            b.emit(Insn::Push(Value::Null));
                        }
                    },
                }
                b.emit(Insn::Affinity(column.affinity));
            }
            b.emit(Insn::Store(cell));
            cells.push(cell);
        }

        emit_not_null_checks(b, table, &cells);
        b.emit(Insn::Load(row_id));
        b.emit(Insn::RowidUniqueCheck {
            cursor,
            message: rowid_message(table),
        });
        b.emit(Insn::Pop);
        emit_unique_checks(b, table, indexes, &cells, row_id);

        for (index, index_cursor) in indexes {
            push_index_key(b, index, &cells, row_id);
            b.emit(Insn::IdxInsert {
                cursor: *index_cursor,
                argc: index.columns.len() + 1,
            });
        }
        push_row(b, table, &cells, row_id);
        b.emit(Insn::Insert {
            cursor,
            count: true,
            last_rowid: true,
        });
        Ok(())
    }

    /// First pass of UPDATE and DELETE: collects the rowids of matching rows
    /// so the second pass never walks a tree it is modifying.
    fn collect_matching_rows(&self, b: &mut ProgramBuilder, scope: &Scope, selection: Option<&Expression>) -> Result<usize> {
        let terms = selection.cloned().map(Expression::split_conjunction).unwrap_or_default();
        let plan = access::plan_join(scope, &terms, self.estimates);
        let cx = ExprContext::row(scope);
        let set = b.alloc_rowset();
        let mut handles = Vec::with_capacity(plan.len());
        for step in &plan {
            let handle = access::open_loop(b, &cx, step)?;
            for term in &terms {
                compile_expr(b, &cx, term)?;
                b.emit_jump(Insn::JumpIfFalse(0), handle.next);
            }
            handles.push(handle);
        }
        let cursor = scope.tables[0].cursor;
        b.emit(Insn::RowId { cursor });
        b.emit(Insn::RowSetAdd { set });
        for handle in handles.into_iter().rev() {
            access::close_loop(b, handle);
        }
        Ok(set)
    }

    fn open_target(&self, b: &mut ProgramBuilder, target: &TableRef) -> Result<(Scope, TableSchema, Vec<(IndexSchema, usize)>)> {
        let (table, indexes) = self.writable_table(&target.name)?;
        let mut scope = Scope::empty();
        let cursor = b.alloc_cursor();
        scope.add(self.schema, &target.name, target.alias.as_deref(), cursor)?;
        b.emit(Insn::Transaction { write: true });
        b.emit(Insn::Open {
            cursor,
            root: Root::Page(table.root_page),
            kind: TreeKind::Table,
            write: true,
        });
        let indexes = open_indexes(b, indexes);
        Ok((scope, table, indexes))
    }

    pub(crate) fn compile_update(&self, b: &mut ProgramBuilder, update: &UpdateStatement) -> Result<()> {
        let (scope, table, indexes) = self.open_target(b, &update.table)?;
        let cursor = scope.tables[0].cursor;
        let mut assignments: Vec<(ColumnTarget, &Expression)> = Vec::with_capacity(update.assignments.len());
        for (name, expr) in &update.assignments {
            let target = target_of(&table, name).ok_or_else(|| DatabaseError::semantic(format!("no such column: {name}")))?;
            // The last assignment to a column wins.
            assignments.retain(|(t, _)| *t != target);
            assignments.push((target, expr));
        }
        let set = self.collect_matching_rows(b, &scope, update.selection.as_ref())?;

        let cx = ExprContext::row(&scope);
        let top = b.new_label();
        let done = b.new_label();
        let old_row_id = b.alloc_mem();
        let new_row_id = b.alloc_mem();
        b.bind(top);
        b.emit_jump(Insn::RowSetNext { set, on_done: 0 }, done);
        b.emit(Insn::Store(old_row_id));
        b.emit(Insn::Load(old_row_id));
        b.emit_jump(Insn::SeekRowid { cursor, on_missing: 0 }, top);

        let mut old = Vec::with_capacity(table.columns.len());
        for column in &table.columns {
            let cell = b.alloc_mem();
            if table.rowid_alias == Some(column.position) {
                b.emit(Insn::Load(old_row_id));
            } else {
                b.emit(Insn::Column {
                    cursor,
                    column: column.position,
                });
            }
            b.emit(Insn::Store(cell));
            old.push(cell);
        }

        let moves_row = assignments.iter().any(|(t, _)| *t == ColumnTarget::RowId);
        match assignments.iter().find(|(t, _)| *t == ColumnTarget::RowId) {
            Some((_, expr)) => {
                compile_expr(b, &cx, expr)?;
                b.emit(Insn::MustBeInt);
            }
            None => {
                b.emit(Insn::Load(old_row_id));
            }
        }
        b.emit(Insn::Store(new_row_id));

        let mut new = Vec::with_capacity(table.columns.len());
        for column in &table.columns {
            let cell = b.alloc_mem();
            let assigned = assignments
                .iter()
                .find(|(t, _)| *t == ColumnTarget::Column(column.position));
            if table.rowid_alias == Some(column.position) {
                b.emit(Insn::Load(new_row_id));
            } else if let Some((_, expr)) = assigned {
                compile_expr(b, &cx, expr)?;
                b.emit(Insn::Affinity(column.affinity));
            } else {
                b.emit(Insn::Load(old[column.position]));
            }
            b.emit(Insn::Store(cell));
            new.push(cell);
        }

        emit_not_null_checks(b, &table, &new);
        let in_place = b.new_label();
        if moves_row {
            let same = b.new_label();
            b.emit(Insn::Load(new_row_id));
            b.emit(Insn::Load(old_row_id));
            b.emit(Insn::Binary(BinaryOperator::Equal));
            b.emit_jump(Insn::JumpIfTrue(0), same);
            b.emit(Insn::Load(new_row_id));
            b.emit(Insn::RowidUniqueCheck {
                cursor,
                message: rowid_message(&table),
            });
            b.emit(Insn::Pop);
            b.bind(same);
        }

        for (index, index_cursor) in &indexes {
            push_index_key(b, index, &old, old_row_id);
            b.emit(Insn::IdxDelete {
                cursor: *index_cursor,
                argc: index.columns.len() + 1,
            });
        }
        emit_unique_checks(b, &table, &indexes, &new, new_row_id);
        for (index, index_cursor) in &indexes {
            push_index_key(b, index, &new, new_row_id);
            b.emit(Insn::IdxInsert {
                cursor: *index_cursor,
                argc: index.columns.len() + 1,
            });
        }

        if moves_row {
            b.emit(Insn::Load(new_row_id));
            b.emit(Insn::Load(old_row_id));
            b.emit(Insn::Binary(BinaryOperator::Equal));
            b.emit_jump(Insn::JumpIfTrue(0), in_place);
            b.emit(Insn::Load(old_row_id));
            b.emit_jump(Insn::SeekRowid { cursor, on_missing: 0 }, in_place);
            b.emit(Insn::Delete { cursor, count: false });
        }
        b.bind(in_place);
        push_row(b, &table, &new, new_row_id);
        b.emit(Insn::Insert {
            cursor,
            count: true,
            last_rowid: false,
        });
        b.emit_jump(Insn::Goto(0), top);
        b.bind(done);
        Ok(())
    }

    pub(crate) fn compile_delete(&self, b: &mut ProgramBuilder, delete: &DeleteStatement) -> Result<()> {
        let (scope, table, indexes) = self.open_target(b, &delete.table)?;
        let cursor = scope.tables[0].cursor;
        let set = self.collect_matching_rows(b, &scope, delete.selection.as_ref())?;

        let top = b.new_label();
        let done = b.new_label();
        let row_id = b.alloc_mem();
        b.bind(top);
        b.emit_jump(Insn::RowSetNext { set, on_done: 0 }, done);
        b.emit(Insn::Store(row_id));
        b.emit(Insn::Load(row_id));
        b.emit_jump(Insn::SeekRowid { cursor, on_missing: 0 }, top);
        for (index, index_cursor) in &indexes {
            for &column in &index.columns {
                if table.rowid_alias == Some(column) {
                    b.emit(Insn::Load(row_id));
                } else {
                    b.emit(Insn::Column { cursor, column });
                }
            }
            b.emit(Insn::Load(row_id));
            b.emit(Insn::IdxDelete {
                cursor: *index_cursor,
                argc: index.columns.len() + 1,
            });
        }
        b.emit(Insn::Delete { cursor, count: true });
        b.emit_jump(Insn::Goto(0), top);
        b.bind(done);
        Ok(())
    }
}
