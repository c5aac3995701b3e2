use std::collections::BTreeSet;

use crate::{
    executor::program::{Insn, ProgramBuilder, Root},
    planner::{
        access::{self, LoopHandle},
        compiler::{AggregateOutput, Compiler, ExprContext, Limits, Sink, compile_expr},
        expression::Expression,
        scope::Scope,
        types::{SelectItem, SelectStatement, SortOrder},
    },
    storage::btree::TreeKind,
    types::{
        error::{DatabaseError, Result},
        value::Value,
    },
};

/// Name a result column gets when the query does not alias it.
fn column_name(expr: &Expression) -> String {
    match expr {
        Expression::Column(column) => column.column.clone(),
        other => other.to_string(),
    }
}

/// Resolves an ORDER BY term: a 1-based result position, a result alias,
/// or an expression over the FROM tables.
fn order_key(term: &Expression, items: &[SelectItem], columns: &[(Expression, String)]) -> Result<Expression> {
    match term {
        Expression::Literal(Value::Integer(position)) => {
            let index = usize::try_from(*position)
                .ok()
                .filter(|p| (1..=columns.len()).contains(p))
                .ok_or_else(|| {
                    DatabaseError::semantic(format!(
                        "ORDER BY term out of range - should be between 1 and {}",
                        columns.len()
                    ))
                })?;
            Ok(columns[index - 1].0.clone())
        }
        Expression::Column(column) if column.table.is_none() => {
            let aliased = items.iter().find_map(|item| match item {
                SelectItem::Expr { expr, alias: Some(alias) } if alias.eq_ignore_ascii_case(&column.column) => {
                    Some(expr.clone())
                }
                _ => None,
            });
            Ok(aliased.unwrap_or_else(|| term.clone()))
        }
        other => Ok(other.clone()),
    }
}

impl Compiler<'_> {
    /// Emits a SELECT. The caller starts the transaction and emits the
    /// final `Halt`; rows go to `sink`. Returns the result column names.
    pub(crate) fn compile_select(
        &self,
        b: &mut ProgramBuilder,
        select: &SelectStatement,
        sink: Sink,
    ) -> Result<Vec<String>> {
        let mut scope = Scope::empty();
        for table in &select.from {
            let cursor = b.alloc_cursor();
            scope.add(self.schema, &table.name, table.alias.as_deref(), cursor)?;
        }

        let mut columns: Vec<(Expression, String)> = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::Wildcard => columns.extend(scope.wildcard(None)?),
                SelectItem::QualifiedWildcard(table) => columns.extend(scope.wildcard(Some(table))?),
                SelectItem::Expr { expr, alias } => {
                    let name = alias.clone().unwrap_or_else(|| column_name(expr));
                    columns.push((expr.clone(), name));
                }
            }
        }
        let names = columns.iter().map(|(_, name)| name.clone()).collect();
        let exprs: Vec<&Expression> = columns.iter().map(|(e, _)| e).collect();
        let aggregate = exprs.iter().any(|e| e.contains_aggregate());

        for table in &scope.tables {
            b.emit(Insn::Open {
                cursor: table.cursor,
                root: Root::Page(table.table.root_page),
                kind: TreeKind::Table,
                write: false,
            });
        }

        let end = b.new_label();
        let limits = Limits::emit(b, select.limit.as_ref(), select.offset.as_ref(), end)?;

        // A single aggregate row has nothing to order.
        let sorter = if select.order_by.is_empty() || aggregate {
            None
        } else {
            let keys = select
                .order_by
                .iter()
                .map(|sort| order_key(&sort.expr, &select.projection, &columns))
                .collect::<Result<Vec<_>>>()?;
            let order: Vec<SortOrder> = select.order_by.iter().map(|sort| sort.order).collect();
            let sorter = b.alloc_sorter();
            b.emit(Insn::SorterOpen { sorter, order });
            Some((sorter, keys))
        };
        let aggregates = if aggregate {
            Some(AggregateOutput::collect(b, &exprs)?)
        } else {
            None
        };

        let terms = select.selection.clone().map(Expression::split_conjunction).unwrap_or_default();
        let mut pending: Vec<(&Expression, BTreeSet<usize>)> = terms
            .iter()
            .map(|term| Ok((term, scope.tables_of(term)?)))
            .collect::<Result<_>>()?;

        let row = ExprContext::row(&scope);
        let loops_done = b.new_label();
        // Terms that read no table are checked once, up front.
        for (term, _) in pending.iter().filter(|(_, tables)| tables.is_empty()) {
            compile_expr(b, &row, term)?;
            b.emit_jump(Insn::JumpIfFalse(0), loops_done);
        }
        pending.retain(|(_, tables)| !tables.is_empty());

        let plan = access::plan_join(&scope, &terms, self.estimates);
        let mut handles: Vec<LoopHandle> = Vec::with_capacity(plan.len());
        let mut bound = BTreeSet::new();
        for step in &plan {
            let handle = access::open_loop(b, &row, step)?;
            bound.insert(step.table);
            let (ready, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|(_, tables)| tables.is_subset(&bound));
            for (term, _) in ready {
                compile_expr(b, &row, term)?;
                b.emit_jump(Insn::JumpIfFalse(0), handle.next);
            }
            pending = rest;
            handles.push(handle);
        }

        match (&aggregates, &sorter) {
            (Some(output), _) => output.emit_step(b, &row)?,
            (None, Some((sorter, keys))) => {
                for key in keys {
                    compile_expr(b, &row, key)?;
                }
                for expr in &exprs {
                    compile_expr(b, &row, expr)?;
                }
                b.emit(Insn::SorterInsert {
                    sorter: *sorter,
                    argc: keys.len() + exprs.len(),
                });
            }
            (None, None) => limits.emit_output(b, sink, exprs.len(), |b| {
                for expr in &exprs {
                    compile_expr(b, &row, expr)?;
                }
                Ok(())
            })?,
        }

        for handle in handles.into_iter().rev() {
            access::close_loop(b, handle);
        }
        b.bind(loops_done);

        if let Some(output) = &aggregates {
            let cx = ExprContext {
                scope: &scope,
                aggregates: Some(output),
            };
            limits.emit_output(b, sink, exprs.len(), |b| {
                for expr in &exprs {
                    compile_expr(b, &cx, expr)?;
                }
                Ok(())
            })?;
        } else if let Some((sorter, keys)) = &sorter {
            let top = b.new_label();
            let next = b.new_label();
            b.emit_jump(
                Insn::SorterSort {
                    sorter: *sorter,
                    on_empty: 0,
                },
                end,
            );
            b.bind(top);
            let first = keys.len();
            limits.emit_output(b, sink, exprs.len(), |b| {
                for column in first..first + exprs.len() {
                    b.emit(Insn::SorterColumn {
                        sorter: *sorter,
                        column,
                    });
                }
                Ok(())
            })?;
            b.bind(next);
            b.emit_jump(
                Insn::SorterNext {
                    sorter: *sorter,
                    on_more: 0,
                },
                top,
            );
        }
        b.bind(end);
        Ok(names)
    }
}
