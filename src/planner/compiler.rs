//! Turns parsed statements into VM programs.

use tracing::debug;

use crate::{
    executor::{
        functions::{AggregateFunction, ScalarFunction},
        program::{Control, Insn, Label, Program, ProgramBuilder},
    },
    planner::{
        access::RowEstimates,
        expression::{BinaryOperator, Expression, UnaryOperator},
        scope::{ColumnTarget, Scope},
        types::{ParsedStatement, Statement},
    },
    storage::schema::Schema,
    types::{
        error::{DatabaseError, Result},
        value::{Affinity, Value},
    },
};

/// One aggregate call of a query and the slot accumulating it.
#[derive(Debug, Clone)]
pub struct AggregateCall {
    pub expr: Expression,
    pub func: AggregateFunction,
    pub slot: usize,
}

/// What the output row of an aggregate query reads: finalized aggregates
/// and the last value seen of each bare column.
#[derive(Debug, Clone, Default)]
pub struct AggregateOutput {
    pub calls: Vec<AggregateCall>,
    pub bare: Vec<(Expression, usize)>,
}

impl AggregateOutput {
    /// Collects the aggregate calls and bare columns of `exprs`, allocating
    /// a slot or memory cell for each distinct one.
    pub fn collect(b: &mut ProgramBuilder, exprs: &[&Expression]) -> Result<Self> {
        let mut output = Self::default();
        for expr in exprs {
            output.visit(b, expr)?;
        }
        Ok(output)
    }

    fn visit(&mut self, b: &mut ProgramBuilder, expr: &Expression) -> Result<()> {
        match expr {
            Expression::Function(f) if expr.is_aggregate() => {
                if !self.calls.iter().any(|c| &c.expr == expr) {
                    let func = AggregateFunction::resolve(&f.name, f.star)?;
                    self.calls.push(AggregateCall {
                        expr: expr.clone(),
                        func,
                        slot: b.alloc_agg(),
                    });
                }
            }
            Expression::Column(_) => {
                if !self.bare.iter().any(|(e, _)| e == expr) {
                    self.bare.push((expr.clone(), b.alloc_mem()));
                }
            }
            other => {
                for child in other.children() {
                    self.visit(b, child)?;
                }
            }
        }
        Ok(())
    }

    /// Per-row work inside the scan loop.
    pub fn emit_step(&self, b: &mut ProgramBuilder, cx: &ExprContext<'_>) -> Result<()> {
        for call in &self.calls {
            let Expression::Function(f) = &call.expr else {
                continue;
            };
            for arg in &f.args {
                compile_expr(b, cx, arg)?;
            }
            b.emit(Insn::AggStep {
                func: call.func,
                slot: call.slot,
                argc: f.args.len(),
            });
        }
        for (expr, mem) in &self.bare {
            compile_expr(b, cx, expr)?;
            b.emit(Insn::Store(*mem));
        }
        Ok(())
    }
}

/// Name resolution and evaluation mode for expression codegen.
#[derive(Clone, Copy)]
pub struct ExprContext<'a> {
    pub scope: &'a Scope,
    /// Set while emitting the output row of an aggregate query.
    pub aggregates: Option<&'a AggregateOutput>,
}

impl<'a> ExprContext<'a> {
    pub fn row(scope: &'a Scope) -> Self {
        Self {
            scope,
            aggregates: None,
        }
    }
}

fn is_numeric(affinity: Option<Affinity>) -> bool {
    matches!(affinity, Some(Affinity::Integer | Affinity::Real | Affinity::Numeric))
}

/// Affinity applied to one comparison operand given both operands'
/// affinities.
fn comparison_affinity(this: Option<Affinity>, other: Option<Affinity>) -> Option<Affinity> {
    if is_numeric(other) && !is_numeric(this) {
        Some(Affinity::Numeric)
    } else if other == Some(Affinity::Text) && this.is_none() {
        Some(Affinity::Text)
    } else {
        None
    }
}

/// Emits code that leaves the value of `expr` on the stack.
pub fn compile_expr(b: &mut ProgramBuilder, cx: &ExprContext<'_>, expr: &Expression) -> Result<()> {
    match expr {
        Expression::Literal(value) => {
            b.emit(Insn::Push(value.clone()));
        }
        Expression::Parameter(n) => {
            let slot = n
                .checked_sub(1)
                .ok_or_else(|| DatabaseError::internal("parameter numbers start at 1"))?;
            b.emit(Insn::Param(slot));
        }
        Expression::Column(column) => {
            if let Some(output) = cx.aggregates {
                if let Some((_, mem)) = output.bare.iter().find(|(e, _)| e == expr) {
                    b.emit(Insn::Load(*mem));
                    return Ok(());
                }
            }
            let (position, target) = cx.scope.resolve(column)?;
            let cursor = cx.scope.tables[position].cursor;
            match target {
                ColumnTarget::Column(column) => b.emit(Insn::Column { cursor, column }),
                ColumnTarget::RowId => b.emit(Insn::RowId { cursor }),
            };
        }
        Expression::BinaryOp(binary) => {
            let compares = binary.operator.is_comparison()
                || matches!(binary.operator, BinaryOperator::Is | BinaryOperator::IsNot);
            let (left, right) = if compares {
                let l = cx.scope.affinity_of(&binary.left);
                let r = cx.scope.affinity_of(&binary.right);
                (comparison_affinity(l, r), comparison_affinity(r, l))
            } else {
                (None, None)
            };
            compile_expr(b, cx, &binary.left)?;
            if let Some(affinity) = left {
                b.emit(Insn::Affinity(affinity));
            }
            compile_expr(b, cx, &binary.right)?;
            if let Some(affinity) = right {
                b.emit(Insn::Affinity(affinity));
            }
            b.emit(Insn::Binary(binary.operator));
        }
        Expression::UnaryOp(unary) => {
            compile_expr(b, cx, &unary.expression)?;
            b.emit(Insn::Unary(unary.operator));
        }
        Expression::Function(f) if expr.is_aggregate() => {
            let call = cx
                .aggregates
                .and_then(|output| output.calls.iter().find(|c| &c.expr == expr))
                .ok_or_else(|| DatabaseError::semantic(format!("misuse of aggregate function {}()", f.name)))?;
            b.emit(Insn::AggFinal {
                func: call.func,
                slot: call.slot,
            });
        }
        Expression::Function(f) => {
            if f.star {
                return Err(DatabaseError::semantic(format!("wrong number of arguments to function {}()", f.name)));
            }
            let func = ScalarFunction::resolve(&f.name, f.args.len())?;
            for arg in &f.args {
                compile_expr(b, cx, arg)?;
            }
            b.emit(Insn::Function {
                func,
                argc: f.args.len(),
            });
        }
        Expression::IsNull { expr, negated } => {
            compile_expr(b, cx, expr)?;
            b.emit(Insn::IsNull { negated: *negated });
        }
        Expression::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let range = Expression::and(
                Expression::binary((**expr).clone(), BinaryOperator::GreaterThanOrEqual, (**low).clone()),
                Expression::binary((**expr).clone(), BinaryOperator::LessThanOrEqual, (**high).clone()),
            );
            compile_expr(b, cx, &range)?;
            if *negated {
                b.emit(Insn::Unary(UnaryOperator::Not));
            }
        }
        Expression::InList { expr, list, negated } => {
            let mut alternatives = list.iter().map(|item| Expression::eq((**expr).clone(), item.clone()));
            let Some(first) = alternatives.next() else {
                b.emit(Insn::Push(Value::from_bool(*negated)));
                return Ok(());
            };
            let any = alternatives.fold(first, |acc, e| Expression::binary(acc, BinaryOperator::Or, e));
            compile_expr(b, cx, &any)?;
            if *negated {
                b.emit(Insn::Unary(UnaryOperator::Not));
            }
        }
        Expression::Like {
            expr,
            pattern,
            escape,
            negated,
        } => {
            compile_expr(b, cx, expr)?;
            compile_expr(b, cx, pattern)?;
            b.emit(Insn::Like {
                negated: *negated,
                escape: *escape,
            });
        }
    }
    Ok(())
}

/// Where finished result rows go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    /// Returned to the caller through `ResultRow`.
    Caller,
    /// Collected in a sorter (`INSERT ... SELECT`).
    Sorter(usize),
}

/// LIMIT and OFFSET counters of a query. `end` is where the query jumps
/// once the limit is spent.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub end: Label,
}

impl Limits {
    /// Evaluates LIMIT and OFFSET once, before any row is read.
    pub fn emit(b: &mut ProgramBuilder, limit: Option<&Expression>, offset: Option<&Expression>, end: Label) -> Result<Self> {
        let empty = Scope::empty();
        let cx = ExprContext::row(&empty);
        let counter = |b: &mut ProgramBuilder, expr: &Expression| -> Result<usize> {
            compile_expr(b, &cx, expr)?;
            b.emit(Insn::MustBeInt);
            let mem = b.alloc_mem();
            b.emit(Insn::Store(mem));
            Ok(mem)
        };
        let limit = match limit {
            Some(expr) => {
                let mem = counter(b, expr)?;
                b.emit_jump(Insn::IfZero { mem, target: 0 }, end);
                Some(mem)
            }
            None => None,
        };
        let offset = offset.map(|expr| counter(b, expr)).transpose()?;
        Ok(Self { limit, offset, end })
    }

    /// Emits one output row: skips it while OFFSET lasts, pushes `argc`
    /// values produced by `values`, hands them to the sink and counts the
    /// row against LIMIT.
    pub fn emit_output(
        &self,
        b: &mut ProgramBuilder,
        sink: Sink,
        argc: usize,
        values: impl FnOnce(&mut ProgramBuilder) -> Result<()>,
    ) -> Result<()> {
        let skip = b.new_label();
        if let Some(mem) = self.offset {
            b.emit_jump(Insn::IfPosDecr { mem, target: 0 }, skip);
        }
        values(b)?;
        match sink {
            Sink::Caller => b.emit(Insn::ResultRow { argc }),
            Sink::Sorter(sorter) => b.emit(Insn::SorterInsert { sorter, argc }),
        };
        if let Some(mem) = self.limit {
            b.emit_jump(Insn::DecrJumpZero { mem, target: 0 }, self.end);
        }
        b.bind(skip);
        Ok(())
    }
}

pub struct Compiler<'a> {
    pub(crate) schema: &'a Schema,
    pub(crate) estimates: &'a RowEstimates,
}

impl<'a> Compiler<'a> {
    pub fn new(schema: &'a Schema, estimates: &'a RowEstimates) -> Self {
        Self { schema, estimates }
    }

    pub fn compile(&self, parsed: ParsedStatement) -> Result<Program> {
        let ParsedStatement { statement, parameters } = parsed;
        let control = match &statement {
            Statement::Begin(mode) => Some(Control::Begin(*mode)),
            Statement::Commit => Some(Control::Commit),
            Statement::Rollback => Some(Control::Rollback),
            Statement::Savepoint(name) => Some(Control::Savepoint(name.clone())),
            Statement::Release(name) => Some(Control::Release(name.clone())),
            Statement::RollbackTo(name) => Some(Control::RollbackTo(name.clone())),
            _ => None,
        };
        if control.is_some() {
            return Ok(Program {
                parameters,
                schema_cookie: self.schema.cookie,
                control,
                ..Program::default()
            });
        }

        let mut b = ProgramBuilder::new();
        let columns = match &statement {
            Statement::Select(select) => {
                if !select.from.is_empty() {
                    b.emit(Insn::Transaction { write: false });
                }
                self.compile_select(&mut b, select, Sink::Caller)?
            }
            Statement::Insert(insert) => {
                self.compile_insert(&mut b, insert)?;
                Vec::new()
            }
            Statement::Update(update) => {
                self.compile_update(&mut b, update)?;
                Vec::new()
            }
            Statement::Delete(delete) => {
                self.compile_delete(&mut b, delete)?;
                Vec::new()
            }
            Statement::CreateTable(create) => {
                self.compile_create_table(&mut b, create)?;
                Vec::new()
            }
            Statement::CreateIndex(create) => {
                self.compile_create_index(&mut b, create)?;
                Vec::new()
            }
            Statement::Drop(drop) => {
                self.compile_drop(&mut b, drop)?;
                Vec::new()
            }
            other => return Err(DatabaseError::internal(format!("unexpected statement {other:?}"))),
        };
        b.emit(Insn::Halt);
        let program = b.finish(columns, parameters, self.schema.cookie);
        debug!(insns = program.insns.len(), read_only = program.is_read_only(), "compiled statement");
        Ok(program)
    }
}
