use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Concat,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
    Is,
    IsNot,
}

impl BinaryOperator {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Equal
                | Self::NotEqual
                | Self::LessThan
                | Self::LessThanOrEqual
                | Self::GreaterThan
                | Self::GreaterThanOrEqual
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulo => "%",
            Self::Concat => "||",
            Self::Equal => "=",
            Self::NotEqual => "<>",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Is => "IS",
            Self::IsNot => "IS NOT",
        }
    }

    /// The operator that holds when the operands are swapped.
    pub fn flipped(self) -> Self {
        match self {
            Self::LessThan => Self::GreaterThan,
            Self::LessThanOrEqual => Self::GreaterThanOrEqual,
            Self::GreaterThan => Self::LessThan,
            Self::GreaterThanOrEqual => Self::LessThanOrEqual,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryOpExpression {
    pub left: Box<Expression>,
    pub operator: BinaryOperator,
    pub right: Box<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnaryOpExpression {
    pub operator: UnaryOperator,
    pub expression: Box<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOperator {
    Not,
    Minus,
    Plus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionExpression {
    /// Lower-cased function name.
    pub name: String,
    pub args: Vec<Expression>,
    /// `count(*)`
    pub star: bool,
    pub distinct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Literal(Value),
    Column(ColumnRef),
    /// Bound parameter, 1-based.
    Parameter(usize),
    BinaryOp(BinaryOpExpression),
    UnaryOp(UnaryOpExpression),
    Function(FunctionExpression),
    IsNull {
        expr: Box<Expression>,
        negated: bool,
    },
    Between {
        expr: Box<Expression>,
        low: Box<Expression>,
        high: Box<Expression>,
        negated: bool,
    },
    InList {
        expr: Box<Expression>,
        list: Vec<Expression>,
        negated: bool,
    },
    Like {
        expr: Box<Expression>,
        pattern: Box<Expression>,
        escape: Option<char>,
        negated: bool,
    },
}

pub const AGGREGATE_FUNCTIONS: &[&str] = &["count", "sum", "total", "avg", "min", "max"];

impl Expression {
    // Built-in functions
    pub fn upper(expr: Expression) -> Self {
        Self::function("upper", vec![expr])
    }

    pub fn lower(expr: Expression) -> Self {
        Self::function("lower", vec![expr])
    }

    pub fn function(name: &str, args: Vec<Expression>) -> Self {
        Expression::Function(FunctionExpression {
            name: name.to_ascii_lowercase(),
            args,
            star: false,
            distinct: false,
        })
    }

    // Helper constructors
    pub fn column(name: &str) -> Self {
        Expression::Column(ColumnRef {
            table: None,
            column: name.to_string(),
        })
    }

    pub fn literal(value: Value) -> Self {
        Expression::Literal(value)
    }

    pub fn binary(left: Expression, operator: BinaryOperator, right: Expression) -> Self {
        Expression::BinaryOp(BinaryOpExpression {
            left: Box::new(left),
            operator,
            right: Box::new(right),
        })
    }

    pub fn eq(left: Expression, right: Expression) -> Self {
        Self::binary(left, BinaryOperator::Equal, right)
    }

    pub fn and(left: Expression, right: Expression) -> Self {
        Self::binary(left, BinaryOperator::And, right)
    }

    /// True for a call to one of the aggregate functions. `min`/`max` with
    /// more than one argument are the scalar variants.
    pub fn is_aggregate(&self) -> bool {
        match self {
            Expression::Function(f) => {
                AGGREGATE_FUNCTIONS.contains(&f.name.as_str())
                    && (f.star || f.args.len() == 1)
            }
            _ => false,
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| found |= e.is_aggregate());
        found
    }

    /// Direct sub-expressions, in evaluation order.
    pub fn children(&self) -> Vec<&Expression> {
        match self {
            Expression::Literal(_) | Expression::Column(_) | Expression::Parameter(_) => vec![],
            Expression::BinaryOp(b) => vec![b.left.as_ref(), b.right.as_ref()],
            Expression::UnaryOp(u) => vec![u.expression.as_ref()],
            Expression::Function(f) => f.args.iter().collect(),
            Expression::IsNull { expr, .. } => vec![expr.as_ref()],
            Expression::Between { expr, low, high, .. } => vec![expr.as_ref(), low.as_ref(), high.as_ref()],
            Expression::InList { expr, list, .. } => std::iter::once(expr.as_ref()).chain(list).collect(),
            Expression::Like { expr, pattern, .. } => vec![expr.as_ref(), pattern.as_ref()],
        }
    }

    /// Visits this expression and every sub-expression, parents first.
    pub fn walk(&self, visit: &mut dyn FnMut(&Expression)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }

    /// Splits a conjunction into its terms.
    pub fn split_conjunction(self) -> Vec<Expression> {
        match self {
            Expression::BinaryOp(BinaryOpExpression {
                left,
                operator: BinaryOperator::And,
                right,
            }) => {
                let mut terms = left.split_conjunction();
                terms.extend(right.split_conjunction());
                terms
            }
            other => vec![other],
        }
    }

    /// Expressions that depend on no row: literals, parameters and
    /// operators over them.
    pub fn is_constant(&self) -> bool {
        let mut constant = true;
        self.walk(&mut |e| {
            if matches!(e, Expression::Column(_)) || e.is_aggregate() {
                constant = false;
            }
        });
        constant
    }
}

/// Renders the expression as SQL text; used to name result columns.
impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(Value::Text(s)) => write!(f, "'{}'", s.replace('\'', "''")),
            Expression::Literal(value) => write!(f, "{value}"),
            Expression::Column(c) => match &c.table {
                Some(table) => write!(f, "{table}.{}", c.column),
                None => write!(f, "{}", c.column),
            },
            Expression::Parameter(n) => write!(f, "?{n}"),
            Expression::BinaryOp(b) => write!(f, "{} {} {}", b.left, b.operator.symbol(), b.right),
            Expression::UnaryOp(u) => match u.operator {
                UnaryOperator::Not => write!(f, "NOT {}", u.expression),
                UnaryOperator::Minus => write!(f, "-{}", u.expression),
                UnaryOperator::Plus => write!(f, "+{}", u.expression),
            },
            Expression::Function(func) => {
                if func.star {
                    return write!(f, "{}(*)", func.name);
                }
                write!(f, "{}(", func.name)?;
                for (i, arg) in func.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expression::IsNull { expr, negated } => {
                write!(f, "{expr} IS {}NULL", if *negated { "NOT " } else { "" })
            }
            Expression::Between { expr, low, high, negated } => write!(
                f,
                "{expr} {}BETWEEN {low} AND {high}",
                if *negated { "NOT " } else { "" }
            ),
            Expression::InList { expr, list, negated } => {
                write!(f, "{expr} {}IN (", if *negated { "NOT " } else { "" })?;
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Expression::Like { expr, pattern, negated, .. } => {
                write!(f, "{expr} {}LIKE {pattern}", if *negated { "NOT " } else { "" })
            }
        }
    }
}
