use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{
    planner::expression::{BinaryOperator, UnaryOperator},
    types::{
        error::{DatabaseError, Result},
        value::{Value, parse_numeric},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarFunction {
    Abs,
    Length,
    Lower,
    Upper,
    TypeOf,
    Coalesce,
    IfNull,
    /// Multi-argument `min(a, b, ...)`.
    Min,
    /// Multi-argument `max(a, b, ...)`.
    Max,
}

impl ScalarFunction {
    /// Resolves a function name and checks its arity.
    pub fn resolve(name: &str, argc: usize) -> Result<Self> {
        let (func, arity_ok) = match name {
            "abs" => (ScalarFunction::Abs, argc == 1),
            "length" => (ScalarFunction::Length, argc == 1),
            "lower" => (ScalarFunction::Lower, argc == 1),
            "upper" => (ScalarFunction::Upper, argc == 1),
            "typeof" => (ScalarFunction::TypeOf, argc == 1),
            "coalesce" => (ScalarFunction::Coalesce, argc >= 2),
            "ifnull" => (ScalarFunction::IfNull, argc == 2),
            "min" => (ScalarFunction::Min, argc >= 2),
            "max" => (ScalarFunction::Max, argc >= 2),
            _ => return Err(DatabaseError::semantic(format!("no such function: {name}"))),
        };
        if !arity_ok {
            return Err(DatabaseError::semantic(format!(
                "wrong number of arguments to function {name}()"
            )));
        }
        Ok(func)
    }

    pub fn call(self, args: Vec<Value>) -> Result<Value> {
        let mut args = args.into_iter();
        Ok(match self {
            ScalarFunction::Abs => match next_arg(&mut args) {
                Value::Null => Value::Null,
                Value::Integer(i) => Value::Integer(i.checked_abs().ok_or_else(overflow)?),
                Value::Real(r) => Value::Real(r.abs()),
                other => match to_numeric(&other) {
                    Value::Integer(i) => Value::Real(i.checked_abs().ok_or_else(overflow)? as f64),
                    Value::Real(r) => Value::Real(r.abs()),
                    _ => Value::Real(0.0),
                },
            },
            ScalarFunction::Length => match next_arg(&mut args) {
                Value::Null => Value::Null,
                Value::Text(s) => Value::Integer(s.chars().count() as i64),
                Value::Blob(b) => Value::Integer(b.len() as i64),
                other => Value::Integer(other.to_string().chars().count() as i64),
            },
            ScalarFunction::Lower => match next_arg(&mut args) {
                Value::Null => Value::Null,
                other => Value::Text(text_of(other).to_ascii_lowercase()),
            },
            ScalarFunction::Upper => match next_arg(&mut args) {
                Value::Null => Value::Null,
                other => Value::Text(text_of(other).to_ascii_uppercase()),
            },
            ScalarFunction::TypeOf => Value::Text(next_arg(&mut args).type_name().to_string()),
            ScalarFunction::Coalesce | ScalarFunction::IfNull => {
                args.find(|v| !v.is_null()).unwrap_or(Value::Null)
            }
            ScalarFunction::Min | ScalarFunction::Max => {
                let wanted = if self == ScalarFunction::Min {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                let mut best: Option<Value> = None;
                for value in args {
                    if value.is_null() {
                        return Ok(Value::Null);
                    }
                    best = match best {
                        Some(current) if value.compare(&current) != wanted => Some(current),
                        _ => Some(value),
                    };
                }
                best.unwrap_or(Value::Null)
            }
        })
    }
}

fn next_arg(args: &mut impl Iterator<Item = Value>) -> Value {
    args.next().unwrap_or(Value::Null)
}

fn overflow() -> DatabaseError {
    DatabaseError::TypeMismatch {
        details: "integer overflow".to_string(),
    }
}

fn text_of(value: Value) -> String {
    match value {
        Value::Text(s) => s,
        Value::Blob(b) => String::from_utf8_lossy(&b).into_owned(),
        other => other.to_string(),
    }
}

/// Numeric view of a value for arithmetic; non-numeric text and blobs are 0.
fn to_numeric(value: &Value) -> Value {
    match value {
        Value::Integer(_) | Value::Real(_) => value.clone(),
        Value::Text(s) => parse_numeric(s).unwrap_or(Value::Integer(0)),
        Value::Blob(b) => parse_numeric(&String::from_utf8_lossy(b)).unwrap_or(Value::Integer(0)),
        Value::Null => Value::Null,
    }
}

fn as_real(value: &Value) -> f64 {
    match value {
        Value::Integer(i) => *i as f64,
        Value::Real(r) => *r,
        _ => 0.0,
    }
}

fn real_result(r: f64) -> Value {
    if r.is_nan() { Value::Null } else { Value::Real(r) }
}

fn arithmetic(op: BinaryOperator, left: &Value, right: &Value) -> Value {
    let (l, r) = (to_numeric(left), to_numeric(right));
    if let (Value::Integer(a), Value::Integer(b)) = (&l, &r) {
        let (a, b) = (*a, *b);
        let exact = match op {
            BinaryOperator::Add => a.checked_add(b),
            BinaryOperator::Subtract => a.checked_sub(b),
            BinaryOperator::Multiply => a.checked_mul(b),
            BinaryOperator::Divide => {
                if b == 0 {
                    return Value::Null;
                }
                // i64::MIN / -1 falls through to real division.
                a.checked_div(b)
            }
            BinaryOperator::Modulo => {
                if b == 0 {
                    return Value::Null;
                }
                Some(a.checked_rem(b).unwrap_or(0))
            }
            _ => None,
        };
        if let Some(v) = exact {
            return Value::Integer(v);
        }
    }
    let (a, b) = (as_real(&l), as_real(&r));
    match op {
        BinaryOperator::Add => real_result(a + b),
        BinaryOperator::Subtract => real_result(a - b),
        BinaryOperator::Multiply => real_result(a * b),
        BinaryOperator::Divide => {
            if b == 0.0 {
                Value::Null
            } else {
                real_result(a / b)
            }
        }
        BinaryOperator::Modulo => {
            let (ia, ib) = (a as i64, b as i64);
            if ib == 0 {
                Value::Null
            } else {
                Value::Real(ia.checked_rem(ib).unwrap_or(0) as f64)
            }
        }
        _ => Value::Null,
    }
}

/// Evaluates a binary operator under SQL NULL semantics.
pub fn binary(op: BinaryOperator, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOperator::And => match (left.truthiness(), right.truthiness()) {
            (Some(false), _) | (_, Some(false)) => Value::from_bool(false),
            (Some(true), Some(true)) => Value::from_bool(true),
            _ => Value::Null,
        },
        BinaryOperator::Or => match (left.truthiness(), right.truthiness()) {
            (Some(true), _) | (_, Some(true)) => Value::from_bool(true),
            (Some(false), Some(false)) => Value::from_bool(false),
            _ => Value::Null,
        },
        BinaryOperator::Is => Value::from_bool(null_safe_equal(left, right)),
        BinaryOperator::IsNot => Value::from_bool(!null_safe_equal(left, right)),
        _ if left.is_null() || right.is_null() => Value::Null,
        BinaryOperator::Concat => {
            Value::Text(format!("{}{}", text_of(left.clone()), text_of(right.clone())))
        }
        BinaryOperator::Equal => Value::from_bool(left.compare(right) == Ordering::Equal),
        BinaryOperator::NotEqual => Value::from_bool(left.compare(right) != Ordering::Equal),
        BinaryOperator::LessThan => Value::from_bool(left.compare(right) == Ordering::Less),
        BinaryOperator::LessThanOrEqual => Value::from_bool(left.compare(right) != Ordering::Greater),
        BinaryOperator::GreaterThan => Value::from_bool(left.compare(right) == Ordering::Greater),
        BinaryOperator::GreaterThanOrEqual => Value::from_bool(left.compare(right) != Ordering::Less),
        BinaryOperator::Add
        | BinaryOperator::Subtract
        | BinaryOperator::Multiply
        | BinaryOperator::Divide
        | BinaryOperator::Modulo => arithmetic(op, left, right),
    }
}

fn null_safe_equal(left: &Value, right: &Value) -> bool {
    match (left.is_null(), right.is_null()) {
        (true, true) => true,
        (false, false) => left.compare(right) == Ordering::Equal,
        _ => false,
    }
}

pub fn unary(op: UnaryOperator, value: &Value) -> Value {
    match op {
        UnaryOperator::Not => match value.truthiness() {
            Some(b) => Value::from_bool(!b),
            None => Value::Null,
        },
        UnaryOperator::Plus => value.clone(),
        UnaryOperator::Minus => match to_numeric(value) {
            Value::Integer(i) => match i.checked_neg() {
                Some(n) => Value::Integer(n),
                None => Value::Real(-(i as f64)),
            },
            Value::Real(r) => Value::Real(-r),
            _ => Value::Null,
        },
    }
}

/// Converts a value to an integer when that loses nothing.
pub fn must_be_int(value: Value) -> Result<i64> {
    let converted = match &value {
        Value::Text(s) => parse_numeric(s),
        other => Some(other.clone()),
    };
    match converted {
        Some(Value::Integer(i)) => Ok(i),
        Some(Value::Real(r)) if r.fract() == 0.0 && r.abs() < 9.2e18 => Ok(r as i64),
        _ => Err(DatabaseError::TypeMismatch {
            details: format!("expected an integer, got {}", value.type_name()),
        }),
    }
}

/// Case-insensitive (ASCII) LIKE with `%`, `_` and an optional escape.
pub fn like(pattern: &str, subject: &str, escape: Option<char>) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let subject: Vec<char> = subject.chars().collect();
    like_from(&pattern, &subject, escape)
}

fn like_from(pattern: &[char], subject: &[char], escape: Option<char>) -> bool {
    let (mut p, mut s) = (0, 0);
    // Position to resume from after the most recent `%`.
    let mut backtrack: Option<(usize, usize)> = None;
    while s < subject.len() {
        if p < pattern.len() {
            let c = pattern[p];
            if Some(c) == escape && p + 1 < pattern.len() {
                if pattern[p + 1].eq_ignore_ascii_case(&subject[s]) {
                    p += 2;
                    s += 1;
                    continue;
                }
            } else if c == '%' {
                backtrack = Some((p, s));
                p += 1;
                continue;
            } else if c == '_' || c.eq_ignore_ascii_case(&subject[s]) {
                p += 1;
                s += 1;
                continue;
            }
        }
        match backtrack {
            Some((bp, bs)) => {
                p = bp + 1;
                s = bs + 1;
                backtrack = Some((bp, bs + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

/// Evaluates `subject LIKE pattern`, propagating NULL.
pub fn like_values(pattern: &Value, subject: &Value, escape: Option<char>) -> Value {
    if pattern.is_null() || subject.is_null() {
        return Value::Null;
    }
    let pattern = text_of(pattern.clone());
    let subject = text_of(subject.clone());
    Value::from_bool(like(&pattern, &subject, escape))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunction {
    Count,
    CountStar,
    Sum,
    Total,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn resolve(name: &str, star: bool) -> Result<Self> {
        Ok(match (name, star) {
            ("count", true) => AggregateFunction::CountStar,
            ("count", false) => AggregateFunction::Count,
            ("sum", false) => AggregateFunction::Sum,
            ("total", false) => AggregateFunction::Total,
            ("avg", false) => AggregateFunction::Avg,
            ("min", false) => AggregateFunction::Min,
            ("max", false) => AggregateFunction::Max,
            _ => return Err(DatabaseError::semantic(format!("misuse of aggregate function {name}()"))),
        })
    }
}

/// Running state of one aggregate.
#[derive(Debug, Clone, Default)]
pub struct AggState {
    count: i64,
    int_sum: i64,
    real_sum: f64,
    saw_real: bool,
    overflowed: bool,
    best: Option<Value>,
}

impl AggState {
    pub fn step(&mut self, func: AggregateFunction, arg: Option<&Value>) -> Result<()> {
        if func == AggregateFunction::CountStar {
            self.count += 1;
            return Ok(());
        }
        let value = match arg {
            Some(v) if !v.is_null() => v,
            _ => return Ok(()),
        };
        self.count += 1;
        match func {
            AggregateFunction::Sum | AggregateFunction::Total | AggregateFunction::Avg => match to_numeric(value) {
                Value::Integer(i) if !self.saw_real => {
                    match self.int_sum.checked_add(i) {
                        Some(sum) => self.int_sum = sum,
                        None => self.overflowed = true,
                    }
                    self.real_sum += i as f64;
                }
                other => {
                    self.saw_real = true;
                    self.real_sum += as_real(&other);
                }
            },
            AggregateFunction::Min | AggregateFunction::Max => {
                let wanted = if func == AggregateFunction::Min {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                let replace = match &self.best {
                    Some(best) => value.compare(best) == wanted,
                    None => true,
                };
                if replace {
                    self.best = Some(value.clone());
                }
            }
            AggregateFunction::Count | AggregateFunction::CountStar => {}
        }
        Ok(())
    }

    pub fn finalize(&self, func: AggregateFunction) -> Result<Value> {
        Ok(match func {
            AggregateFunction::Count | AggregateFunction::CountStar => Value::Integer(self.count),
            AggregateFunction::Sum => {
                if self.count == 0 {
                    Value::Null
                } else if self.saw_real {
                    Value::Real(self.real_sum)
                } else if self.overflowed {
                    return Err(overflow());
                } else {
                    Value::Integer(self.int_sum)
                }
            }
            AggregateFunction::Total => Value::Real(self.real_sum),
            AggregateFunction::Avg => {
                if self.count == 0 {
                    Value::Null
                } else {
                    Value::Real(self.real_sum / self.count as f64)
                }
            }
            AggregateFunction::Min | AggregateFunction::Max => self.best.clone().unwrap_or(Value::Null),
        })
    }
}
