use sqlparser::{
    ast::{self as sql},
    dialect::SQLiteDialect,
    parser::Parser,
};

use crate::{
    planner::{
        expression::{
            BinaryOpExpression, BinaryOperator, ColumnRef, Expression, FunctionExpression,
            UnaryOpExpression, UnaryOperator,
        },
        types::{
            ColumnDefinition, CreateIndexStatement, CreateTableStatement, DeleteStatement, DropKind,
            DropStatement, InsertSource, InsertStatement, ParsedStatement, SelectItem, SelectStatement,
            SortExpr, SortOrder, Statement, TableRef, TransactionMode, UpdateStatement,
        },
    },
    types::{
        error::{DatabaseError, Result},
        value::Value,
    },
};

/// Splits a script into statement texts at top-level semicolons. Quotes and
/// comments are respected; blank statements are dropped.
pub fn split_statements(sql: &str) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    let mut start = 0;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                loop {
                    if i >= bytes.len() {
                        return Err(syntax("unterminated quoted text"));
                    }
                    if bytes[i] == quote {
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            b'[' => {
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            b';' => {
                push_statement(&mut statements, &sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if start < sql.len() {
        push_statement(&mut statements, &sql[start..]);
    }
    Ok(statements)
}

fn push_statement(out: &mut Vec<String>, text: &str) {
    if !words(text).is_empty() {
        out.push(text.trim().to_string());
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Lexeme {
    Word(String),
    Punct(char),
}

/// Coarse lexer used for statements handled without the SQL parser:
/// identifiers and keywords (unquoted) plus single punctuation characters.
fn words(text: &str) -> Vec<Lexeme> {
    let mut out = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            i += 2;
        } else if matches!(c, '"' | '`' | '[') {
            let close = if c == '[' { ']' } else { c };
            let mut word = String::new();
            i += 1;
            while i < chars.len() {
                if chars[i] == close {
                    if close != ']' && chars.get(i + 1) == Some(&close) {
                        word.push(close);
                        i += 2;
                        continue;
                    }
                    break;
                }
                word.push(chars[i]);
                i += 1;
            }
            i += 1;
            out.push(Lexeme::Word(word));
        } else if c.is_alphanumeric() || c == '_' {
            let begin = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            out.push(Lexeme::Word(chars[begin..i].iter().collect()));
        } else {
            out.push(Lexeme::Punct(c));
            i += 1;
        }
    }
    out
}

fn is_keyword(lexeme: Option<&Lexeme>, keyword: &str) -> bool {
    matches!(lexeme, Some(Lexeme::Word(w)) if w.eq_ignore_ascii_case(keyword))
}

fn syntax(details: impl Into<String>) -> DatabaseError {
    DatabaseError::SyntaxError {
        details: details.into(),
    }
}

fn unsupported(what: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::semantic(format!("unsupported SQL: {what}"))
}

/// Strips identifier quoting from displayed AST text.
fn unquote(text: &str) -> String {
    let text = text.trim();
    let mut chars = text.chars();
    match (chars.next(), text.chars().last()) {
        (Some(open @ ('"' | '`')), Some(close)) if open == close && text.len() >= 2 => {
            let inner = &text[1..text.len() - 1];
            inner.replace(&format!("{open}{open}"), &open.to_string())
        }
        (Some('['), Some(']')) => text[1..text.len() - 1].to_string(),
        _ => text.to_string(),
    }
}

fn object_name(name: &sql::ObjectName) -> String {
    name.0
        .last()
        .map(|part| unquote(&part.to_string()))
        .unwrap_or_default()
}

pub struct SqlParser;

impl Default for SqlParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlParser {
    pub fn new() -> Self {
        Self
    }

    /// Parses exactly one statement.
    pub fn parse_sql(&self, sql: &str) -> Result<ParsedStatement> {
        let mut statements = split_statements(sql)?;
        if statements.len() != 1 {
            return Err(DatabaseError::misuse(format!(
                "expected exactly one statement, found {}",
                statements.len()
            )));
        }
        let text = statements.remove(0);
        if let Some(statement) = parse_transaction_control(&text)? {
            return Ok(ParsedStatement {
                statement,
                parameters: Vec::new(),
            });
        }

        let dialect = SQLiteDialect {};
        let mut parsed = Parser::parse_sql(&dialect, &text)?;
        if parsed.len() != 1 {
            return Err(syntax("expected a single statement"));
        }
        let mut converter = Converter::default();
        let statement = converter.statement(parsed.remove(0), &text)?;
        Ok(ParsedStatement {
            statement,
            parameters: converter.parameters,
        })
    }
}

/// BEGIN / COMMIT / END / ROLLBACK [TO] / SAVEPOINT / RELEASE.
fn parse_transaction_control(text: &str) -> Result<Option<Statement>> {
    let lexemes = words(text);
    let mut rest = lexemes.iter().peekable();
    let Some(Lexeme::Word(first)) = rest.next() else {
        return Ok(None);
    };
    let first = first.to_ascii_uppercase();
    let name_after = |rest: &mut std::iter::Peekable<std::slice::Iter<'_, Lexeme>>| -> Result<String> {
        if is_keyword(rest.peek().copied(), "savepoint") {
            rest.next();
        }
        match rest.next() {
            Some(Lexeme::Word(name)) => Ok(name.clone()),
            _ => Err(syntax("expected savepoint name")),
        }
    };
    let statement = match first.as_str() {
        "BEGIN" => {
            let mode = match rest.peek() {
                Some(Lexeme::Word(w)) if w.eq_ignore_ascii_case("deferred") => TransactionMode::Deferred,
                Some(Lexeme::Word(w)) if w.eq_ignore_ascii_case("immediate") => TransactionMode::Immediate,
                Some(Lexeme::Word(w)) if w.eq_ignore_ascii_case("exclusive") => TransactionMode::Exclusive,
                _ => TransactionMode::Deferred,
            };
            Statement::Begin(mode)
        }
        "COMMIT" | "END" => Statement::Commit,
        "ROLLBACK" => {
            if is_keyword(rest.peek().copied(), "transaction") {
                rest.next();
            }
            if is_keyword(rest.peek().copied(), "to") {
                rest.next();
                Statement::RollbackTo(name_after(&mut rest)?)
            } else {
                Statement::Rollback
            }
        }
        "SAVEPOINT" => match rest.next() {
            Some(Lexeme::Word(name)) => Statement::Savepoint(name.clone()),
            _ => return Err(syntax("expected savepoint name")),
        },
        "RELEASE" => Statement::Release(name_after(&mut rest)?),
        _ => return Ok(None),
    };
    Ok(Some(statement))
}

/// Target table of an INSERT, read from the statement text.
fn insert_target(text: &str) -> Result<String> {
    let lexemes = words(text);
    let into = lexemes
        .iter()
        .position(|l| is_keyword(Some(l), "into"))
        .ok_or_else(|| syntax("INSERT without INTO"))?;
    let mut name = match lexemes.get(into + 1) {
        Some(Lexeme::Word(name)) => name.clone(),
        _ => return Err(syntax("expected table name after INTO")),
    };
    if lexemes.get(into + 2) == Some(&Lexeme::Punct('.')) {
        if let Some(Lexeme::Word(table)) = lexemes.get(into + 3) {
            name = table.clone();
        }
    }
    Ok(name)
}

#[derive(Default)]
struct Converter {
    parameters: Vec<Option<String>>,
}

impl Converter {
    fn statement(&mut self, statement: sql::Statement, text: &str) -> Result<Statement> {
        match statement {
            sql::Statement::Query(query) => Ok(Statement::Select(self.query(*query)?)),
            sql::Statement::CreateTable(create) => {
                if create.query.is_some() {
                    return Err(unsupported("CREATE TABLE ... AS"));
                }
                self.create_table(object_name(&create.name), create.if_not_exists, create.columns, create.constraints, text)
            }
            sql::Statement::CreateIndex(create) => {
                let name = create
                    .name
                    .as_ref()
                    .map(object_name)
                    .ok_or_else(|| syntax("index name required"))?;
                let columns = create
                    .columns
                    .iter()
                    .map(|c| match &c.expr {
                        sql::Expr::Identifier(ident) => Ok(ident.value.clone()),
                        other => Err(unsupported(format!("index on expression {other}"))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Statement::CreateIndex(CreateIndexStatement {
                    name,
                    table: object_name(&create.table_name),
                    columns,
                    unique: create.unique,
                    if_not_exists: create.if_not_exists,
                    sql: text.to_string(),
                }))
            }
            sql::Statement::Drop {
                object_type,
                if_exists,
                names,
                ..
            } => {
                let kind = match object_type {
                    sql::ObjectType::Table => DropKind::Table,
                    sql::ObjectType::Index => DropKind::Index,
                    other => return Err(unsupported(format!("DROP {other}"))),
                };
                let [name] = names.as_slice() else {
                    return Err(unsupported("DROP of several objects"));
                };
                Ok(Statement::Drop(DropStatement {
                    kind,
                    name: object_name(name),
                    if_exists,
                }))
            }
            sql::Statement::Insert(insert) => {
                if insert.or.is_some() {
                    return Err(unsupported("INSERT OR ..."));
                }
                let columns = insert.columns.iter().map(|c| c.value.clone()).collect();
                let source = match insert.source {
                    None => InsertSource::DefaultValues,
                    Some(query) => self.insert_source(*query)?,
                };
                Ok(Statement::Insert(InsertStatement {
                    table: insert_target(text)?,
                    columns,
                    source,
                }))
            }
            sql::Statement::Update {
                table,
                assignments,
                from,
                selection,
                ..
            } => {
                if from.is_some() {
                    return Err(unsupported("UPDATE ... FROM"));
                }
                let table = self.single_table(table)?;
                let assignments = assignments
                    .into_iter()
                    .map(|a| {
                        let column = match &a.target {
                            sql::AssignmentTarget::ColumnName(name) => object_name(name),
                            other => return Err(unsupported(format!("assignment to {other}"))),
                        };
                        Ok((column, self.expr(a.value)?))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Statement::Update(UpdateStatement {
                    table,
                    assignments,
                    selection: selection.map(|e| self.expr(e)).transpose()?,
                }))
            }
            sql::Statement::Delete(delete) => {
                let tables = match delete.from {
                    sql::FromTable::WithFromKeyword(tables) | sql::FromTable::WithoutKeyword(tables) => tables,
                };
                let [table] = <[sql::TableWithJoins; 1]>::try_from(tables)
                    .map_err(|_| unsupported("DELETE from several tables"))?;
                let table = self.single_table(table)?;
                Ok(Statement::Delete(DeleteStatement {
                    table,
                    selection: delete.selection.map(|e| self.expr(e)).transpose()?,
                }))
            }
            other => Err(unsupported(other)),
        }
    }

    fn create_table(
        &mut self,
        name: String,
        if_not_exists: bool,
        columns: Vec<sql::ColumnDef>,
        constraints: Vec<sql::TableConstraint>,
        text: &str,
    ) -> Result<Statement> {
        let mut definitions = Vec::with_capacity(columns.len());
        for column in columns {
            let mut definition = ColumnDefinition {
                name: column.name.value.clone(),
                declared_type: unquote(&column.data_type.to_string()),
                not_null: false,
                primary_key: false,
                unique: false,
                default: None,
            };
            for option in column.options {
                match option.option {
                    sql::ColumnOption::NotNull => definition.not_null = true,
                    sql::ColumnOption::Null => definition.not_null = false,
                    sql::ColumnOption::Default(expr) => {
                        let expr = self.expr(expr)?;
                        if !expr.is_constant() {
                            return Err(DatabaseError::semantic(format!(
                                "default value of column {} is not constant",
                                definition.name
                            )));
                        }
                        definition.default = Some(expr);
                    }
                    sql::ColumnOption::Unique { is_primary, .. } => {
                        if is_primary {
                            definition.primary_key = true;
                        } else {
                            definition.unique = true;
                        }
                    }
                    _ => {}
                }
            }
            definitions.push(definition);
        }

        let mut primary_key = Vec::new();
        let mut unique = Vec::new();
        for constraint in constraints {
            match constraint {
                sql::TableConstraint::PrimaryKey { columns, .. } => {
                    primary_key = columns.iter().map(|c| unquote(&c.to_string())).collect();
                }
                sql::TableConstraint::Unique { columns, .. } => {
                    unique.push(columns.iter().map(|c| unquote(&c.to_string())).collect());
                }
                other => return Err(unsupported(format!("table constraint {other}"))),
            }
        }

        Ok(Statement::CreateTable(CreateTableStatement {
            name,
            if_not_exists,
            columns: definitions,
            primary_key,
            unique,
            sql: text.to_string(),
        }))
    }

    fn single_table(&mut self, table: sql::TableWithJoins) -> Result<TableRef> {
        if !table.joins.is_empty() {
            return Err(unsupported("joins in UPDATE or DELETE"));
        }
        self.table_factor(table.relation)
    }

    fn table_factor(&mut self, factor: sql::TableFactor) -> Result<TableRef> {
        match factor {
            sql::TableFactor::Table { name, alias, .. } => Ok(TableRef {
                name: object_name(&name),
                alias: alias.map(|a| a.name.value),
            }),
            other => Err(unsupported(format!("table source {other}"))),
        }
    }

    fn insert_source(&mut self, query: sql::Query) -> Result<InsertSource> {
        if let sql::SetExpr::Values(values) = query.body.as_ref() {
            let rows = values
                .rows
                .iter()
                .map(|row| row.iter().cloned().map(|e| self.expr(e)).collect::<Result<Vec<_>>>())
                .collect::<Result<Vec<_>>>()?;
            return Ok(InsertSource::Values(rows));
        }
        Ok(InsertSource::Select(Box::new(self.query(query)?)))
    }

    fn query(&mut self, query: sql::Query) -> Result<SelectStatement> {
        if query.with.is_some() {
            return Err(unsupported("WITH"));
        }
        let select = match *query.body {
            sql::SetExpr::Select(select) => *select,
            sql::SetExpr::Values(values) => {
                // A bare VALUES list is a FROM-less select of its single row.
                let [row] = <[Vec<sql::Expr>; 1]>::try_from(values.rows)
                    .map_err(|_| unsupported("multi-row VALUES outside INSERT"))?;
                let projection = row
                    .into_iter()
                    .map(|e| Ok(SelectItem::Expr { expr: self.expr(e)?, alias: None }))
                    .collect::<Result<Vec<_>>>()?;
                return Ok(SelectStatement {
                    projection,
                    from: Vec::new(),
                    selection: None,
                    order_by: Vec::new(),
                    limit: None,
                    offset: None,
                });
            }
            other => return Err(unsupported(other)),
        };

        if select.distinct.is_some() {
            return Err(unsupported("DISTINCT"));
        }
        if select.having.is_some() {
            return Err(unsupported("HAVING"));
        }
        if let sql::GroupByExpr::Expressions(exprs, _) = &select.group_by {
            if !exprs.is_empty() {
                return Err(unsupported("GROUP BY"));
            }
        } else {
            return Err(unsupported("GROUP BY ALL"));
        }

        let mut from = Vec::new();
        let mut join_terms = Vec::new();
        for table in select.from {
            from.push(self.table_factor(table.relation)?);
            for join in table.joins {
                from.push(self.table_factor(join.relation)?);
                match join.join_operator {
                    sql::JoinOperator::Inner(constraint) => match constraint {
                        sql::JoinConstraint::On(expr) => join_terms.push(self.expr(expr)?),
                        sql::JoinConstraint::None => {}
                        other => return Err(unsupported(format!("join constraint {other:?}"))),
                    },
                    sql::JoinOperator::CrossJoin => {}
                    other => return Err(unsupported(format!("join {other:?}"))),
                }
            }
        }

        let mut projection = Vec::with_capacity(select.projection.len());
        for item in select.projection {
            projection.push(match item {
                sql::SelectItem::UnnamedExpr(expr) => SelectItem::Expr {
                    expr: self.expr(expr)?,
                    alias: None,
                },
                sql::SelectItem::ExprWithAlias { expr, alias } => SelectItem::Expr {
                    expr: self.expr(expr)?,
                    alias: Some(alias.value),
                },
                sql::SelectItem::Wildcard(_) => SelectItem::Wildcard,
                qualified @ sql::SelectItem::QualifiedWildcard(..) => {
                    let text = qualified.to_string();
                    let table = text.strip_suffix(".*").unwrap_or(&text);
                    SelectItem::QualifiedWildcard(unquote(table))
                }
            });
        }

        let mut selection = select.selection.map(|e| self.expr(e)).transpose()?;
        for term in join_terms {
            selection = Some(match selection {
                Some(existing) => Expression::and(term, existing),
                None => term,
            });
        }

        let order_by = match query.order_by {
            Some(order_by) => order_by
                .exprs
                .into_iter()
                .map(|o| {
                    let order = if o.asc == Some(false) {
                        SortOrder::Descending
                    } else {
                        SortOrder::Ascending
                    };
                    Ok(SortExpr::new(self.expr(o.expr)?, order))
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(SelectStatement {
            projection,
            from,
            selection,
            order_by,
            limit: query.limit.map(|e| self.expr(e)).transpose()?,
            offset: query.offset.map(|o| self.expr(o.value)).transpose()?,
        })
    }

    /// Assigns parameter slots the way the reference engine numbers them:
    /// `?` takes the next slot, `?N` slot N, and a name reuses its first slot.
    fn parameter(&mut self, placeholder: &str) -> Result<usize> {
        if placeholder == "?" {
            self.parameters.push(None);
            return Ok(self.parameters.len());
        }
        if let Some(digits) = placeholder.strip_prefix('?') {
            let index: usize = digits
                .parse()
                .map_err(|_| syntax(format!("bad parameter {placeholder}")))?;
            if index == 0 || index > 32766 {
                return Err(syntax(format!("parameter index out of range: {placeholder}")));
            }
            if self.parameters.len() < index {
                self.parameters.resize(index, None);
            }
            return Ok(index);
        }
        if let Some(existing) = self
            .parameters
            .iter()
            .position(|p| p.as_deref() == Some(placeholder))
        {
            return Ok(existing + 1);
        }
        self.parameters.push(Some(placeholder.to_string()));
        Ok(self.parameters.len())
    }

    fn value(&mut self, value: sql::Value) -> Result<Expression> {
        let literal = match value {
            sql::Value::Number(text, _) => number_literal(&text, false)?,
            sql::Value::SingleQuotedString(s) | sql::Value::DoubleQuotedString(s) => Value::Text(s),
            sql::Value::HexStringLiteral(hex) => Value::Blob(decode_hex(&hex)?),
            sql::Value::Boolean(b) => Value::from_bool(b),
            sql::Value::Null => Value::Null,
            sql::Value::Placeholder(p) => return Ok(Expression::Parameter(self.parameter(&p)?)),
            other => return Err(unsupported(format!("literal {other}"))),
        };
        Ok(Expression::Literal(literal))
    }

    fn expr(&mut self, expr: sql::Expr) -> Result<Expression> {
        Ok(match expr {
            sql::Expr::Identifier(ident) => Expression::Column(ColumnRef {
                table: None,
                column: ident.value,
            }),
            sql::Expr::CompoundIdentifier(idents) => {
                let mut parts: Vec<String> = idents.into_iter().map(|i| i.value).collect();
                let column = parts.pop().unwrap_or_default();
                Expression::Column(ColumnRef {
                    table: parts.pop(),
                    column,
                })
            }
            sql::Expr::Value(value) => self.value(value)?,
            sql::Expr::Nested(inner) => self.expr(*inner)?,
            sql::Expr::UnaryOp { op, expr } => {
                let operator = match op {
                    sql::UnaryOperator::Minus => {
                        if let sql::Expr::Value(sql::Value::Number(text, _)) = expr.as_ref() {
                            return Ok(Expression::Literal(number_literal(text, true)?));
                        }
                        UnaryOperator::Minus
                    }
                    sql::UnaryOperator::Plus => UnaryOperator::Plus,
                    sql::UnaryOperator::Not => UnaryOperator::Not,
                    other => return Err(unsupported(format!("operator {other}"))),
                };
                Expression::UnaryOp(UnaryOpExpression {
                    operator,
                    expression: Box::new(self.expr(*expr)?),
                })
            }
            sql::Expr::BinaryOp { left, op, right } => {
                let operator = match op {
                    sql::BinaryOperator::Plus => BinaryOperator::Add,
                    sql::BinaryOperator::Minus => BinaryOperator::Subtract,
                    sql::BinaryOperator::Multiply => BinaryOperator::Multiply,
                    sql::BinaryOperator::Divide => BinaryOperator::Divide,
                    sql::BinaryOperator::Modulo => BinaryOperator::Modulo,
                    sql::BinaryOperator::StringConcat => BinaryOperator::Concat,
                    sql::BinaryOperator::Eq => BinaryOperator::Equal,
                    sql::BinaryOperator::NotEq => BinaryOperator::NotEqual,
                    sql::BinaryOperator::Lt => BinaryOperator::LessThan,
                    sql::BinaryOperator::LtEq => BinaryOperator::LessThanOrEqual,
                    sql::BinaryOperator::Gt => BinaryOperator::GreaterThan,
                    sql::BinaryOperator::GtEq => BinaryOperator::GreaterThanOrEqual,
                    sql::BinaryOperator::And => BinaryOperator::And,
                    sql::BinaryOperator::Or => BinaryOperator::Or,
                    other => return Err(unsupported(format!("operator {other}"))),
                };
                Expression::BinaryOp(BinaryOpExpression {
                    left: Box::new(self.expr(*left)?),
                    operator,
                    right: Box::new(self.expr(*right)?),
                })
            }
            sql::Expr::IsDistinctFrom(left, right) => {
                Expression::binary(self.expr(*left)?, BinaryOperator::IsNot, self.expr(*right)?)
            }
            sql::Expr::IsNotDistinctFrom(left, right) => {
                Expression::binary(self.expr(*left)?, BinaryOperator::Is, self.expr(*right)?)
            }
            sql::Expr::IsNull(inner) => Expression::IsNull {
                expr: Box::new(self.expr(*inner)?),
                negated: false,
            },
            sql::Expr::IsNotNull(inner) => Expression::IsNull {
                expr: Box::new(self.expr(*inner)?),
                negated: true,
            },
            sql::Expr::Between {
                expr,
                negated,
                low,
                high,
            } => Expression::Between {
                expr: Box::new(self.expr(*expr)?),
                low: Box::new(self.expr(*low)?),
                high: Box::new(self.expr(*high)?),
                negated,
            },
            sql::Expr::InList { expr, list, negated } => Expression::InList {
                expr: Box::new(self.expr(*expr)?),
                list: list.into_iter().map(|e| self.expr(e)).collect::<Result<Vec<_>>>()?,
                negated,
            },
            sql::Expr::Like {
                negated,
                expr,
                pattern,
                escape_char,
                ..
            } => Expression::Like {
                expr: Box::new(self.expr(*expr)?),
                pattern: Box::new(self.expr(*pattern)?),
                escape: escape_char.as_ref().and_then(|c| c.to_string().chars().next()),
                negated,
            },
            sql::Expr::Function(function) => self.function(function)?,
            other => return Err(unsupported(format!("expression {other}"))),
        })
    }

    fn function(&mut self, function: sql::Function) -> Result<Expression> {
        if function.over.is_some() || function.filter.is_some() {
            return Err(unsupported("window or filtered aggregate"));
        }
        let name = object_name(&function.name).to_ascii_lowercase();
        let mut star = false;
        let mut distinct = false;
        let mut args = Vec::new();
        match function.args {
            sql::FunctionArguments::None => {}
            sql::FunctionArguments::List(list) => {
                distinct = matches!(list.duplicate_treatment, Some(sql::DuplicateTreatment::Distinct));
                for arg in list.args {
                    match arg {
                        sql::FunctionArg::Unnamed(sql::FunctionArgExpr::Expr(e)) => args.push(self.expr(e)?),
                        sql::FunctionArg::Unnamed(sql::FunctionArgExpr::Wildcard) => star = true,
                        other => return Err(unsupported(format!("function argument {other}"))),
                    }
                }
            }
            sql::FunctionArguments::Subquery(_) => return Err(unsupported("subquery argument")),
        }
        if distinct {
            return Err(unsupported("DISTINCT aggregate"));
        }
        Ok(Expression::Function(FunctionExpression {
            name,
            args,
            star,
            distinct,
        }))
    }
}

fn number_literal(text: &str, negative: bool) -> Result<Value> {
    let is_integer = text.bytes().all(|b| b.is_ascii_digit());
    if is_integer {
        if let Ok(magnitude) = text.parse::<u64>() {
            if negative && magnitude == 1u64 << 63 {
                return Ok(Value::Integer(i64::MIN));
            }
            if let Ok(n) = i64::try_from(magnitude) {
                return Ok(Value::Integer(if negative { -n } else { n }));
            }
        }
    }
    let parsed: f64 = text
        .parse()
        .map_err(|_| syntax(format!("malformed number {text}")))?;
    Ok(Value::Real(if negative { -parsed } else { parsed }))
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(syntax("blob literal has an odd number of digits"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| syntax("malformed blob literal")))
        .collect()
}
