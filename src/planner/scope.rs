use std::collections::BTreeSet;

use crate::{
    planner::expression::{ColumnRef, Expression},
    storage::schema::{IndexSchema, Schema, TableSchema},
    types::{
        error::{DatabaseError, Result},
        value::Affinity,
    },
};

const ROWID_NAMES: &[&str] = &["rowid", "oid", "_rowid_"];

/// What a resolved column reference reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnTarget {
    Column(usize),
    RowId,
}

#[derive(Debug, Clone)]
pub struct ScopeTable {
    /// Name the query refers to the table by (alias or table name).
    pub name: String,
    pub table: TableSchema,
    pub indexes: Vec<IndexSchema>,
    /// VM cursor reading the table.
    pub cursor: usize,
}

impl ScopeTable {
    pub fn affinity(&self, target: ColumnTarget) -> Affinity {
        match target {
            ColumnTarget::Column(i) => self.table.columns[i].affinity,
            ColumnTarget::RowId => Affinity::Integer,
        }
    }

    pub fn target_name(&self, target: ColumnTarget) -> &str {
        match target {
            ColumnTarget::Column(i) => &self.table.columns[i].name,
            ColumnTarget::RowId => "rowid",
        }
    }
}

/// Tables visible to a statement, in FROM order.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub tables: Vec<ScopeTable>,
}

impl Scope {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adds `name` (with an optional alias) and returns its position.
    pub fn add(&mut self, schema: &Schema, name: &str, alias: Option<&str>, cursor: usize) -> Result<usize> {
        let table = schema
            .table(name)
            .ok_or_else(|| DatabaseError::semantic(format!("no such table: {name}")))?
            .clone();
        let visible = alias.unwrap_or(name).to_string();
        if self.tables.iter().any(|t| t.name.eq_ignore_ascii_case(&visible)) {
            return Err(DatabaseError::semantic(format!("ambiguous table name: {visible}")));
        }
        let indexes = schema.indexes_of(&table.name).cloned().collect();
        self.tables.push(ScopeTable {
            name: visible,
            table,
            indexes,
            cursor,
        });
        Ok(self.tables.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    fn target_in(table: &TableSchema, column: &str) -> Option<ColumnTarget> {
        match table.get_column_index(column) {
            Some(i) if table.rowid_alias == Some(i) => Some(ColumnTarget::RowId),
            Some(i) => Some(ColumnTarget::Column(i)),
            None if ROWID_NAMES.iter().any(|n| n.eq_ignore_ascii_case(column)) => Some(ColumnTarget::RowId),
            None => None,
        }
    }

    /// Resolves a column reference to a table position and target.
    pub fn resolve(&self, column: &ColumnRef) -> Result<(usize, ColumnTarget)> {
        let missing = || match &column.table {
            Some(t) => DatabaseError::semantic(format!("no such column: {t}.{}", column.column)),
            None => DatabaseError::semantic(format!("no such column: {}", column.column)),
        };
        if let Some(qualifier) = &column.table {
            let position = self
                .tables
                .iter()
                .position(|t| t.name.eq_ignore_ascii_case(qualifier))
                .ok_or_else(missing)?;
            let target = Self::target_in(&self.tables[position].table, &column.column).ok_or_else(missing)?;
            return Ok((position, target));
        }

        // Declared columns shadow the rowid names.
        let declared: Vec<usize> = self
            .tables
            .iter()
            .enumerate()
            .filter(|(_, t)| t.table.get_column_index(&column.column).is_some())
            .map(|(i, _)| i)
            .collect();
        let candidates = if declared.is_empty() {
            (0..self.tables.len())
                .filter(|&i| Self::target_in(&self.tables[i].table, &column.column).is_some())
                .collect()
        } else {
            declared
        };
        match candidates.as_slice() {
            [] => Err(missing()),
            [position] => {
                let target = Self::target_in(&self.tables[*position].table, &column.column).ok_or_else(missing)?;
                Ok((*position, target))
            }
            _ => Err(DatabaseError::semantic(format!("ambiguous column name: {}", column.column))),
        }
    }

    /// Positions of every table the expression reads.
    pub fn tables_of(&self, expr: &Expression) -> Result<BTreeSet<usize>> {
        let mut columns = Vec::new();
        expr.walk(&mut |e| {
            if let Expression::Column(c) = e {
                columns.push(c.clone());
            }
        });
        columns.iter().map(|c| Ok(self.resolve(c)?.0)).collect()
    }

    /// Affinity an expression carries into a comparison: only bare column
    /// references have one, and BLOB affinity counts as none.
    pub fn affinity_of(&self, expr: &Expression) -> Option<Affinity> {
        let Expression::Column(column) = expr else {
            return None;
        };
        let (position, target) = self.resolve(column).ok()?;
        match self.tables[position].affinity(target) {
            Affinity::Blob => None,
            affinity => Some(affinity),
        }
    }

    /// Expands `*` (or `t.*`) into column references.
    pub fn wildcard(&self, qualifier: Option<&str>) -> Result<Vec<(Expression, String)>> {
        let mut out = Vec::new();
        let mut matched = false;
        for table in &self.tables {
            if let Some(q) = qualifier {
                if !table.name.eq_ignore_ascii_case(q) {
                    continue;
                }
            }
            matched = true;
            for column in &table.table.columns {
                out.push((
                    Expression::Column(ColumnRef {
                        table: Some(table.name.clone()),
                        column: column.name.clone(),
                    }),
                    column.name.clone(),
                ));
            }
        }
        match qualifier {
            Some(q) if !matched => Err(DatabaseError::semantic(format!("no such table: {q}"))),
            None if self.tables.is_empty() => Err(DatabaseError::semantic("no tables specified")),
            _ => Ok(out),
        }
    }
}
