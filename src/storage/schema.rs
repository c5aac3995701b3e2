use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    planner::{
        expression::Expression,
        parser::SqlParser,
        types::{CreateIndexStatement, CreateTableStatement, Statement},
    },
    storage::{
        btree::TreeKind,
        cursor::Cursor,
        pager::Pager,
    },
    types::{
        PageId,
        error::{DatabaseError, Result},
        row::Row,
        value::{Affinity, Value},
    },
};

pub const SCHEMA_TABLE: &str = "sqlite_schema";
pub const SCHEMA_TABLE_ALIAS: &str = "sqlite_master";
pub const SCHEMA_ROOT: PageId = 1;
const AUTOINDEX_PREFIX: &str = "sqlite_autoindex_";

/// Represents a column definition in a table schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub declared_type: String,
    pub affinity: Affinity,
    pub position: usize,
    pub not_null: bool,
    pub default: Option<Expression>,
    pub primary_key: bool,
}

impl ColumnSchema {
    pub fn new(name: String, declared_type: String, position: usize) -> Self {
        let affinity = Affinity::from_declared_type(&declared_type);
        Self {
            name,
            declared_type,
            affinity,
            position,
            not_null: false,
            default: None,
            primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn with_default(mut self, default: Expression) -> Self {
        self.default = Some(default);
        self
    }
}

/// A complete table definition as recorded in the schema table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub root_page: PageId,
    pub sql: String,
    /// Column that aliases the rowid (`INTEGER PRIMARY KEY`).
    pub rowid_alias: Option<usize>,
    /// Column sets that need an automatic unique index, in creation order.
    pub unique_keys: Vec<Vec<usize>>,
}

impl TableSchema {
    pub fn from_statement(statement: &CreateTableStatement, root_page: PageId) -> Result<Self> {
        if statement.columns.is_empty() {
            return Err(DatabaseError::semantic(format!("table {} has no columns", statement.name)));
        }
        let mut seen = HashSet::new();
        let mut columns = Vec::with_capacity(statement.columns.len());
        for (position, definition) in statement.columns.iter().enumerate() {
            if !seen.insert(definition.name.to_ascii_lowercase()) {
                return Err(DatabaseError::semantic(format!(
                    "duplicate column name: {}",
                    definition.name
                )));
            }
            let mut column = ColumnSchema::new(definition.name.clone(), definition.declared_type.clone(), position);
            column.not_null = definition.not_null;
            column.default = definition.default.clone();
            column.primary_key = definition.primary_key;
            columns.push(column);
        }

        let resolve = |names: &[String]| -> Result<Vec<usize>> {
            names
                .iter()
                .map(|name| {
                    columns
                        .iter()
                        .position(|c| c.name.eq_ignore_ascii_case(name))
                        .ok_or_else(|| DatabaseError::semantic(format!("no such column: {name}")))
                })
                .collect()
        };

        let column_pk: Vec<usize> = columns.iter().filter(|c| c.primary_key).map(|c| c.position).collect();
        let table_pk = resolve(&statement.primary_key)?;
        let table_unique = statement
            .unique
            .iter()
            .map(|names| resolve(names))
            .collect::<Result<Vec<_>>>()?;
        if (!column_pk.is_empty() && !table_pk.is_empty()) || column_pk.len() > 1 {
            return Err(DatabaseError::semantic(format!(
                "table {} has more than one primary key",
                statement.name
            )));
        }
        let primary_key = if column_pk.is_empty() { table_pk } else { column_pk };
        for &i in &primary_key {
            columns[i].primary_key = true;
        }

        let rowid_alias = match primary_key.as_slice() {
            [only] if columns[*only].declared_type.eq_ignore_ascii_case("integer") => Some(*only),
            _ => None,
        };

        let mut unique_keys = Vec::new();
        // Column constraints first, in column order, then table constraints.
        for (position, definition) in statement.columns.iter().enumerate() {
            if definition.primary_key && rowid_alias.is_none() {
                unique_keys.push(vec![position]);
            }
            if definition.unique {
                unique_keys.push(vec![position]);
            }
        }
        if !statement.primary_key.is_empty() && rowid_alias.is_none() {
            unique_keys.push(primary_key.clone());
        }
        unique_keys.extend(table_unique);

        Ok(Self {
            name: statement.name.clone(),
            columns,
            root_page,
            sql: statement.sql.clone(),
            rowid_alias,
            unique_keys,
        })
    }

    /// Get column by name
    pub fn get_column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|col| col.name.eq_ignore_ascii_case(name))
    }

    /// Get column index by name
    pub fn get_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name.eq_ignore_ascii_case(name))
    }

    /// Get all column names in order
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|col| col.name.clone()).collect()
    }

    pub fn affinities(&self) -> Vec<Affinity> {
        self.columns.iter().map(|c| c.affinity).collect()
    }

    pub fn autoindex_name(&self, n: usize) -> String {
        format!("{AUTOINDEX_PREFIX}{}_{}", self.name, n)
    }

    /// Decodes a stored row of this table.
    pub fn decode_row(&self, row_id: i64, payload: &[u8]) -> Result<Row> {
        let mut row = Row::from_bytes(row_id, payload, self.rowid_alias)?;
        // Rows written before a column existed read as NULL.
        while row.values.len() < self.columns.len() {
            row.values.push(Value::Null);
        }
        Ok(row)
    }

    fn schema_table() -> Self {
        let columns = [("type", "text"), ("name", "text"), ("tbl_name", "text"), ("rootpage", "int"), ("sql", "text")]
            .iter()
            .enumerate()
            .map(|(i, (name, ty))| ColumnSchema::new(name.to_string(), ty.to_string(), i))
            .collect();
        Self {
            name: SCHEMA_TABLE.to_string(),
            columns,
            root_page: SCHEMA_ROOT,
            sql: "CREATE TABLE sqlite_schema(type text, name text, tbl_name text, rootpage int, sql text)".to_string(),
            rowid_alias: None,
            unique_keys: Vec::new(),
        }
    }
}

/// An index over one table. The stored key is the indexed columns followed
/// by the rowid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub table: String,
    pub columns: Vec<usize>,
    pub unique: bool,
    pub root_page: PageId,
    /// `None` for automatic indexes.
    pub sql: Option<String>,
}

impl IndexSchema {
    pub fn from_statement(statement: &CreateIndexStatement, table: &TableSchema, root_page: PageId) -> Result<Self> {
        let columns = statement
            .columns
            .iter()
            .map(|name| {
                table
                    .get_column_index(name)
                    .ok_or_else(|| DatabaseError::semantic(format!("no such column: {name}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: statement.name.clone(),
            table: table.name.clone(),
            columns,
            unique: statement.unique,
            root_page,
            sql: Some(statement.sql.clone()),
        })
    }

    pub fn is_automatic(&self) -> bool {
        self.sql.is_none()
    }
}

/// In-memory image of the schema table, keyed by lower-cased names.
#[derive(Debug, Clone)]
pub struct Schema {
    pub cookie: u32,
    tables: BTreeMap<String, TableSchema>,
    indexes: BTreeMap<String, IndexSchema>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    pub fn new() -> Self {
        let mut tables = BTreeMap::new();
        tables.insert(SCHEMA_TABLE.to_string(), TableSchema::schema_table());
        Self {
            cookie: 0,
            tables,
            indexes: BTreeMap::new(),
        }
    }

    /// Reads the schema table. Needs an open read transaction.
    pub fn load(pager: &mut Pager) -> Result<Self> {
        let mut schema = Self::new();
        if pager.db_size() == 0 {
            return Ok(schema);
        }
        schema.cookie = pager.header()?.schema_cookie;

        let mut entries = Vec::new();
        let mut cursor = Cursor::new(SCHEMA_ROOT, TreeKind::Table);
        let mut more = cursor.first(pager)?;
        while more {
            let row_id = cursor.row_id(pager)?;
            let row = Row::from_bytes(row_id, cursor.payload(pager)?, None)?;
            entries.push(row);
            more = cursor.next(pager)?;
        }

        let parser = SqlParser::new();
        let text = |row: &Row, i: usize| row.get_text(i).map(str::to_string);
        let corrupt = |what: &str| DatabaseError::corrupt(SCHEMA_ROOT, format!("malformed schema entry: {what}"));

        for row in entries.iter().filter(|r| r.get_text(0) == Some("table")) {
            let sql = text(row, 4).ok_or_else(|| corrupt("table without sql"))?;
            let root = row.get_i64(3).ok_or_else(|| corrupt("table without root page"))?;
            let Statement::CreateTable(create) = parser.parse_sql(&sql)?.statement else {
                return Err(corrupt("table sql is not CREATE TABLE"));
            };
            schema.add_table(TableSchema::from_statement(&create, root as PageId)?);
        }
        for row in entries.iter().filter(|r| r.get_text(0) == Some("index")) {
            let name = text(row, 1).ok_or_else(|| corrupt("index without name"))?;
            let table_name = text(row, 2).ok_or_else(|| corrupt("index without table"))?;
            let root = row.get_i64(3).ok_or_else(|| corrupt("index without root page"))? as PageId;
            let table = schema
                .table(&table_name)
                .ok_or_else(|| corrupt("index on missing table"))?
                .clone();
            let index = match text(row, 4) {
                Some(sql) => {
                    let Statement::CreateIndex(create) = parser.parse_sql(&sql)?.statement else {
                        return Err(corrupt("index sql is not CREATE INDEX"));
                    };
                    IndexSchema::from_statement(&create, &table, root)?
                }
                None => {
                    let n: usize = name
                        .rsplit('_')
                        .next()
                        .and_then(|n| n.parse().ok())
                        .ok_or_else(|| corrupt("bad automatic index name"))?;
                    let columns = table
                        .unique_keys
                        .get(n.wrapping_sub(1))
                        .cloned()
                        .ok_or_else(|| corrupt("automatic index without constraint"))?;
                    IndexSchema {
                        name,
                        table: table.name.clone(),
                        columns,
                        unique: true,
                        root_page: root,
                        sql: None,
                    }
                }
            };
            schema.add_index(index);
        }
        debug!(
            cookie = schema.cookie,
            tables = schema.tables.len() - 1,
            indexes = schema.indexes.len(),
            "loaded schema"
        );
        Ok(schema)
    }

    pub fn add_table(&mut self, table: TableSchema) {
        self.tables.insert(table.name.to_ascii_lowercase(), table);
    }

    pub fn add_index(&mut self, index: IndexSchema) {
        self.indexes.insert(index.name.to_ascii_lowercase(), index);
    }

    pub fn remove_table(&mut self, name: &str) -> Option<TableSchema> {
        let key = name.to_ascii_lowercase();
        self.indexes.retain(|_, index| !index.table.eq_ignore_ascii_case(name));
        self.tables.remove(&key)
    }

    pub fn remove_index(&mut self, name: &str) -> Option<IndexSchema> {
        self.indexes.remove(&name.to_ascii_lowercase())
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        let key = name.to_ascii_lowercase();
        if key == SCHEMA_TABLE_ALIAS {
            return self.tables.get(SCHEMA_TABLE);
        }
        self.tables.get(&key)
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.get(&name.to_ascii_lowercase())
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// User tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values().filter(|t| t.root_page != SCHEMA_ROOT)
    }

    pub fn indexes_of<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a IndexSchema> + 'a {
        self.indexes
            .values()
            .filter(move |index| index.table.eq_ignore_ascii_case(table))
    }
}
