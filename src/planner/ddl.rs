use tracing::debug;

use crate::{
    executor::{
        functions::ScalarFunction,
        program::{Insn, ProgramBuilder, Root},
    },
    planner::{
        compiler::Compiler,
        dml::unique_message,
        expression::BinaryOperator,
        types::{CreateIndexStatement, CreateTableStatement, DropKind, DropStatement},
    },
    storage::{
        btree::TreeKind,
        schema::{IndexSchema, SCHEMA_ROOT, SCHEMA_TABLE, SCHEMA_TABLE_ALIAS, TableSchema},
    },
    types::{
        error::{DatabaseError, Result},
        value::Value,
    },
};

const RESERVED_PREFIX: &str = "sqlite_";

fn check_reserved(name: &str) -> Result<()> {
    let reserved = name
        .get(..RESERVED_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(RESERVED_PREFIX));
    if reserved {
        return Err(DatabaseError::semantic(format!(
            "object name reserved for internal use: {name}"
        )));
    }
    Ok(())
}

fn is_schema_table(name: &str) -> bool {
    name.eq_ignore_ascii_case(SCHEMA_TABLE) || name.eq_ignore_ascii_case(SCHEMA_TABLE_ALIAS)
}

/// Opens a write cursor on the schema table.
fn open_schema_table(b: &mut ProgramBuilder) -> usize {
    let cursor = b.alloc_cursor();
    b.emit(Insn::Open {
        cursor,
        root: Root::Page(SCHEMA_ROOT),
        kind: TreeKind::Table,
        write: true,
    });
    cursor
}

/// Appends a schema table row. `root` is the memory cell holding the new
/// tree's root page.
fn emit_schema_row(b: &mut ProgramBuilder, cursor: usize, kind: &str, name: &str, table: &str, root: usize, sql: Option<&str>) {
    b.emit(Insn::NewRowid { cursor });
    b.emit(Insn::Push(Value::from(kind)));
    b.emit(Insn::Push(Value::from(name)));
    b.emit(Insn::Push(Value::from(table)));
    b.emit(Insn::Load(root));
    b.emit(Insn::Push(sql.map_or(Value::Null, Value::from)));
    b.emit(Insn::MakeRecord { argc: 5 });
    b.emit(Insn::Insert {
        cursor,
        count: false,
        last_rowid: false,
    });
}

/// Deletes every schema row whose `column` equals `name`, ignoring case.
fn emit_schema_delete(b: &mut ProgramBuilder, cursor: usize, column: usize, name: &str) {
    let top = b.new_label();
    let next = b.new_label();
    let done = b.new_label();
    b.emit_jump(Insn::Rewind { cursor, on_empty: 0 }, done);
    b.bind(top);
    b.emit(Insn::Column { cursor, column });
    b.emit(Insn::Function {
        func: ScalarFunction::Lower,
        argc: 1,
    });
    b.emit(Insn::Push(Value::from(name.to_ascii_lowercase().as_str())));
    b.emit(Insn::Binary(BinaryOperator::Equal));
    b.emit_jump(Insn::JumpIfFalse(0), next);
    b.emit(Insn::Delete { cursor, count: false });
    b.bind(next);
    b.emit_jump(Insn::Next { cursor, on_more: 0 }, top);
    b.bind(done);
}

impl Compiler<'_> {
    pub(crate) fn compile_create_table(&self, b: &mut ProgramBuilder, create: &CreateTableStatement) -> Result<()> {
        if self.schema.table_exists(&create.name) {
            if create.if_not_exists {
                return Ok(());
            }
            return Err(DatabaseError::semantic(format!("table {} already exists", create.name)));
        }
        check_reserved(&create.name)?;
        if self.schema.index(&create.name).is_some() {
            return Err(DatabaseError::semantic(format!(
                "there is already an index named {}",
                create.name
            )));
        }
        let table = TableSchema::from_statement(create, 0)?;

        b.emit(Insn::Transaction { write: true });
        let root = b.alloc_mem();
        b.emit(Insn::CreateTree {
            kind: TreeKind::Table,
            mem: root,
        });
        let index_roots: Vec<usize> = table
            .unique_keys
            .iter()
            .map(|_| {
                let mem = b.alloc_mem();
                b.emit(Insn::CreateTree {
                    kind: TreeKind::Index,
                    mem,
                });
                mem
            })
            .collect();

        let cursor = open_schema_table(b);
        emit_schema_row(b, cursor, "table", &table.name, &table.name, root, Some(&create.sql));
        for (i, &mem) in index_roots.iter().enumerate() {
            emit_schema_row(b, cursor, "index", &table.autoindex_name(i + 1), &table.name, mem, None);
        }
        b.emit(Insn::BumpSchemaCookie);
        debug!(table = %table.name, autoindexes = index_roots.len(), "compiled CREATE TABLE");
        Ok(())
    }

    pub(crate) fn compile_create_index(&self, b: &mut ProgramBuilder, create: &CreateIndexStatement) -> Result<()> {
        if self.schema.index(&create.name).is_some() {
            if create.if_not_exists {
                return Ok(());
            }
            return Err(DatabaseError::semantic(format!("index {} already exists", create.name)));
        }
        check_reserved(&create.name)?;
        if self.schema.table_exists(&create.name) {
            return Err(DatabaseError::semantic(format!(
                "there is already a table named {}",
                create.name
            )));
        }
        if is_schema_table(&create.table) {
            return Err(DatabaseError::semantic(format!("table {} may not be indexed", create.table)));
        }
        let table = self
            .schema
            .table(&create.table)
            .ok_or_else(|| DatabaseError::semantic(format!("no such table: {}", create.table)))?;
        let index = IndexSchema::from_statement(create, table, 0)?;

        b.emit(Insn::Transaction { write: true });
        let root = b.alloc_mem();
        b.emit(Insn::CreateTree {
            kind: TreeKind::Index,
            mem: root,
        });
        let schema_cursor = open_schema_table(b);
        emit_schema_row(b, schema_cursor, "index", &index.name, &table.name, root, Some(&create.sql));

        // Fill the new index from the table's existing rows.
        let table_cursor = b.alloc_cursor();
        let index_cursor = b.alloc_cursor();
        b.emit(Insn::Open {
            cursor: table_cursor,
            root: Root::Page(table.root_page),
            kind: TreeKind::Table,
            write: false,
        });
        b.emit(Insn::Open {
            cursor: index_cursor,
            root: Root::Mem(root),
            kind: TreeKind::Index,
            write: true,
        });
        let top = b.new_label();
        let done = b.new_label();
        b.emit_jump(
            Insn::Rewind {
                cursor: table_cursor,
                on_empty: 0,
            },
            done,
        );
        b.bind(top);
        for &column in &index.columns {
            if table.rowid_alias == Some(column) {
                b.emit(Insn::RowId { cursor: table_cursor });
            } else {
                b.emit(Insn::Column {
                    cursor: table_cursor,
                    column,
                });
            }
        }
        b.emit(Insn::RowId { cursor: table_cursor });
        if index.unique {
            b.emit(Insn::UniqueCheck {
                cursor: index_cursor,
                argc: index.columns.len(),
                message: unique_message(table, &index.columns),
            });
        }
        b.emit(Insn::IdxInsert {
            cursor: index_cursor,
            argc: index.columns.len() + 1,
        });
        b.emit_jump(
            Insn::Next {
                cursor: table_cursor,
                on_more: 0,
            },
            top,
        );
        b.bind(done);
        b.emit(Insn::BumpSchemaCookie);
        Ok(())
    }

    pub(crate) fn compile_drop(&self, b: &mut ProgramBuilder, drop: &DropStatement) -> Result<()> {
        match drop.kind {
            DropKind::Table => {
                if is_schema_table(&drop.name) {
                    return Err(DatabaseError::semantic(format!("table {} may not be dropped", drop.name)));
                }
                let Some(table) = self.schema.table(&drop.name) else {
                    if drop.if_exists {
                        return Ok(());
                    }
                    return Err(DatabaseError::semantic(format!("no such table: {}", drop.name)));
                };
                b.emit(Insn::Transaction { write: true });
                let cursor = open_schema_table(b);
                // Column 2 is tbl_name: the table's own row and its indexes.
                emit_schema_delete(b, cursor, 2, &table.name);
                for index in self.schema.indexes_of(&table.name) {
                    b.emit(Insn::DestroyTree {
                        root: index.root_page,
                        kind: TreeKind::Index,
                    });
                }
                b.emit(Insn::DestroyTree {
                    root: table.root_page,
                    kind: TreeKind::Table,
                });
            }
            DropKind::Index => {
                let Some(index) = self.schema.index(&drop.name) else {
                    if drop.if_exists {
                        return Ok(());
                    }
                    return Err(DatabaseError::semantic(format!("no such index: {}", drop.name)));
                };
                if index.is_automatic() {
                    return Err(DatabaseError::semantic(
                        "index associated with UNIQUE or PRIMARY KEY constraint cannot be dropped",
                    ));
                }
                b.emit(Insn::Transaction { write: true });
                let cursor = open_schema_table(b);
                emit_schema_delete(b, cursor, 1, &index.name);
                b.emit(Insn::DestroyTree {
                    root: index.root_page,
                    kind: TreeKind::Index,
                });
            }
        }
        b.emit(Insn::BumpSchemaCookie);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        executor::program::Program,
        planner::{access::RowEstimates, parser::SqlParser, types::Statement},
        storage::schema::Schema,
    };

    fn compile(schema: &Schema, sql: &str) -> Result<Program> {
        let estimates = RowEstimates::new();
        Compiler::new(schema, &estimates).compile(SqlParser::new().parse_sql(sql)?)
    }

    fn schema_with(sql: &str) -> Schema {
        let mut schema = Schema::new();
        let Statement::CreateTable(create) = SqlParser::new().parse_sql(sql).unwrap().statement else {
            panic!("not a create table");
        };
        schema.add_table(TableSchema::from_statement(&create, 2).unwrap());
        schema
    }

    #[test]
    fn test_create_table_builds_autoindexes() {
        let schema = Schema::new();
        let program = compile(&schema, "CREATE TABLE t(a TEXT PRIMARY KEY, b UNIQUE)").unwrap();
        let trees = program.insns.iter().filter(|i| matches!(i, Insn::CreateTree { .. })).count();
        assert_eq!(trees, 3);
        assert!(program.changes_schema());
        assert!(program.insns.contains(&Insn::Push(Value::from("sqlite_autoindex_t_2"))));
    }

    #[test]
    fn test_existing_objects() {
        let schema = schema_with("CREATE TABLE t(a)");
        let err = compile(&schema, "CREATE TABLE T(b)").unwrap_err();
        assert!(err.to_string().contains("table T already exists"));
        let noop = compile(&schema, "CREATE TABLE IF NOT EXISTS t(b)").unwrap();
        assert_eq!(noop.insns, vec![Insn::Halt]);
        let noop = compile(&schema, "DROP TABLE IF EXISTS missing").unwrap();
        assert_eq!(noop.insns, vec![Insn::Halt]);
        let err = compile(&schema, "CREATE TABLE sqlite_stuff(a)").unwrap_err();
        assert!(err.to_string().contains("reserved for internal use"));
        let err = compile(&schema, "DROP TABLE sqlite_master").unwrap_err();
        assert!(err.to_string().contains("may not be dropped"));
    }

    #[test]
    fn test_automatic_index_cannot_be_dropped() {
        let mut schema = schema_with("CREATE TABLE t(a UNIQUE)");
        let table = schema.table("t").unwrap().clone();
        schema.add_index(IndexSchema {
            name: table.autoindex_name(1),
            table: "t".into(),
            columns: vec![0],
            unique: true,
            root_page: 3,
            sql: None,
        });
        let err = compile(&schema, "DROP INDEX sqlite_autoindex_t_1").unwrap_err();
        assert!(err.to_string().contains("cannot be dropped"));
    }
}
