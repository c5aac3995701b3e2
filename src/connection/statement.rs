use std::sync::Arc;

use tracing::debug;

use crate::{
    connection::Connection,
    executor::{
        program::Program,
        vm::{StepResult, Vm, VmContext},
    },
    types::{
        error::{DatabaseError, Result},
        row::Row,
        value::Value,
    },
};

/// Recompiles allowed when the schema changes under a prepared statement.
const MAX_SCHEMA_RETRIES: usize = 5;

/// A compiled statement bound to its connection.
pub struct Statement<'c> {
    conn: &'c mut Connection,
    sql: String,
    vm: Vm,
    params: Vec<Value>,
    done: bool,
}

impl<'c> Statement<'c> {
    pub(crate) fn new(conn: &'c mut Connection, sql: String, program: Arc<Program>) -> Self {
        let params = vec![Value::Null; program.parameters.len()];
        Self {
            conn,
            sql,
            vm: Vm::new(program),
            params,
            done: false,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn column_names(&self) -> &[String] {
        &self.vm.program().column_names
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    /// 1-based index of a named parameter. The prefix may be omitted.
    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        let program = self.vm.program();
        if name.starts_with([':', '@', '$']) {
            return program.parameter_index(name);
        }
        [':', '@', '$']
            .iter()
            .find_map(|prefix| program.parameter_index(&format!("{prefix}{name}")))
    }

    pub fn program(&self) -> &Program {
        self.vm.program()
    }

    fn is_running(&self) -> bool {
        self.vm.is_started() && !self.done
    }

    /// Binds parameter `index` (1-based). A finished statement is reset
    /// first; binding mid-iteration is misuse.
    pub fn bind(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        if self.is_running() {
            return Err(DatabaseError::misuse("cannot bind parameters of a running statement"));
        }
        if self.done {
            self.reset();
        }
        let count = self.params.len();
        let slot = self
            .params
            .get_mut(index.wrapping_sub(1))
            .ok_or_else(|| DatabaseError::misuse(format!("parameter index {index} out of range (1..={count})")))?;
        *slot = value.into();
        Ok(())
    }

    pub fn bind_named(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let index = self
            .parameter_index(name)
            .ok_or_else(|| DatabaseError::misuse(format!("no parameter named {name}")))?;
        self.bind(index, value)
    }

    /// Binds `params` to slots 1..=n.
    pub fn bind_all(&mut self, params: &[Value]) -> Result<()> {
        if params.len() > self.params.len() {
            return Err(DatabaseError::misuse(format!(
                "{} parameters supplied for {} slots",
                params.len(),
                self.params.len()
            )));
        }
        for (i, value) in params.iter().enumerate() {
            self.bind(i + 1, value.clone())?;
        }
        Ok(())
    }

    pub fn clear_bindings(&mut self) {
        self.params.fill(Value::Null);
    }

    /// Runs to the next result row. `None` once the statement has finished;
    /// it stays finished until [`reset`](Self::reset).
    pub fn step(&mut self) -> Result<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        if let Some(control) = self.vm.program().control.clone() {
            self.done = true;
            self.conn.run_control(&control)?;
            return Ok(None);
        }

        let mut retries = 0;
        loop {
            let result = {
                let conn = &mut *self.conn;
                let mut ctx = VmContext {
                    pager: &mut conn.pager,
                    params: &self.params,
                    interrupt: &conn.interrupt,
                    statement_savepoint: !conn.autocommit,
                };
                self.vm.step(&mut ctx)
            };
            match result {
                Ok(StepResult::Row(values)) => return Ok(Some(Row::new(values))),
                Ok(StepResult::Done) => {
                    self.done = true;
                    self.conn.finish_statement(&self.vm)?;
                    return Ok(None);
                }
                Err(DatabaseError::SchemaChanged) if retries < MAX_SCHEMA_RETRIES => {
                    retries += 1;
                    self.conn.abort_statement(&self.vm);
                    self.conn.schema_stale = true;
                    debug!(sql = %self.sql, retries, "recompiling after schema change");
                    let program = match self.conn.compile(&self.sql) {
                        Ok(program) => program,
                        Err(e) => {
                            self.done = true;
                            return Err(e);
                        }
                    };
                    self.params.resize(program.parameters.len(), Value::Null);
                    self.vm = Vm::new(program);
                }
                Err(e) => {
                    self.done = true;
                    self.conn.abort_statement(&self.vm);
                    if matches!(e, DatabaseError::Interrupted) {
                        self.conn.clear_interrupt();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Rewinds so the statement can run again. Bindings are kept.
    pub fn reset(&mut self) {
        if self.is_running() {
            self.conn.abandon_statement(&self.vm);
        }
        self.vm.reset();
        self.done = false;
    }

    pub fn finalize(mut self) -> Result<()> {
        self.reset();
        Ok(())
    }

    pub fn rows(&mut self) -> Rows<'_, 'c> {
        Rows { statement: self }
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        if self.is_running() {
            self.conn.abandon_statement(&self.vm);
        }
    }
}

/// Result rows of a statement. Ends after the first error.
pub struct Rows<'s, 'c> {
    statement: &'s mut Statement<'c>,
}

impl Iterator for Rows<'_, '_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.statement.step().transpose()
    }
}

#[cfg(test)]
mod tests {
    use crate::{config::DatabaseConfig, connection::Engine, types::value::Value};

    #[test]
    fn test_bind_positional_and_named() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = Engine::new()
            .connect(dir.path().join("bind.db"), DatabaseConfig::default())
            .unwrap();
        conn.execute("CREATE TABLE t(a, b)", &[]).unwrap();

        let mut insert = conn.prepare("INSERT INTO t VALUES (?, :b)").unwrap();
        assert_eq!(insert.parameter_count(), 2);
        assert_eq!(insert.parameter_index("b"), Some(2));
        insert.bind(1, 10).unwrap();
        insert.bind_named(":b", "ten").unwrap();
        assert_eq!(insert.step().unwrap(), None);
        insert.bind(1, 20).unwrap();
        insert.bind_named("b", "twenty").unwrap();
        assert_eq!(insert.step().unwrap(), None);
        assert!(insert.bind(3, 0).is_err());
        insert.finalize().unwrap();

        let rows = conn.query("SELECT b FROM t WHERE a = ?", &[Value::Integer(20)]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_text(0), Some("twenty"));
    }

    #[test]
    fn test_dropped_statement_ends_read_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = Engine::new()
            .connect(dir.path().join("drop.db"), DatabaseConfig::default())
            .unwrap();
        conn.execute_batch("CREATE TABLE t(a); INSERT INTO t VALUES (1), (2), (3);")
            .unwrap();
        {
            let mut select = conn.prepare("SELECT a FROM t").unwrap();
            assert!(select.step().unwrap().is_some());
        }
        // The reader's lock is gone, so a write can start.
        conn.execute("INSERT INTO t VALUES (4)", &[]).unwrap();
        assert_eq!(conn.query("SELECT a FROM t", &[]).unwrap().len(), 4);
    }
}
