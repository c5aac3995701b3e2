//! Connections, transactions and prepared statements.

pub mod engine;
pub mod statement;

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tracing::{debug, info, warn};

pub use engine::Engine;
pub use statement::{Rows, Statement};

use crate::{
    config::DatabaseConfig,
    executor::{
        program::{Control, Program},
        vm::Vm,
    },
    planner::{
        access::RowEstimates,
        compiler::Compiler,
        parser::{SqlParser, split_statements},
        types::TransactionMode,
    },
    storage::{
        btree::{self, TreeKind},
        pager::{Pager, TransactionState},
        schema::Schema,
        shared::SharedFile,
        wal::CheckpointResult,
    },
    types::{
        RowId,
        error::{DatabaseError, Result},
        row::Row,
        value::Value,
    },
};

/// Cancels whatever statement its connection is running. Safe to use from
/// another thread.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct NamedSavepoint {
    name: String,
    depth: usize,
}

pub struct Connection {
    pager: Pager,
    schema: Schema,
    /// Set when the cached schema may no longer match the file, even if
    /// the cookie happens to agree.
    schema_stale: bool,
    estimates: RowEstimates,
    parser: SqlParser,
    autocommit: bool,
    /// The explicit transaction was started by a SAVEPOINT and ends when the
    /// outermost savepoint is released.
    savepoint_transaction: bool,
    savepoints: Vec<NamedSavepoint>,
    changes: u64,
    last_insert_rowid: RowId,
    interrupt: Arc<AtomicBool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.pager.shared().path())
            .field("autocommit", &self.autocommit)
            .field("state", &self.pager.state())
            .finish()
    }
}

impl Connection {
    /// Opens `path`. Connections opened this way share file state with each
    /// other; use [`Engine::connect`] to keep a separate registry.
    pub fn open(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        Engine::global().connect(path, config)
    }

    pub(crate) fn with_shared(shared: Arc<SharedFile>, config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        info!(path = %shared.path().display(), "connection opened");
        Ok(Self {
            pager: Pager::new(shared, &config),
            schema: Schema::new(),
            schema_stale: true,
            estimates: RowEstimates::new(),
            parser: SqlParser::new(),
            autocommit: true,
            savepoint_transaction: false,
            savepoints: Vec::new(),
            changes: 0,
            last_insert_rowid: 0,
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn shared(&self) -> &Arc<SharedFile> {
        self.pager.shared()
    }

    /// Compiles one statement.
    pub fn prepare(&mut self, sql: &str) -> Result<Statement<'_>> {
        let program = self.compile(sql)?;
        Ok(Statement::new(self, sql.to_string(), program))
    }

    /// Runs one statement to completion and returns the rows it changed.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut statement = self.prepare(sql)?;
        statement.bind_all(params)?;
        while statement.step()?.is_some() {}
        statement.finalize()?;
        Ok(self.changes)
    }

    /// Runs one statement and collects its result rows.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut statement = self.prepare(sql)?;
        statement.bind_all(params)?;
        let rows = statement.rows().collect::<Result<Vec<_>>>()?;
        statement.finalize()?;
        Ok(rows)
    }

    /// Runs every statement in `sql`, stopping at the first error.
    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        for text in split_statements(sql)? {
            let mut statement = self.prepare(&text)?;
            while statement.step()?.is_some() {}
            statement.finalize()?;
        }
        Ok(())
    }

    /// Rows changed by the most recent INSERT, UPDATE or DELETE.
    pub fn changes(&self) -> u64 {
        self.changes
    }

    /// Rowid of the most recent successful INSERT, 0 if there was none.
    pub fn last_insert_rowid(&self) -> RowId {
        self.last_insert_rowid
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: Arc::clone(&self.interrupt),
        }
    }

    pub fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn set_busy_timeout(&mut self, timeout: Duration) {
        self.pager.set_busy_timeout(timeout);
    }

    pub fn begin(&mut self, mode: TransactionMode) -> Result<()> {
        self.run_control(&Control::Begin(mode))
    }

    pub fn commit(&mut self) -> Result<()> {
        self.run_control(&Control::Commit)
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.run_control(&Control::Rollback)
    }

    pub fn savepoint(&mut self, name: &str) -> Result<()> {
        self.run_control(&Control::Savepoint(name.to_string()))
    }

    pub fn release(&mut self, name: &str) -> Result<()> {
        self.run_control(&Control::Release(name.to_string()))
    }

    pub fn rollback_to(&mut self, name: &str) -> Result<()> {
        self.run_control(&Control::RollbackTo(name.to_string()))
    }

    /// Copies the write-ahead log into the database file.
    pub fn checkpoint(&mut self) -> Result<CheckpointResult> {
        let result = self.pager.checkpoint()?;
        info!(
            frames = result.log_frames,
            backfilled = result.backfilled,
            reset = result.reset,
            "checkpoint"
        );
        Ok(result)
    }

    /// Counts every table's rows so the planner can cost access paths.
    pub fn analyze(&mut self) -> Result<()> {
        self.refresh_schema()?;
        self.with_read_transaction(|conn| {
            let mut estimates = RowEstimates::new();
            if conn.pager.db_size() > 0 {
                for table in conn.schema.tables() {
                    let rows = btree::count_entries(&mut conn.pager, table.root_page, TreeKind::Table)?;
                    estimates.insert(table.name.to_ascii_lowercase(), rows);
                }
            }
            debug!(tables = estimates.len(), "refreshed row estimates");
            conn.estimates = estimates;
            Ok(())
        })
    }

    /// Row count recorded for `table` by the last [`analyze`](Self::analyze).
    pub fn row_estimate(&self, table: &str) -> Option<u64> {
        self.estimates.get(&table.to_ascii_lowercase()).copied()
    }

    /// Closes the connection, rolling back an open transaction.
    pub fn close(mut self) -> Result<()> {
        if self.pager.state() != TransactionState::None {
            warn!("closing connection with an open transaction; rolling back");
            self.pager.rollback()?;
        }
        Ok(())
    }

    fn compile(&mut self, sql: &str) -> Result<Arc<Program>> {
        let parsed = self.parser.parse_sql(sql)?;
        if !parsed.statement.is_transaction_control() {
            self.refresh_schema()?;
        }
        let program = Compiler::new(&self.schema, &self.estimates).compile(parsed)?;
        Ok(Arc::new(program))
    }

    /// Runs `f` inside a read transaction, opening (and ending) one if the
    /// connection has none.
    fn with_read_transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.pager.state() != TransactionState::None {
            return f(self);
        }
        self.pager.begin_read()?;
        let result = f(self);
        match self.pager.commit() {
            Ok(()) => result,
            Err(e) => result.and(Err(e)),
        }
    }

    /// Reloads the schema when another statement or connection changed it.
    fn refresh_schema(&mut self) -> Result<()> {
        self.with_read_transaction(|conn| {
            let cookie = if conn.pager.db_size() > 0 {
                conn.pager.header()?.schema_cookie
            } else {
                0
            };
            if conn.schema_stale || cookie != conn.schema.cookie {
                conn.schema = Schema::load(&mut conn.pager)?;
                conn.schema_stale = false;
            }
            Ok(())
        })
    }

    /// Transaction bookkeeping after a statement ran to completion.
    fn finish_statement(&mut self, vm: &Vm) -> Result<()> {
        let program = vm.program();
        if !program.is_read_only() && !program.changes_schema() {
            self.changes = vm.changes();
        }
        if let Some(row_id) = vm.last_insert_rowid() {
            self.last_insert_rowid = row_id;
        }
        if program.changes_schema() {
            self.schema_stale = true;
        }
        if self.autocommit {
            if let Err(e) = self.pager.commit() {
                warn!(error = %e, "autocommit failed; rolling back");
                self.rollback_quietly();
                return Err(e);
            }
        } else if let Some(depth) = vm.statement_savepoint() {
            self.pager.release_savepoint(depth);
        }
        Ok(())
    }

    /// Undoes a failed statement: the whole transaction in autocommit mode,
    /// only the statement's own changes inside an explicit transaction.
    fn abort_statement(&mut self, vm: &Vm) {
        if self.autocommit {
            self.rollback_quietly();
        } else if let Some(depth) = vm.statement_savepoint() {
            if let Err(e) = self.pager.rollback_to_savepoint(depth) {
                warn!(error = %e, "statement rollback failed");
            }
            self.pager.release_savepoint(depth);
            self.schema_stale = true;
        }
    }

    /// Ends the transaction of a statement abandoned before completion.
    fn abandon_statement(&mut self, vm: &Vm) {
        if self.autocommit {
            match self.pager.state() {
                TransactionState::Write => self.rollback_quietly(),
                _ => {
                    if let Err(e) = self.pager.commit() {
                        warn!(error = %e, "could not end read transaction");
                    }
                }
            }
        } else if let Some(depth) = vm.statement_savepoint() {
            self.pager.release_savepoint(depth);
        }
    }

    fn rollback_quietly(&mut self) {
        if let Err(e) = self.pager.rollback() {
            warn!(error = %e, "rollback failed");
        }
        self.schema_stale = true;
    }

    fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::Relaxed);
    }

    fn savepoint_position(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|sp| sp.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DatabaseError::semantic(format!("no such savepoint: {name}")))
    }

    fn end_explicit_transaction(&mut self) {
        self.autocommit = true;
        self.savepoint_transaction = false;
        self.savepoints.clear();
    }

    pub(crate) fn run_control(&mut self, control: &Control) -> Result<()> {
        match control {
            Control::Begin(mode) => {
                if !self.autocommit {
                    return Err(DatabaseError::misuse("cannot start a transaction within a transaction"));
                }
                if *mode != TransactionMode::Deferred {
                    self.pager.begin_write()?;
                }
                self.autocommit = false;
                debug!(?mode, "transaction started");
            }
            Control::Commit => {
                if self.autocommit {
                    return Err(DatabaseError::misuse("cannot commit - no transaction is active"));
                }
                // On Busy the transaction stays open so COMMIT can be retried.
                self.pager.commit()?;
                self.end_explicit_transaction();
                debug!("transaction committed");
            }
            Control::Rollback => {
                if self.autocommit {
                    return Err(DatabaseError::misuse("cannot rollback - no transaction is active"));
                }
                self.end_explicit_transaction();
                self.schema_stale = true;
                self.pager.rollback()?;
                debug!("transaction rolled back");
            }
            Control::Savepoint(name) => {
                let starts_transaction = self.autocommit;
                self.pager.begin_write()?;
                let depth = match self.pager.open_savepoint() {
                    Ok(depth) => depth,
                    Err(e) => {
                        if starts_transaction {
                            self.rollback_quietly();
                        }
                        return Err(e);
                    }
                };
                if starts_transaction {
                    self.autocommit = false;
                    self.savepoint_transaction = true;
                }
                self.savepoints.push(NamedSavepoint {
                    name: name.clone(),
                    depth,
                });
                debug!(name, depth, "savepoint opened");
            }
            Control::Release(name) => {
                let position = self.savepoint_position(name)?;
                if position == 0 && self.savepoint_transaction {
                    self.pager.commit()?;
                    self.end_explicit_transaction();
                    debug!(name, "outermost savepoint released; transaction committed");
                    return Ok(());
                }
                self.pager.release_savepoint(self.savepoints[position].depth);
                self.savepoints.truncate(position);
                debug!(name, "savepoint released");
            }
            Control::RollbackTo(name) => {
                let position = self.savepoint_position(name)?;
                self.pager.rollback_to_savepoint(self.savepoints[position].depth)?;
                self.savepoints.truncate(position + 1);
                self.schema_stale = true;
                debug!(name, "rolled back to savepoint");
            }
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.pager.state() != TransactionState::None {
            if let Err(e) = self.pager.rollback() {
                warn!(error = %e, "rollback on drop failed");
            }
        }
    }
}
