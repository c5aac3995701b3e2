mod concurrency_test;
mod recovery_test;
mod transaction_test;

use litecore::{Connection, DatabaseConfig, JournalMode, utils::mock::TempDatabase};

pub fn wal_config() -> DatabaseConfig {
    DatabaseConfig::default().with_journal_mode(JournalMode::Wal)
}

/// A database holding `CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)`.
pub fn with_table(prefix: &str, config: DatabaseConfig) -> (TempDatabase, Connection) {
    let db = TempDatabase::with_config(prefix, config);
    let mut conn = db.connect().unwrap();
    conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)", &[]).unwrap();
    (db, conn)
}

pub fn count(conn: &mut Connection, table: &str) -> i64 {
    conn.query(&format!("SELECT count(*) FROM {table}"), &[]).unwrap()[0]
        .get_i64(0)
        .unwrap()
}
