mod ddl_test;
mod dml_test;
mod select_test;

use litecore::{Connection, Value, utils::mock::TempDatabase};

/// Opens a fresh database and runs `setup` on it.
pub fn database(prefix: &str, setup: &str) -> (TempDatabase, Connection) {
    let db = TempDatabase::with_prefix(prefix);
    let mut conn = db.connect().unwrap();
    conn.execute_batch(setup).unwrap();
    (db, conn)
}

/// Result rows as plain value lists.
pub fn select(conn: &mut Connection, sql: &str) -> Vec<Vec<Value>> {
    conn.query(sql, &[])
        .unwrap()
        .into_iter()
        .map(|row| row.values)
        .collect()
}

/// First column of every result row as integers.
pub fn ints(conn: &mut Connection, sql: &str) -> Vec<i64> {
    conn.query(sql, &[])
        .unwrap()
        .iter()
        .map(|row| row.get_i64(0).unwrap())
        .collect()
}
