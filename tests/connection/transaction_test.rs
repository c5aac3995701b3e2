use litecore::{DatabaseConfig, DatabaseError, Row, TransactionMode, Value};

use crate::{count, with_table};

fn values(conn: &mut litecore::Connection, sql: &str) -> Vec<Value> {
    conn.query(sql, &[])
        .unwrap()
        .into_iter()
        .map(|mut row| row.values.remove(0))
        .collect()
}

#[test]
fn test_insert_select_delete_round_trip() -> Result<(), DatabaseError> {
    let (_db, mut conn) = with_table("txn_round_trip", DatabaseConfig::default());

    conn.execute("INSERT INTO t VALUES (1, 'a'), (2, 'b'), (3, 'c')", &[])?;
    assert_eq!(conn.changes(), 3);
    let rows = conn.query("SELECT v FROM t WHERE id = 2", &[])?;
    assert_eq!(rows, vec![Row::new(vec![Value::from("b")])]);

    assert_eq!(conn.execute("DELETE FROM t WHERE id = 2", &[])?, 1);
    assert!(conn.query("SELECT v FROM t WHERE id = 2", &[])?.is_empty());
    // Queries leave the change count alone.
    assert_eq!(conn.changes(), 1);
    assert_eq!(values(&mut conn, "SELECT id FROM t ORDER BY id"), vec![Value::Integer(1), Value::Integer(3)]);
    Ok(())
}

#[test]
fn test_commit_and_rollback_through_sql() -> Result<(), DatabaseError> {
    let (_db, mut conn) = with_table("txn_sql", DatabaseConfig::default());

    conn.execute("BEGIN", &[])?;
    assert!(!conn.is_autocommit());
    conn.execute("INSERT INTO t(v) VALUES ('kept')", &[])?;
    conn.execute("COMMIT", &[])?;
    assert!(conn.is_autocommit());

    conn.execute("BEGIN IMMEDIATE TRANSACTION", &[])?;
    conn.execute("INSERT INTO t(v) VALUES ('dropped')", &[])?;
    // Uncommitted changes are visible to their own transaction.
    assert_eq!(count(&mut conn, "t"), 2);
    conn.execute("ROLLBACK", &[])?;
    assert_eq!(values(&mut conn, "SELECT v FROM t"), vec![Value::from("kept")]);

    conn.execute_batch("BEGIN; INSERT INTO t(v) VALUES ('ended'); END;")?;
    assert_eq!(count(&mut conn, "t"), 2);

    let err = conn.execute("COMMIT", &[]).unwrap_err();
    assert!(err.to_string().contains("no transaction is active"));
    Ok(())
}

#[test]
fn test_failed_statement_keeps_transaction() -> Result<(), DatabaseError> {
    let (_db, mut conn) = with_table("txn_statement_error", DatabaseConfig::default());

    conn.begin(TransactionMode::Deferred)?;
    conn.execute("INSERT INTO t VALUES (1, 'one')", &[])?;
    conn.execute("INSERT INTO t VALUES (5, 'five')", &[])?;
    // The second row collides, so neither row of this statement is kept.
    let err = conn.execute("INSERT INTO t VALUES (6, 'six'), (1, 'again')", &[]).unwrap_err();
    assert!(matches!(err, DatabaseError::ConstraintViolation { .. }));
    assert!(!conn.is_autocommit());
    assert_eq!(values(&mut conn, "SELECT id FROM t ORDER BY id"), vec![Value::Integer(1), Value::Integer(5)]);

    conn.execute("UPDATE t SET v = 'FIVE' WHERE id = 5", &[])?;
    conn.commit()?;
    assert_eq!(values(&mut conn, "SELECT v FROM t ORDER BY id"), vec![Value::from("one"), Value::from("FIVE")]);
    Ok(())
}

#[test]
fn test_nested_savepoints() -> Result<(), DatabaseError> {
    let (_db, mut conn) = with_table("txn_savepoints", DatabaseConfig::default());

    conn.execute("BEGIN", &[])?;
    conn.execute("INSERT INTO t VALUES (1, 'a')", &[])?;
    conn.execute("SAVEPOINT a", &[])?;
    conn.execute("INSERT INTO t VALUES (2, 'b')", &[])?;
    conn.execute("SAVEPOINT b", &[])?;
    conn.execute("INSERT INTO t VALUES (3, 'c')", &[])?;
    assert_eq!(count(&mut conn, "t"), 3);

    conn.execute("ROLLBACK TO a", &[])?;
    assert_eq!(count(&mut conn, "t"), 1);
    // Rolling back to a savepoint keeps it; `b` is gone.
    assert!(conn.release("b").unwrap_err().to_string().contains("no such savepoint: b"));
    conn.execute("INSERT INTO t VALUES (4, 'd')", &[])?;
    conn.execute("ROLLBACK TO SAVEPOINT a", &[])?;
    conn.execute("INSERT INTO t VALUES (5, 'e')", &[])?;
    conn.execute("RELEASE SAVEPOINT a", &[])?;
    assert!(!conn.is_autocommit());
    conn.execute("COMMIT", &[])?;

    assert_eq!(values(&mut conn, "SELECT id FROM t ORDER BY id"), vec![Value::Integer(1), Value::Integer(5)]);
    Ok(())
}

#[test]
fn test_savepoint_outside_transaction() -> Result<(), DatabaseError> {
    let (_db, mut conn) = with_table("txn_savepoint_outer", DatabaseConfig::default());

    conn.savepoint("outer")?;
    assert!(!conn.is_autocommit());
    conn.execute("INSERT INTO t VALUES (1, 'a')", &[])?;
    conn.savepoint("inner")?;
    conn.execute("INSERT INTO t VALUES (2, 'b')", &[])?;
    conn.release("inner")?;
    assert!(!conn.is_autocommit());
    // Releasing the savepoint that opened the transaction commits it.
    conn.release("outer")?;
    assert!(conn.is_autocommit());
    assert_eq!(count(&mut conn, "t"), 2);

    conn.savepoint("s")?;
    conn.execute("DELETE FROM t", &[])?;
    conn.rollback()?;
    assert!(conn.is_autocommit());
    assert_eq!(count(&mut conn, "t"), 2);
    Ok(())
}

#[test]
fn test_rolled_back_ddl_disappears() -> Result<(), DatabaseError> {
    let (_db, mut conn) = with_table("txn_ddl", DatabaseConfig::default());

    conn.begin(TransactionMode::Deferred)?;
    conn.execute("CREATE TABLE scratch(x)", &[])?;
    conn.execute("INSERT INTO scratch VALUES (1)", &[])?;
    conn.execute("CREATE INDEX t_v ON t(v)", &[])?;
    assert_eq!(count(&mut conn, "scratch"), 1);
    conn.rollback()?;

    let err = conn.query("SELECT * FROM scratch", &[]).unwrap_err();
    assert!(err.to_string().contains("no such table: scratch"));
    // The index name is free again.
    conn.execute("CREATE INDEX t_v ON t(v)", &[])?;
    Ok(())
}

#[test]
fn test_statement_reuse_and_bindings() -> Result<(), DatabaseError> {
    let (_db, mut conn) = with_table("txn_statement", DatabaseConfig::default());
    conn.execute("INSERT INTO t VALUES (1, 'a'), (2, 'b'), (3, 'c')", &[])?;

    let mut select = conn.prepare("SELECT v FROM t WHERE id >= ?1 ORDER BY id")?;
    assert_eq!(select.parameter_count(), 1);
    select.bind(1, 2)?;
    let first: Vec<Row> = select.rows().collect::<litecore::Result<_>>()?;
    assert_eq!(first.len(), 2);

    // A finished statement rebinds and runs again.
    select.bind(1, 3)?;
    let second: Vec<Row> = select.rows().collect::<litecore::Result<_>>()?;
    assert_eq!(second, vec![Row::new(vec![Value::from("c")])]);

    select.reset();
    assert!(select.step()?.is_some());
    let err = select.bind(1, 1).unwrap_err();
    assert!(matches!(err, DatabaseError::Misuse { .. }));
    select.finalize()?;

    let err = conn.execute("SELECT 1; SELECT 2", &[]).unwrap_err();
    assert!(matches!(err, DatabaseError::Misuse { .. }));
    let err = conn.execute("INSERT INTO t VALUES (?, ?)", &[Value::Integer(9), Value::Null, Value::Null]).unwrap_err();
    assert!(matches!(err, DatabaseError::Misuse { .. }));
    Ok(())
}
