use litecore::{DatabaseError, Value};

use crate::{database, ints, select};

#[test]
fn test_schema_table_records_objects() -> Result<(), DatabaseError> {
    let (_db, mut conn) = database(
        "ddl_schema",
        "CREATE TABLE t(a TEXT PRIMARY KEY, b UNIQUE, c);
         CREATE INDEX t_c ON t(c);",
    );

    let rows = select(&mut conn, "SELECT type, name, tbl_name FROM sqlite_schema ORDER BY rowid");
    assert_eq!(
        rows,
        vec![
            vec![Value::from("table"), Value::from("t"), Value::from("t")],
            vec![Value::from("index"), Value::from("sqlite_autoindex_t_1"), Value::from("t")],
            vec![Value::from("index"), Value::from("sqlite_autoindex_t_2"), Value::from("t")],
            vec![Value::from("index"), Value::from("t_c"), Value::from("t")],
        ]
    );
    let rows = select(&mut conn, "SELECT sql FROM sqlite_master WHERE name = 't_c'");
    assert_eq!(rows, vec![vec![Value::from("CREATE INDEX t_c ON t(c)")]]);
    // Automatic indexes have no SQL text.
    assert_eq!(ints(&mut conn, "SELECT count(*) FROM sqlite_schema WHERE sql IS NULL"), vec![2]);
    assert!(ints(&mut conn, "SELECT rootpage FROM sqlite_schema").iter().all(|&root| root > 1));
    Ok(())
}

#[test]
fn test_if_not_exists_and_if_exists() -> Result<(), DatabaseError> {
    let (_db, mut conn) = database("ddl_exists", "CREATE TABLE t(a);");

    let err = conn.execute("CREATE TABLE t(b)", &[]).unwrap_err();
    assert!(err.to_string().contains("table t already exists"));
    conn.execute("CREATE TABLE IF NOT EXISTS t(b)", &[])?;
    // The original definition is untouched.
    conn.execute("INSERT INTO t(a) VALUES (1)", &[])?;

    conn.execute("CREATE INDEX t_a ON t(a)", &[])?;
    assert!(conn.execute("CREATE INDEX t_a ON t(a)", &[]).is_err());
    conn.execute("CREATE INDEX IF NOT EXISTS t_a ON t(a)", &[])?;

    assert!(conn.execute("DROP TABLE missing", &[]).unwrap_err().to_string().contains("no such table: missing"));
    conn.execute("DROP TABLE IF EXISTS missing", &[])?;
    conn.execute("DROP INDEX IF EXISTS missing", &[])?;
    Ok(())
}

#[test]
fn test_drop_table_removes_indexes_and_data() -> Result<(), DatabaseError> {
    let (_db, mut conn) = database(
        "ddl_drop_table",
        "CREATE TABLE t(a UNIQUE, b);
         CREATE INDEX t_b ON t(b);
         CREATE TABLE keep(x);
         INSERT INTO keep VALUES (1), (2);",
    );
    conn.begin(litecore::TransactionMode::Immediate)?;
    for i in 0..300 {
        conn.execute("INSERT INTO t VALUES (?, ?)", &[Value::Integer(i), Value::from(format!("row {i}"))])?;
    }
    conn.commit()?;

    conn.execute("DROP TABLE t", &[])?;
    assert_eq!(
        select(&mut conn, "SELECT name FROM sqlite_schema"),
        vec![vec![Value::from("keep")]]
    );
    assert!(conn.query("SELECT * FROM t", &[]).unwrap_err().to_string().contains("no such table: t"));

    // The name is free again, and so are the freed pages.
    conn.execute("CREATE TABLE t(z)", &[])?;
    assert_eq!(ints(&mut conn, "SELECT count(*) FROM t"), vec![0]);
    assert_eq!(ints(&mut conn, "SELECT x FROM keep ORDER BY x"), vec![1, 2]);
    Ok(())
}

#[test]
fn test_create_index_on_existing_rows() -> Result<(), DatabaseError> {
    let (_db, mut conn) = database(
        "ddl_index_fill",
        "CREATE TABLE t(a, b);
         INSERT INTO t VALUES (3, 'c'), (1, 'a'), (2, 'b'), (1, 'again');",
    );

    conn.execute("CREATE INDEX t_a ON t(a)", &[])?;
    assert_eq!(ints(&mut conn, "SELECT rowid FROM t WHERE a = 1 ORDER BY rowid"), vec![2, 4]);

    // Existing duplicates make a unique index impossible.
    let err = conn.execute("CREATE UNIQUE INDEX t_a_unique ON t(a)", &[]).unwrap_err();
    assert!(matches!(err, DatabaseError::ConstraintViolation { .. }), "{err}");
    assert!(select(&mut conn, "SELECT name FROM sqlite_schema WHERE name = 't_a_unique'").is_empty());

    conn.execute("CREATE UNIQUE INDEX t_b_unique ON t(b)", &[])?;
    assert!(matches!(
        conn.execute("INSERT INTO t VALUES (9, 'a')", &[]),
        Err(DatabaseError::ConstraintViolation { .. })
    ));

    conn.execute("DROP INDEX t_a", &[])?;
    assert_eq!(ints(&mut conn, "SELECT rowid FROM t WHERE a = 1 ORDER BY rowid"), vec![2, 4]);
    Ok(())
}

#[test]
fn test_reserved_and_protected_names() {
    let (_db, mut conn) = database("ddl_reserved", "CREATE TABLE t(a UNIQUE);");

    for (sql, message) in [
        ("CREATE TABLE sqlite_things(a)", "reserved for internal use"),
        ("DROP TABLE sqlite_schema", "may not be dropped"),
        ("DROP INDEX sqlite_autoindex_t_1", "cannot be dropped"),
        ("CREATE INDEX t ON t(a)", "there is already a table named t"),
        ("INSERT INTO sqlite_schema VALUES ('table', 'x', 'x', 9, NULL)", "may not be modified"),
        ("CREATE INDEX i ON missing(a)", "no such table: missing"),
    ] {
        let err = conn.execute(sql, &[]).unwrap_err();
        assert!(err.to_string().contains(message), "{sql}: {err}");
    }
}

#[test]
fn test_schema_survives_reopen() -> Result<(), DatabaseError> {
    let (db, conn) = database(
        "ddl_reopen",
        "CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT NOT NULL);
         CREATE INDEX t_v ON t(v);
         INSERT INTO t(v) VALUES ('x'), ('y');",
    );
    conn.close()?;

    let mut conn = db.reopen()?;
    assert_eq!(ints(&mut conn, "SELECT id FROM t WHERE v = 'y'"), vec![2]);
    assert!(matches!(
        conn.execute("INSERT INTO t(v) VALUES (NULL)", &[]),
        Err(DatabaseError::ConstraintViolation { .. })
    ));
    Ok(())
}
