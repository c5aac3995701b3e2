use litecore::{DatabaseError, TransactionMode, Value};

use crate::{database, ints, select};

fn assert_constraint(result: litecore::Result<u64>, message: &str) {
    match result {
        Err(DatabaseError::ConstraintViolation { details }) => assert_eq!(details, message),
        other => panic!("expected constraint violation {message:?}, got {other:?}"),
    }
}

#[test]
fn test_insert_defaults_and_affinity() -> Result<(), DatabaseError> {
    let (_db, mut conn) = database(
        "dml_defaults",
        "CREATE TABLE t(a INTEGER PRIMARY KEY, b TEXT DEFAULT 'none', c INTEGER);",
    );

    assert_eq!(conn.execute("INSERT INTO t(c) VALUES (5)", &[])?, 1);
    assert_eq!(conn.last_insert_rowid(), 1);
    conn.execute("INSERT INTO t(b, c) VALUES (12, '42')", &[])?;
    assert_eq!(conn.last_insert_rowid(), 2);
    conn.execute("INSERT INTO t VALUES (10, NULL, 'x')", &[])?;
    // The next rowid follows the largest one in use.
    conn.execute("INSERT INTO t(c) VALUES (1.0)", &[])?;
    assert_eq!(conn.last_insert_rowid(), 11);

    let rows = select(&mut conn, "SELECT a, b, c FROM t ORDER BY a");
    assert_eq!(
        rows,
        vec![
            vec![Value::Integer(1), Value::from("none"), Value::Integer(5)],
            vec![Value::Integer(2), Value::from("12"), Value::Integer(42)],
            vec![Value::Integer(10), Value::Null, Value::from("x")],
            vec![Value::Integer(11), Value::from("none"), Value::Integer(1)],
        ]
    );

    let err = conn.execute("INSERT INTO t(a, b) VALUES (1)", &[]).unwrap_err();
    assert!(err.to_string().contains("values"), "{err}");
    let err = conn.execute("INSERT INTO t(z) VALUES (1)", &[]).unwrap_err();
    assert!(err.to_string().contains("table t has no column named z"));
    Ok(())
}

#[test]
fn test_update_and_delete() -> Result<(), DatabaseError> {
    let (_db, mut conn) = database(
        "dml_update",
        "CREATE TABLE t(id INTEGER PRIMARY KEY, n INTEGER, tag TEXT);
         INSERT INTO t(n, tag) VALUES (1, 'a'), (2, 'b'), (3, 'a'), (4, 'b'), (5, 'a');",
    );

    assert_eq!(conn.execute("UPDATE t SET n = n * 10 WHERE tag = 'a'", &[])?, 3);
    assert_eq!(conn.changes(), 3);
    assert_eq!(ints(&mut conn, "SELECT n FROM t ORDER BY id"), vec![10, 2, 30, 4, 50]);

    // Every row is visited once even when the update moves it within an index.
    conn.execute("CREATE INDEX t_n ON t(n)", &[])?;
    assert_eq!(conn.execute("UPDATE t SET n = n + 100 WHERE n > 3", &[])?, 4);
    assert_eq!(ints(&mut conn, "SELECT n FROM t ORDER BY id"), vec![110, 2, 130, 104, 150]);
    assert_eq!(ints(&mut conn, "SELECT id FROM t WHERE n = 104"), vec![4]);

    assert_eq!(conn.execute("UPDATE t SET tag = 'z' WHERE id = 99", &[])?, 0);
    assert_eq!(conn.execute("DELETE FROM t WHERE tag = 'b'", &[])?, 2);
    assert_eq!(ints(&mut conn, "SELECT id FROM t ORDER BY id"), vec![1, 3, 5]);
    assert!(ints(&mut conn, "SELECT id FROM t WHERE n = 104").is_empty());

    assert_eq!(conn.execute("DELETE FROM t", &[])?, 3);
    assert_eq!(ints(&mut conn, "SELECT count(*) FROM t"), vec![0]);
    Ok(())
}

#[test]
fn test_unique_and_not_null_constraints() -> Result<(), DatabaseError> {
    let (_db, mut conn) = database(
        "dml_constraints",
        "CREATE TABLE u(a UNIQUE, b NOT NULL);
         INSERT INTO u VALUES (1, 'x'), (2, 'y');",
    );

    assert_constraint(
        conn.execute("INSERT INTO u VALUES (1, 'dup')", &[]),
        "UNIQUE constraint failed: u.a",
    );
    assert_constraint(
        conn.execute("INSERT INTO u VALUES (3, NULL)", &[]),
        "NOT NULL constraint failed: u.b",
    );
    // NULLs never collide in a unique index.
    conn.execute("INSERT INTO u VALUES (NULL, 'p'), (NULL, 'q')", &[])?;

    // A failing multi-row insert leaves none of its rows behind.
    assert_constraint(
        conn.execute("INSERT INTO u VALUES (10, 'ok'), (2, 'dup')", &[]),
        "UNIQUE constraint failed: u.a",
    );
    assert_eq!(ints(&mut conn, "SELECT count(*) FROM u WHERE a = 10"), vec![0]);

    assert_constraint(
        conn.execute("UPDATE u SET a = 1 WHERE a = 2", &[]),
        "UNIQUE constraint failed: u.a",
    );
    assert_constraint(
        conn.execute("UPDATE u SET b = NULL", &[]),
        "NOT NULL constraint failed: u.b",
    );
    assert_eq!(ints(&mut conn, "SELECT a FROM u WHERE a IS NOT NULL ORDER BY a"), vec![1, 2]);
    assert_eq!(ints(&mut conn, "SELECT count(*) FROM u"), vec![4]);
    Ok(())
}

#[test]
fn test_primary_key_constraints() -> Result<(), DatabaseError> {
    let (_db, mut conn) = database(
        "dml_primary_key",
        "CREATE TABLE p(id INTEGER PRIMARY KEY, v);
         CREATE TABLE k(code TEXT PRIMARY KEY, v);
         INSERT INTO p VALUES (1, 'a');
         INSERT INTO k VALUES ('one', 1);",
    );

    assert_constraint(conn.execute("INSERT INTO p VALUES (1, 'b')", &[]), "UNIQUE constraint failed: p.id");
    assert_constraint(conn.execute("INSERT INTO k VALUES ('one', 2)", &[]), "UNIQUE constraint failed: k.code");

    let err = conn.execute("INSERT INTO p VALUES ('abc', 'c')", &[]).unwrap_err();
    assert!(matches!(err, DatabaseError::TypeMismatch { .. }), "{err}");
    // Integral text is a valid rowid.
    conn.execute("INSERT INTO p VALUES ('7', 'seven')", &[])?;
    assert_eq!(conn.last_insert_rowid(), 7);
    assert_eq!(ints(&mut conn, "SELECT id FROM p ORDER BY id"), vec![1, 7]);
    Ok(())
}

#[test]
fn test_insert_select() -> Result<(), DatabaseError> {
    let (_db, mut conn) = database(
        "dml_insert_select",
        "CREATE TABLE src(a INTEGER, b TEXT);
         INSERT INTO src VALUES (1, 'one'), (2, 'two'), (3, 'three');
         CREATE TABLE dst(a INTEGER, b TEXT);",
    );

    assert_eq!(conn.execute("INSERT INTO dst SELECT a * 10, upper(b) FROM src WHERE a > 1", &[])?, 2);
    let rows = select(&mut conn, "SELECT a, b FROM dst ORDER BY a");
    assert_eq!(
        rows,
        vec![
            vec![Value::Integer(20), Value::from("TWO")],
            vec![Value::Integer(30), Value::from("THREE")],
        ]
    );

    // Reading and writing the same table sees only the rows present at the start.
    assert_eq!(conn.execute("INSERT INTO src SELECT a + 3, b FROM src", &[])?, 3);
    assert_eq!(ints(&mut conn, "SELECT a FROM src ORDER BY a"), vec![1, 2, 3, 4, 5, 6]);
    Ok(())
}

#[test]
fn test_bulk_insert_through_prepared_statement() -> Result<(), DatabaseError> {
    let (_db, mut conn) = database(
        "dml_bulk",
        "CREATE TABLE items(id INTEGER PRIMARY KEY, name TEXT, weight REAL);
         CREATE INDEX items_name ON items(name);",
    );

    conn.begin(TransactionMode::Immediate)?;
    {
        let mut insert = conn.prepare("INSERT INTO items(name, weight) VALUES (?, ?)")?;
        for i in 0..2000 {
            insert.bind(1, format!("item-{i:05}"))?;
            insert.bind(2, i as f64 / 2.0)?;
            assert_eq!(insert.step()?, None);
        }
        insert.finalize()?;
    }
    conn.commit()?;

    assert_eq!(ints(&mut conn, "SELECT count(*) FROM items"), vec![2000]);
    assert_eq!(ints(&mut conn, "SELECT id FROM items WHERE name = 'item-01234'"), vec![1235]);
    assert_eq!(conn.execute("DELETE FROM items WHERE id % 2 = 0", &[])?, 1000);
    assert!(ints(&mut conn, "SELECT id FROM items WHERE name = 'item-01233'").is_empty());
    assert_eq!(ints(&mut conn, "SELECT id FROM items WHERE name = 'item-01234'"), vec![1235]);
    let rows = select(&mut conn, "SELECT sum(weight) FROM items WHERE name >= 'item-01990'");
    // Odd ids 1991..1999 hold weights 995.0, 996.0, ..., 999.0.
    assert_eq!(rows, vec![vec![Value::Real(4985.0)]]);
    Ok(())
}
