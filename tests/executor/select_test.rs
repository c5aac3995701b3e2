use litecore::{
    Connection, DatabaseError, Value,
    executor::program::Insn,
    utils::mock::TempDatabase,
};

use crate::{database, ints, select};

const STAFF: &str = "
    CREATE TABLE emp(id INTEGER PRIMARY KEY, name TEXT NOT NULL, dept TEXT, salary INTEGER);
    INSERT INTO emp VALUES
        (1, 'alice', 'eng', 120),
        (2, 'bob', 'eng', 100),
        (3, 'carol', 'ops', 90),
        (4, 'dave', NULL, 70),
        (5, 'Eve', 'ops', 110);
    CREATE TABLE dept(code TEXT PRIMARY KEY, title TEXT);
    INSERT INTO dept VALUES ('eng', 'Engineering'), ('ops', 'Operations');
";

fn staff(prefix: &str) -> (TempDatabase, Connection) {
    database(prefix, STAFF)
}

#[test]
fn test_where_predicates() {
    let (_db, mut conn) = staff("select_where");

    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE salary BETWEEN 90 AND 110 ORDER BY id"), vec![2, 3, 5]);
    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE salary NOT BETWEEN 90 AND 110 ORDER BY id"), vec![1, 4]);
    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE dept IN ('ops', 'hr') ORDER BY id"), vec![3, 5]);
    // NULL is neither in nor out of a list.
    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE dept NOT IN ('eng') ORDER BY id"), vec![3, 5]);
    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE dept IS NULL"), vec![4]);
    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE dept IS NOT NULL ORDER BY id"), vec![1, 2, 3, 5]);
    assert!(ints(&mut conn, "SELECT id FROM emp WHERE dept = NULL").is_empty());
    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE salary > 100 AND dept = 'eng'"), vec![1]);
    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE id = 1 OR salary < 80 ORDER BY id"), vec![1, 4]);
}

#[test]
fn test_like_patterns() {
    let (_db, mut conn) = staff("select_like");

    // ASCII case folding: 'e%' matches "Eve".
    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE name LIKE 'e%'"), vec![5]);
    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE name LIKE '_a%' ORDER BY id"), vec![3, 4]);
    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE name NOT LIKE '%a%' ORDER BY id"), vec![2, 5]);
    assert!(ints(&mut conn, "SELECT id FROM emp WHERE dept LIKE NULL").is_empty());
}

#[test]
fn test_order_by_and_limit() {
    let (_db, mut conn) = staff("select_order");

    assert_eq!(ints(&mut conn, "SELECT id FROM emp ORDER BY salary DESC LIMIT 2"), vec![1, 5]);
    assert_eq!(ints(&mut conn, "SELECT id FROM emp ORDER BY id LIMIT 2 OFFSET 1"), vec![2, 3]);
    assert!(ints(&mut conn, "SELECT id FROM emp ORDER BY id LIMIT 0").is_empty());
    assert_eq!(ints(&mut conn, "SELECT id FROM emp ORDER BY id LIMIT -1 OFFSET 3"), vec![4, 5]);
    // NULL sorts first; text compares bytewise, so 'Eve' precedes 'carol'.
    assert_eq!(ints(&mut conn, "SELECT id FROM emp ORDER BY dept, name"), vec![4, 1, 2, 5, 3]);
    assert_eq!(ints(&mut conn, "SELECT id, salary * 2 AS twice FROM emp ORDER BY twice LIMIT 1"), vec![4]);
    assert_eq!(ints(&mut conn, "SELECT id, salary FROM emp ORDER BY 2 DESC, 1"), vec![1, 5, 2, 3, 4]);

    let err = conn.query("SELECT id FROM emp ORDER BY 3", &[]).unwrap_err();
    assert!(err.to_string().contains("ORDER BY term out of range"));
}

#[test]
fn test_aggregates() {
    let (_db, mut conn) = staff("select_aggregates");

    let rows = select(
        &mut conn,
        "SELECT count(*), count(dept), sum(salary), min(salary), max(name), avg(salary) FROM emp",
    );
    assert_eq!(
        rows,
        vec![vec![
            Value::Integer(5),
            Value::Integer(4),
            Value::Integer(490),
            Value::Integer(70),
            Value::from("dave"),
            Value::Real(98.0),
        ]]
    );

    let rows = select(&mut conn, "SELECT count(*), sum(salary) FROM emp WHERE dept = 'eng'");
    assert_eq!(rows, vec![vec![Value::Integer(2), Value::Integer(220)]]);

    // An aggregate over no rows still produces one row.
    let rows = select(&mut conn, "SELECT count(*), sum(salary), total(salary), max(id) FROM emp WHERE id > 100");
    assert_eq!(rows, vec![vec![Value::Integer(0), Value::Null, Value::Real(0.0), Value::Null]]);
}

#[test]
fn test_expressions_without_from() {
    let (_db, mut conn) = database("select_constant", "");

    let rows = select(
        &mut conn,
        "SELECT 7 / 2, 7 % 3, 1 + 2.5, 'ab' || 'cd', upper('x'), length('hello'), coalesce(NULL, 3), abs(-4), min(3, 1, 2), 7 / 0",
    );
    assert_eq!(
        rows,
        vec![vec![
            Value::Integer(3),
            Value::Integer(1),
            Value::Real(3.5),
            Value::from("abcd"),
            Value::from("X"),
            Value::Integer(5),
            Value::Integer(3),
            Value::Integer(4),
            Value::Integer(1),
            Value::Null,
        ]]
    );
    assert_eq!(select(&mut conn, "SELECT NULL + 1, NULL = NULL, NULL IS NULL"), vec![vec![
        Value::Null,
        Value::Null,
        Value::Integer(1),
    ]]);
}

#[test]
fn test_joins() {
    let (_db, mut conn) = staff("select_joins");

    let rows = select(
        &mut conn,
        "SELECT emp.name, dept.title FROM emp JOIN dept ON emp.dept = dept.code ORDER BY emp.id",
    );
    assert_eq!(
        rows,
        vec![
            vec![Value::from("alice"), Value::from("Engineering")],
            vec![Value::from("bob"), Value::from("Engineering")],
            vec![Value::from("carol"), Value::from("Operations")],
            vec![Value::from("Eve"), Value::from("Operations")],
        ]
    );

    let rows = select(
        &mut conn,
        "SELECT e.name FROM emp e, dept d WHERE e.dept = d.code AND d.title = 'Operations' ORDER BY e.name",
    );
    assert_eq!(rows, vec![vec![Value::from("Eve")], vec![Value::from("carol")]]);

    assert_eq!(ints(&mut conn, "SELECT count(*) FROM emp, dept"), vec![10]);
    assert_eq!(ints(&mut conn, "SELECT count(*) FROM emp CROSS JOIN dept WHERE dept.code = 'eng'"), vec![5]);

    let err = conn.query("SELECT code FROM dept d, dept e", &[]).unwrap_err();
    assert!(err.to_string().contains("ambiguous column name: code"));
    let err = conn.query("SELECT title FROM emp e, emp f", &[]).unwrap_err();
    assert!(err.to_string().contains("no such column: title"));
}

#[test]
fn test_wildcards_and_column_names() {
    let (_db, mut conn) = staff("select_wildcard");

    let statement = conn.prepare("SELECT * FROM dept").unwrap();
    assert_eq!(statement.column_names(), ["code", "title"]);
    drop(statement);
    let statement = conn.prepare("SELECT d.*, e.id AS emp_id FROM dept d, emp e").unwrap();
    assert_eq!(statement.column_names(), ["code", "title", "emp_id"]);
    drop(statement);

    let rows = select(&mut conn, "SELECT * FROM dept ORDER BY code DESC");
    assert_eq!(rows[0], vec![Value::from("ops"), Value::from("Operations")]);
    assert_eq!(ints(&mut conn, "SELECT rowid FROM dept ORDER BY rowid"), vec![1, 2]);
}

#[test]
fn test_parameters() -> Result<(), DatabaseError> {
    let (_db, mut conn) = staff("select_params");

    let rows = conn.query("SELECT name FROM emp WHERE id = ?", &[Value::Integer(3)])?;
    assert_eq!(rows[0].get_text(0), Some("carol"));

    let mut statement = conn.prepare("SELECT count(*) FROM emp WHERE salary >= :floor AND dept = :dept")?;
    statement.bind_named("floor", 100)?;
    statement.bind_named("dept", "eng")?;
    assert_eq!(statement.step()?.and_then(|row| row.get_i64(0)), Some(2));
    statement.reset();
    statement.bind_named("dept", "ops")?;
    assert_eq!(statement.step()?.and_then(|row| row.get_i64(0)), Some(1));
    statement.finalize()?;

    // Unbound parameters are NULL.
    assert!(conn.query("SELECT id FROM emp WHERE dept = ?", &[])?.is_empty());
    Ok(())
}

#[test]
fn test_lookups_use_keys() -> Result<(), DatabaseError> {
    let (_db, mut conn) = staff("select_keys");
    conn.execute("CREATE INDEX emp_salary ON emp(salary)", &[])?;

    let statement = conn.prepare("SELECT name FROM emp WHERE id = 3")?;
    assert!(statement.program().insns.iter().any(|i| matches!(i, Insn::SeekRowid { .. })));
    drop(statement);
    let statement = conn.prepare("SELECT name FROM emp WHERE salary = 100")?;
    assert!(statement.program().insns.iter().any(|i| matches!(i, Insn::SeekIndex { .. })));
    drop(statement);

    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE id = 3"), vec![3]);
    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE salary = 100"), vec![2]);
    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE salary > 95 ORDER BY salary"), vec![2, 5, 1]);
    assert_eq!(ints(&mut conn, "SELECT id FROM emp WHERE id > 2 AND id <= 4"), vec![3, 4]);
    assert!(ints(&mut conn, "SELECT id FROM emp WHERE id = 'x'").is_empty());
    Ok(())
}

#[test]
fn test_unsupported_sql_is_rejected() {
    let (_db, mut conn) = staff("select_unsupported");

    for sql in [
        "SELECT DISTINCT dept FROM emp",
        "SELECT dept, count(*) FROM emp GROUP BY dept",
        "SELECT * FROM emp LEFT JOIN dept ON emp.dept = dept.code",
    ] {
        let err = conn.query(sql, &[]).unwrap_err();
        assert!(err.to_string().contains("unsupported"), "{sql}: {err}");
    }
    assert!(matches!(conn.query("SELEC 1", &[]), Err(DatabaseError::SyntaxError { .. })));
    assert!(conn.query("SELECT * FROM missing", &[]).unwrap_err().to_string().contains("no such table: missing"));
}
