use std::{sync::Arc, thread};

use litecore::{DatabaseConfig, DatabaseError, TransactionMode, Value, utils::mock::TempDatabase};

use crate::{count, wal_config, with_table};

#[test]
fn test_wal_reader_keeps_its_snapshot() -> Result<(), DatabaseError> {
    let (db, mut writer) = with_table("conc_wal_snapshot", wal_config());
    writer.execute("INSERT INTO t(v) VALUES ('first')", &[])?;
    let mut reader = db.connect()?;

    reader.begin(TransactionMode::Deferred)?;
    assert_eq!(count(&mut reader, "t"), 1);
    writer.execute("INSERT INTO t(v) VALUES ('second')", &[])?;
    writer.execute("UPDATE t SET v = 'changed' WHERE id = 1", &[])?;
    assert_eq!(count(&mut reader, "t"), 1);
    let rows = reader.query("SELECT v FROM t WHERE id = 1", &[])?;
    assert_eq!(rows[0].get_text(0), Some("first"));

    // Writing from a stale snapshot is refused.
    assert!(matches!(
        reader.execute("INSERT INTO t(v) VALUES ('late')", &[]),
        Err(DatabaseError::Busy)
    ));
    reader.rollback()?;
    assert_eq!(count(&mut reader, "t"), 2);
    Ok(())
}

#[test]
fn test_uncommitted_rows_appear_after_commit() -> Result<(), DatabaseError> {
    for (prefix, config) in [
        ("conc_visibility_journal", DatabaseConfig::default()),
        ("conc_visibility_wal", wal_config()),
    ] {
        let (db, mut writer) = with_table(prefix, config);
        let mut reader = db.connect()?;

        writer.begin(TransactionMode::Immediate)?;
        writer.execute("INSERT INTO t(v) VALUES ('pending')", &[])?;
        assert_eq!(count(&mut reader, "t"), 0, "{prefix}");
        writer.commit()?;
        assert_eq!(count(&mut reader, "t"), 1, "{prefix}");
    }
    Ok(())
}

#[test]
fn test_second_writer_is_busy() -> Result<(), DatabaseError> {
    for (prefix, config) in [
        ("conc_busy_journal", DatabaseConfig::default()),
        ("conc_busy_wal", wal_config()),
    ] {
        let (db, mut first) = with_table(prefix, config);
        let mut second = db.connect()?;

        first.execute("BEGIN IMMEDIATE", &[])?;
        first.execute("INSERT INTO t(v) VALUES ('first')", &[])?;
        let err = second.execute("INSERT INTO t(v) VALUES ('second')", &[]).unwrap_err();
        assert!(matches!(err, DatabaseError::Busy), "{prefix}: {err}");
        assert!(err.is_retryable());
        assert!(second.is_autocommit());

        first.commit()?;
        second.execute("INSERT INTO t(v) VALUES ('second')", &[])?;
        assert_eq!(count(&mut first, "t"), 2);
    }
    Ok(())
}

#[test]
fn test_journal_reader_blocks_commit() -> Result<(), DatabaseError> {
    let (db, mut writer) = with_table("conc_journal_reader", DatabaseConfig::default());
    writer.execute("INSERT INTO t(v) VALUES ('a')", &[])?;
    let mut reader = db.connect()?;

    reader.begin(TransactionMode::Deferred)?;
    assert_eq!(count(&mut reader, "t"), 1);

    // An autocommit write that cannot commit is rolled back.
    assert!(matches!(
        writer.execute("INSERT INTO t(v) VALUES ('b')", &[]),
        Err(DatabaseError::Busy)
    ));
    assert!(writer.is_autocommit());

    // An explicit COMMIT that hits the reader stays open and can be retried.
    writer.begin(TransactionMode::Immediate)?;
    writer.execute("INSERT INTO t(v) VALUES ('c')", &[])?;
    assert!(matches!(writer.commit(), Err(DatabaseError::Busy)));
    assert!(!writer.is_autocommit());
    reader.commit()?;
    writer.commit()?;

    let rows = reader.query("SELECT v FROM t ORDER BY id", &[])?;
    let values: Vec<&str> = rows.iter().filter_map(|row| row.get_text(0)).collect();
    assert_eq!(values, ["a", "c"]);
    Ok(())
}

#[test]
fn test_schema_change_recompiles_prepared_statement() -> Result<(), DatabaseError> {
    let (db, mut conn) = with_table("conc_schema_change", DatabaseConfig::default());
    conn.execute("INSERT INTO t VALUES (1, 'a')", &[])?;
    let mut other = db.connect()?;

    let mut select = conn.prepare("SELECT * FROM t")?;
    assert_eq!(select.column_names(), ["id", "v"]);
    other.execute_batch(
        "DROP TABLE t;
         CREATE TABLE t(x, y, z);
         INSERT INTO t VALUES (7, 8, 9);",
    )?;

    let row = select.step()?.expect("row after recompiling");
    assert_eq!(row.values, vec![Value::Integer(7), Value::Integer(8), Value::Integer(9)]);
    assert_eq!(select.column_names(), ["x", "y", "z"]);
    assert_eq!(select.step()?, None);
    select.finalize()?;

    // A connection that has not prepared anything sees the new schema too.
    other.execute("CREATE TABLE u(a)", &[])?;
    conn.execute("INSERT INTO u VALUES (1)", &[])?;
    assert_eq!(count(&mut other, "u"), 1);
    Ok(())
}

#[test]
fn test_interrupt_from_another_thread() -> Result<(), DatabaseError> {
    let (_db, mut conn) = with_table("conc_interrupt", DatabaseConfig::default());
    conn.begin(TransactionMode::Immediate)?;
    for i in 0..500 {
        conn.execute("INSERT INTO t(v) VALUES (?)", &[Value::from(format!("row {i}"))])?;
    }
    conn.commit()?;

    let handle = conn.interrupt_handle();
    let mut select = conn.prepare("SELECT v FROM t")?;
    assert!(select.step()?.is_some());
    thread::spawn(move || handle.interrupt()).join().expect("interrupt thread");
    assert!(matches!(select.step(), Err(DatabaseError::Interrupted)));
    assert_eq!(select.step()?, None);
    drop(select);

    // The flag is cleared once a statement has been interrupted.
    assert_eq!(count(&mut conn, "t"), 500);
    Ok(())
}

#[test]
fn test_writers_on_many_threads() {
    let db = Arc::new(TempDatabase::with_config(
        "conc_threads",
        wal_config().with_busy_timeout(5_000),
    ));
    db.connect()
        .unwrap()
        .execute("CREATE TABLE log(worker INTEGER, seq INTEGER)", &[])
        .unwrap();

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let mut conn = db.connect().unwrap();
                for seq in 0..50 {
                    let params = [Value::Integer(worker), Value::Integer(seq)];
                    // A writer whose snapshot went stale while it waited retries.
                    loop {
                        match conn.execute("INSERT INTO log VALUES (?, ?)", &params) {
                            Err(DatabaseError::Busy) => thread::yield_now(),
                            other => {
                                other.unwrap();
                                break;
                            }
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let mut conn = db.connect().unwrap();
    assert_eq!(count(&mut conn, "log"), 200);
    let rows = conn
        .query("SELECT count(*) FROM log WHERE worker = 3 AND seq BETWEEN 0 AND 49", &[])
        .unwrap();
    assert_eq!(rows[0].get_i64(0), Some(50));
}
