use std::mem;

use litecore::{DatabaseConfig, DatabaseError, Engine, Synchronous, TransactionMode, Value, utils::mock::TempDatabase};

use crate::{count, wal_config, with_table};

fn fill(conn: &mut litecore::Connection, rows: usize) -> Result<(), DatabaseError> {
    conn.begin(TransactionMode::Immediate)?;
    for i in 0..rows {
        conn.execute("INSERT INTO t(v) VALUES (?)", &[Value::from(format!("value {i}"))])?;
    }
    conn.commit()
}

#[test]
fn test_unfinished_transaction_is_lost_in_journal_mode() -> Result<(), DatabaseError> {
    let (db, mut conn) = with_table("recovery_journal", DatabaseConfig::default());
    fill(&mut conn, 10)?;

    conn.begin(TransactionMode::Immediate)?;
    conn.execute("DELETE FROM t WHERE id > 5", &[])?;
    conn.execute("INSERT INTO t(v) VALUES ('uncommitted')", &[])?;
    // The process dies without rolling back.
    mem::forget(conn);

    let mut conn = db.reopen()?;
    assert_eq!(count(&mut conn, "t"), 10);
    assert!(!db.journal_path().exists());
    Ok(())
}

#[test]
fn test_committed_log_survives_crash() -> Result<(), DatabaseError> {
    let config = wal_config().with_wal_autocheckpoint(0);
    let (db, mut conn) = with_table("recovery_wal", config);
    fill(&mut conn, 25)?;
    conn.begin(TransactionMode::Immediate)?;
    conn.execute("DELETE FROM t", &[])?;
    mem::forget(conn);
    assert!(db.wal_path().exists());

    let mut conn = db.reopen()?;
    assert_eq!(count(&mut conn, "t"), 25);
    let rows = conn.query("SELECT v FROM t WHERE id = 25", &[])?;
    assert_eq!(rows[0].get_text(0), Some("value 24"));
    Ok(())
}

#[test]
fn test_log_database_keeps_header_in_main_file() -> Result<(), DatabaseError> {
    let (db, mut conn) = with_table("recovery_wal_header", wal_config().with_wal_autocheckpoint(0));
    fill(&mut conn, 200)?;
    mem::forget(conn);

    let main = std::fs::read(&db.path)?;
    assert!(main.len() >= 4096);
    assert_eq!(&main[..16], b"SQLite format 3\0");
    // Read and write versions 2 mark the file as using a log.
    assert_eq!(main[18..20], [2, 2]);
    assert!(db.wal_path().exists());

    // Opening without asking for WAL still finds the log through the header.
    let mut conn = Engine::new().connect(&db.path, DatabaseConfig::default())?;
    assert_eq!(count(&mut conn, "t"), 200);
    Ok(())
}

#[test]
fn test_clean_close_checkpoints_log() -> Result<(), DatabaseError> {
    let (db, mut conn) = with_table("recovery_close", wal_config().with_wal_autocheckpoint(0));
    fill(&mut conn, 40)?;

    let result = conn.checkpoint()?;
    assert!(result.log_frames > 0);
    assert_eq!(result.backfilled, result.log_frames);
    conn.execute("INSERT INTO t(v) VALUES ('after checkpoint')", &[])?;
    conn.close()?;
    assert!(!db.wal_path().exists());

    // The rows are in the database file itself now.
    let mut conn = db.reopen()?;
    assert_eq!(count(&mut conn, "t"), 41);
    Ok(())
}

#[test]
fn test_checkpoint_refused_inside_write_transaction() -> Result<(), DatabaseError> {
    let (_db, mut conn) = with_table("recovery_checkpoint_misuse", wal_config());
    conn.begin(TransactionMode::Immediate)?;
    assert!(matches!(conn.checkpoint(), Err(DatabaseError::Misuse { .. })));
    conn.rollback()?;
    Ok(())
}

#[test]
fn test_full_cache_fails_statement_cleanly() -> Result<(), DatabaseError> {
    let config = DatabaseConfig::default()
        .with_page_size(512)
        .with_cache_size(16)
        .with_synchronous(Synchronous::Off);
    let (_db, mut conn) = with_table("recovery_cache", config);
    for i in 0..200 {
        conn.execute("INSERT INTO t(v) VALUES (?)", &[Value::from(format!("{i:060}"))])?;
    }
    conn.execute("CREATE TABLE copy(v TEXT)", &[])?;

    // Every page the copy dirties must stay cached until commit.
    let err = conn.execute("INSERT INTO copy SELECT v FROM t", &[]).unwrap_err();
    assert!(matches!(err, DatabaseError::CacheExhausted { capacity: 16 }), "{err}");
    assert!(conn.is_autocommit());
    assert_eq!(count(&mut conn, "copy"), 0);

    conn.execute("INSERT INTO copy SELECT v FROM t WHERE id <= 3", &[])?;
    assert_eq!(count(&mut conn, "copy"), 3);
    assert_eq!(count(&mut conn, "t"), 200);
    Ok(())
}

#[test]
fn test_read_only_connection() -> Result<(), DatabaseError> {
    let (db, mut conn) = with_table("recovery_read_only", DatabaseConfig::default());
    fill(&mut conn, 3)?;
    conn.close()?;

    let mut reader = Engine::new().connect(&db.path, db.config.clone().with_read_only(true))?;
    assert_eq!(count(&mut reader, "t"), 3);
    assert!(matches!(
        reader.execute("INSERT INTO t(v) VALUES ('no')", &[]),
        Err(DatabaseError::ReadOnly)
    ));
    assert!(matches!(reader.execute("CREATE TABLE u(a)", &[]), Err(DatabaseError::ReadOnly)));
    Ok(())
}

#[test]
fn test_missing_file_without_create() {
    let db = TempDatabase::with_prefix("recovery_missing");
    let result = Engine::new().connect(&db.path, DatabaseConfig::default().with_create_if_missing(false));
    assert!(result.is_err());
    assert!(!db.path.exists());
}

#[test]
fn test_analyze_records_row_counts() -> Result<(), DatabaseError> {
    let (_db, mut conn) = with_table("recovery_analyze", DatabaseConfig::default());
    fill(&mut conn, 42)?;
    conn.execute("CREATE TABLE empty(a)", &[])?;
    assert_eq!(conn.row_estimate("t"), None);

    conn.analyze()?;
    assert_eq!(conn.row_estimate("T"), Some(42));
    assert_eq!(conn.row_estimate("empty"), Some(0));
    assert_eq!(conn.row_estimate("missing"), None);
    // Plans made with the new estimates still answer correctly.
    assert_eq!(count(&mut conn, "t"), 42);
    Ok(())
}
