use std::{fs, path::Path, sync::Arc};

use litecore::{
    config::{DatabaseConfig, JournalMode},
    storage::{
        btree::{self, TreeKind},
        pager::Pager,
        shared::SharedFile,
        vfs::{OsVfs, Vfs, sidecar_path},
    },
    types::{PageId, error::DatabaseError, record, value::Value},
};

fn open_shared(path: &Path, config: &DatabaseConfig) -> Arc<SharedFile> {
    SharedFile::open(Arc::new(OsVfs), path, config).unwrap()
}

fn row(n: i64) -> Vec<u8> {
    record::encode(&[Value::Integer(n), Value::Text(format!("row {n}"))])
}

/// Creates a table tree holding rows `1..=n` and returns its root.
fn seed(pager: &mut Pager, n: i64) -> PageId {
    pager.begin_write().unwrap();
    let root = btree::create_tree(pager, TreeKind::Table).unwrap();
    for i in 1..=n {
        btree::insert_row(pager, root, i, row(i)).unwrap();
    }
    pager.commit().unwrap();
    root
}

fn count(pager: &mut Pager, root: PageId) -> u64 {
    pager.begin_read().unwrap();
    let n = btree::count_entries(pager, root, TreeKind::Table).unwrap();
    pager.commit().unwrap();
    n
}

#[test]
fn test_crash_after_journal_phase_one_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crash.db");
    let config = DatabaseConfig::default().with_page_size(1024);

    let mut pager = Pager::new(open_shared(&path, &config), &config);
    let root = seed(&mut pager, 50);

    pager.begin_write().unwrap();
    for i in 51..=400 {
        btree::insert_row(&mut pager, root, i, row(i)).unwrap();
    }
    pager.commit_phase_one().unwrap();
    assert!(sidecar_path(&path, "-journal").exists());
    // The database file already holds the new pages; the process dies here.
    std::mem::forget(pager);

    let mut reopened = Pager::new(open_shared(&path, &config), &config);
    assert_eq!(count(&mut reopened, root), 50);
    assert!(!sidecar_path(&path, "-journal").exists());
    reopened.begin_read().unwrap();
    let stats = btree::check_tree(&mut reopened, root, TreeKind::Table).unwrap();
    assert_eq!(stats.entries, 50);
    reopened.commit().unwrap();
}

#[test]
fn test_crash_journal_records_carry_sampled_checksums() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("format.db");
    let config = DatabaseConfig::default().with_page_size(1024);

    let mut pager = Pager::new(open_shared(&path, &config), &config);
    let root = seed(&mut pager, 300);
    pager.begin_write().unwrap();
    for i in 1..=300 {
        btree::insert_row(&mut pager, root, i, row(i + 1000)).unwrap();
    }
    pager.commit_phase_one().unwrap();
    std::mem::forget(pager);

    let journal = fs::read(sidecar_path(&path, "-journal")).unwrap();
    let u32_at = |at: usize| u32::from_be_bytes([journal[at], journal[at + 1], journal[at + 2], journal[at + 3]]);
    let records = u32_at(8) as usize;
    let nonce = u32_at(12);
    assert!(records > 1);
    assert_eq!(u32_at(20), 512);
    assert_eq!(u32_at(24), 1024);
    assert_eq!(journal.len(), 512 + records * (4 + 1024 + 4));

    // Nonce plus the bytes at 824, 624, 424, 224 and 24 of every image.
    for i in 0..records {
        let at = 512 + i * (4 + 1024 + 4);
        let image = &journal[at + 4..at + 4 + 1024];
        let expected = (200..1024)
            .step_by(200)
            .map(|back| image[1024 - back] as u32)
            .fold(nonce, u32::wrapping_add);
        assert_eq!(u32_at(at + 4 + 1024), expected, "record {i}");
    }

    let mut reopened = Pager::new(open_shared(&path, &config), &config);
    assert_eq!(count(&mut reopened, root), 300);
}

#[test]
fn test_truncated_log_keeps_only_committed_transactions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal.db");
    let config = DatabaseConfig::default()
        .with_page_size(1024)
        .with_journal_mode(JournalMode::Wal)
        .with_wal_autocheckpoint(0);

    let shared = open_shared(&path, &config);
    let mut pager = Pager::new(Arc::clone(&shared), &config);
    let root = seed(&mut pager, 20);
    pager.begin_write().unwrap();
    for i in 21..=40 {
        btree::insert_row(&mut pager, root, i, row(i)).unwrap();
    }
    pager.commit().unwrap();

    // Copy the files as a crash would leave them, then tear the last frame.
    let copy = dir.path().join("copy.db");
    fs::copy(&path, &copy).unwrap();
    fs::copy(sidecar_path(&path, "-wal"), sidecar_path(&copy, "-wal")).unwrap();
    let complete = dir.path().join("complete.db");
    fs::copy(&path, &complete).unwrap();
    fs::copy(sidecar_path(&path, "-wal"), sidecar_path(&complete, "-wal")).unwrap();
    let wal = OsVfs.open(&sidecar_path(&copy, "-wal"), false).unwrap();
    let size = wal.size().unwrap();
    wal.truncate(size - 10).unwrap();
    drop(wal);

    let mut torn = Pager::new(open_shared(&copy, &config), &config);
    assert_eq!(count(&mut torn, root), 20);

    let mut whole = Pager::new(open_shared(&complete, &config), &config);
    assert_eq!(count(&mut whole, root), 40);
}

#[test]
fn test_wal_reader_keeps_its_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snap.db");
    let config = DatabaseConfig::default().with_journal_mode(JournalMode::Wal);
    let shared = open_shared(&path, &config);
    let mut writer = Pager::new(Arc::clone(&shared), &config);
    let mut reader = Pager::new(Arc::clone(&shared), &config);
    let root = seed(&mut writer, 10);

    reader.begin_read().unwrap();
    assert_eq!(btree::count_entries(&mut reader, root, TreeKind::Table).unwrap(), 10);

    writer.begin_write().unwrap();
    btree::insert_row(&mut writer, root, 11, row(11)).unwrap();
    writer.commit().unwrap();

    assert_eq!(btree::count_entries(&mut reader, root, TreeKind::Table).unwrap(), 10);
    reader.commit().unwrap();
    assert_eq!(count(&mut reader, root), 11);
}

#[test]
fn test_second_writer_is_busy() {
    for mode in [JournalMode::Delete, JournalMode::Wal] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.db");
        let config = DatabaseConfig::default().with_journal_mode(mode);
        let shared = open_shared(&path, &config);
        let mut first = Pager::new(Arc::clone(&shared), &config);
        let mut second = Pager::new(Arc::clone(&shared), &config);

        first.begin_write().unwrap();
        assert!(matches!(second.begin_write(), Err(DatabaseError::Busy)));
        // The failed writer still holds its read transaction; end it so the
        // first writer can commit.
        second.rollback().unwrap();
        first.commit().unwrap();
        second.begin_write().unwrap();
        second.commit().unwrap();
    }
}

#[test]
fn test_read_only_pager_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.db");
    let config = DatabaseConfig::default();
    {
        let mut pager = Pager::new(open_shared(&path, &config), &config);
        seed(&mut pager, 1);
    }
    let read_only = config.with_read_only(true);
    let mut pager = Pager::new(open_shared(&path, &read_only), &read_only);
    assert!(matches!(pager.begin_write(), Err(DatabaseError::ReadOnly)));
}

#[test]
fn test_foreign_file_is_not_a_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk.db");
    fs::write(&path, vec![b'x'; 4096]).unwrap();
    let err = SharedFile::open(Arc::new(OsVfs), &path, &DatabaseConfig::default()).unwrap_err();
    assert!(matches!(err, DatabaseError::NotADatabase { .. }));
}
