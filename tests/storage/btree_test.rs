use std::{collections::BTreeMap, sync::Arc};

use litecore::{
    config::DatabaseConfig,
    storage::{
        btree::{self, SearchKey, TreeKind},
        cursor::{Cursor, SeekOp},
        pager::Pager,
        shared::SharedFile,
        vfs::OsVfs,
    },
    types::{PageId, RowId, record, value::Value},
};
use proptest::prelude::*;

fn open_pager(dir: &tempfile::TempDir) -> Pager {
    let config = DatabaseConfig::default().with_page_size(512).with_cache_size(1024);
    let shared = SharedFile::open(Arc::new(OsVfs), &dir.path().join("btree.db"), &config).unwrap();
    Pager::new(shared, &config)
}

fn scan_rowids(pager: &mut Pager, root: PageId) -> Vec<RowId> {
    let mut cursor = Cursor::new(root, TreeKind::Table);
    let mut out = Vec::new();
    let mut more = cursor.first(pager).unwrap();
    while more {
        out.push(cursor.row_id(pager).unwrap());
        more = cursor.next(pager).unwrap();
    }
    out
}

#[derive(Debug, Clone)]
enum Op {
    Insert(RowId, usize),
    Delete(RowId),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0i64..300, 1usize..120).prop_map(|(k, len)| Op::Insert(k, len)),
        2 => (0i64..300).prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn table_tree_stays_ordered_and_filled_under_random_edits(ops in prop::collection::vec(op_strategy(), 1..250)) {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir);
        pager.begin_write().unwrap();
        let root = btree::create_tree(&mut pager, TreeKind::Table).unwrap();
        let mut model: BTreeMap<RowId, usize> = BTreeMap::new();
        let mut cursor = Cursor::new(root, TreeKind::Table);

        for op in ops {
            match op {
                Op::Insert(row_id, len) => {
                    cursor.insert_row(&mut pager, row_id, vec![row_id as u8; len]).unwrap();
                    model.insert(row_id, len);
                }
                Op::Delete(row_id) => {
                    let found = cursor.seek(&mut pager, SearchKey::RowId(row_id), SeekOp::Eq).unwrap();
                    prop_assert_eq!(found, model.contains_key(&row_id));
                    if found {
                        cursor.delete(&mut pager).unwrap();
                        model.remove(&row_id);
                    }
                }
            }
            let keys = scan_rowids(&mut pager, root);
            prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(keys, model.keys().copied().collect::<Vec<_>>());
            let stats = btree::check_tree(&mut pager, root, TreeKind::Table).unwrap();
            prop_assert_eq!(stats.entries, model.len() as u64);
            prop_assert_eq!(stats.underfull, 0);
        }
        pager.commit().unwrap();
    }
}

#[test]
fn test_index_seek_finds_first_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let mut pager = open_pager(&dir);
    pager.begin_write().unwrap();
    let root = btree::create_tree(&mut pager, TreeKind::Index).unwrap();
    for row_id in 0..300i64 {
        let key = [Value::Integer(row_id % 30), Value::Integer(row_id)];
        btree::insert_index_entry(&mut pager, root, &key).unwrap();
    }

    let mut cursor = Cursor::new(root, TreeKind::Index);
    let target = [Value::Integer(17)];
    assert!(cursor.seek(&mut pager, SearchKey::Index(&target), SeekOp::Ge).unwrap());
    let mut row_ids = Vec::new();
    loop {
        let key = cursor.index_key(&mut pager).unwrap();
        if key[0] != Value::Integer(17) {
            break;
        }
        row_ids.push(key[1].clone());
        if !cursor.next(&mut pager).unwrap() {
            break;
        }
    }
    let expected: Vec<Value> = (0..10).map(|i| Value::Integer(17 + 30 * i)).collect();
    assert_eq!(row_ids, expected);
    assert_eq!(btree::count_entries(&mut pager, root, TreeKind::Index).unwrap(), 300);
    pager.commit().unwrap();
}

#[test]
fn test_text_keys_stay_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let mut pager = open_pager(&dir);
    pager.begin_write().unwrap();
    let root = btree::create_tree(&mut pager, TreeKind::Index).unwrap();
    let mut words: Vec<String> = (0..200).map(|i| format!("w{:03}", (i * 37) % 200)).collect();
    for (i, word) in words.iter().enumerate() {
        btree::insert_index_entry(&mut pager, root, &[Value::from(word.as_str()), Value::Integer(i as i64)]).unwrap();
    }
    words.sort();

    let mut cursor = Cursor::new(root, TreeKind::Index);
    let mut seen = Vec::new();
    let mut more = cursor.first(&mut pager).unwrap();
    while more {
        let key = cursor.index_key(&mut pager).unwrap();
        seen.push(key[0].to_string());
        more = cursor.next(&mut pager).unwrap();
    }
    assert_eq!(seen, words);
    let stats = btree::check_tree(&mut pager, root, TreeKind::Index).unwrap();
    assert!(stats.depth >= 2);
    pager.commit().unwrap();
}

#[test]
fn test_clear_tree_keeps_root() {
    let dir = tempfile::tempdir().unwrap();
    let mut pager = open_pager(&dir);
    pager.begin_write().unwrap();
    let root = btree::create_tree(&mut pager, TreeKind::Table).unwrap();
    for row_id in 1..=400 {
        let payload = record::encode(&[Value::Integer(row_id), Value::from("payload")]);
        btree::insert_row(&mut pager, root, row_id, payload).unwrap();
    }
    btree::clear_tree(&mut pager, root, TreeKind::Table).unwrap();
    assert_eq!(btree::count_entries(&mut pager, root, TreeKind::Table).unwrap(), 0);
    assert!(scan_rowids(&mut pager, root).is_empty());
    btree::insert_row(&mut pager, root, 9, record::encode(&[Value::Null])).unwrap();
    assert_eq!(scan_rowids(&mut pager, root), vec![9]);
    pager.commit().unwrap();
}
