use litecore::types::{
    DEFAULT_PAGE_SIZE, HEADER_SIZE, is_valid_page_size,
    page::{Cell, Node, PageType, max_local_payload},
    record,
    value::Value,
};

fn table_leaf(rows: &[(i64, &str)]) -> Node {
    let mut node = Node::new_leaf(true);
    for (row_id, text) in rows {
        node.cells.push(Cell::TableLeaf {
            row_id: *row_id,
            payload: record::encode(&[Value::from(*text)]),
        });
    }
    node
}

#[test]
fn test_page_type_codes() {
    for code in [2u8, 5, 10, 13] {
        assert_eq!(PageType::from_u8(code).unwrap().as_u8(), code);
    }
    assert_eq!(PageType::from_u8(0), None);
    assert!(PageType::LeafTable.is_leaf() && PageType::LeafTable.is_table());
    assert!(!PageType::InteriorIndex.is_leaf() && !PageType::InteriorIndex.is_table());
    assert_eq!(PageType::InteriorTable.header_size(), 12);
    assert_eq!(PageType::LeafIndex.header_size(), 8);
}

#[test]
fn test_table_leaf_round_trip() {
    let node = table_leaf(&[(1, "alpha"), (2, "beta"), (300, "gamma")]);
    let mut page = vec![0u8; DEFAULT_PAGE_SIZE];
    node.encode(&mut page, 0, DEFAULT_PAGE_SIZE).unwrap();
    assert_eq!(Node::decode(&page, 0, DEFAULT_PAGE_SIZE).unwrap(), node);
}

#[test]
fn test_page_one_node_starts_after_file_header() {
    let node = table_leaf(&[(1, "schema row")]);
    let mut page = vec![0u8; DEFAULT_PAGE_SIZE];
    node.encode(&mut page, HEADER_SIZE, DEFAULT_PAGE_SIZE).unwrap();
    assert_eq!(page[HEADER_SIZE], PageType::LeafTable.as_u8());
    assert_eq!(Node::decode(&page, HEADER_SIZE, DEFAULT_PAGE_SIZE).unwrap(), node);
}

#[test]
fn test_interior_table_children() {
    let mut node = Node::new_interior(true, 9);
    node.cells.push(Cell::TableInterior { left_child: 4, row_id: 10 });
    node.cells.push(Cell::TableInterior { left_child: 6, row_id: 20 });
    assert_eq!(node.child_count(), 3);
    assert_eq!(node.child(0), Some(4));
    assert_eq!(node.child(2), Some(9));
    node.set_child(2, 11);
    assert_eq!(node.right_child, Some(11));

    let mut page = vec![0u8; 512];
    node.encode(&mut page, 0, 512).unwrap();
    assert_eq!(Node::decode(&page, 0, 512).unwrap(), node);
}

#[test]
fn test_fits_tracks_content_size() {
    let mut node = Node::new_leaf(true);
    let mut row_id = 0;
    while node.fits(0, 512) {
        row_id += 1;
        node.cells.push(Cell::TableLeaf {
            row_id,
            payload: vec![0; 40],
        });
    }
    // 40 byte payload + 1 length + 1 rowid varint + 2 pointer bytes.
    assert_eq!(node.content_size(), row_id as usize * 44);
    assert!(node.encoded_size(0) > 512);
}

#[test]
fn test_page_size_rules() {
    assert!(is_valid_page_size(512));
    assert!(is_valid_page_size(65536));
    assert!(!is_valid_page_size(256));
    assert!(!is_valid_page_size(3000));
    assert!(max_local_payload(true, 512) < 512);
}
