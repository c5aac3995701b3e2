use litecore::types::{error::DatabaseError, record, row::Row, value::Value};

fn sample_row() -> Row {
    Row::with_row_id(
        7,
        vec![
            Value::Integer(7),
            Value::from("seven"),
            Value::Real(7.5),
            Value::Null,
        ],
    )
}

#[test]
fn test_new_row_has_no_rowid() {
    let values = vec![Value::Integer(123), Value::from("test")];
    let row = Row::new(values.clone());
    assert_eq!(row.row_id, None);
    assert_eq!(row.values, values);
    assert_eq!(row.len(), 2);
    assert!(!row.is_empty());
}

#[test]
fn test_typed_getters() {
    let row = sample_row();
    assert_eq!(row.get_i64(0), Some(7));
    assert_eq!(row.get_text(1), Some("seven"));
    assert_eq!(row.get_text(0), None);
    assert_eq!(row.get_value(3), Some(&Value::Null));
    assert_eq!(row.get_value(4), None);
}

#[test]
fn test_payload_round_trip_with_alias() {
    let row = sample_row();
    let bytes = row.to_bytes(Some(0));
    assert_eq!(record::decode(&bytes).unwrap()[0], Value::Null);
    assert_eq!(Row::from_bytes(7, &bytes, Some(0)).unwrap(), row);
}

#[test]
fn test_payload_round_trip_without_alias() {
    let row = sample_row();
    let bytes = row.to_bytes(None);
    let decoded = Row::from_bytes(7, &bytes, None).unwrap();
    assert_eq!(decoded.values, row.values);
    assert_eq!(decoded.row_id, Some(7));
}

#[test]
fn test_short_record_is_padded_for_alias() {
    // A row written before the alias column existed in the record.
    let bytes = record::encode(&[]);
    let row = Row::from_bytes(3, &bytes, Some(0)).unwrap();
    assert_eq!(row.values, vec![Value::Integer(3)]);
}

#[test]
fn test_set_value() {
    let mut row = sample_row();
    row.set_value(1, Value::from("eight")).unwrap();
    assert_eq!(row.get_text(1), Some("eight"));
    assert!(matches!(
        row.set_value(9, Value::Null),
        Err(DatabaseError::Misuse { .. })
    ));
}

#[test]
fn test_corrupt_payload() {
    assert!(matches!(
        Row::from_bytes(1, &[5, 1], None),
        Err(DatabaseError::Corrupt { .. })
    ));
}
