use litecore::types::{
    record::{self, compare_keys},
    value::Value,
};
use proptest::prelude::*;

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Integer),
        any::<f64>()
            .prop_filter("NaN never equals itself", |r| !r.is_nan())
            .prop_map(Value::Real),
        ".{0,40}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Blob),
    ]
}

proptest! {
    #[test]
    fn decode_inverts_encode(values in prop::collection::vec(value_strategy(), 0..12)) {
        let bytes = record::encode(&values);
        prop_assert_eq!(record::decode(&bytes).unwrap(), values.clone());
        prop_assert_eq!(record::column_count(&bytes).unwrap(), values.len());
        for (i, value) in values.iter().enumerate() {
            prop_assert_eq!(&record::decode_column(&bytes, i).unwrap(), value);
        }
    }

    #[test]
    fn key_order_is_antisymmetric(
        a in prop::collection::vec(value_strategy(), 1..4),
        b in prop::collection::vec(value_strategy(), 1..4),
    ) {
        prop_assert_eq!(compare_keys(&a, &b), compare_keys(&b, &a).reverse());
    }
}

#[test]
fn test_boundary_rows() {
    let rows = [
        vec![],
        vec![Value::from("")],
        vec![Value::Integer(i64::MAX), Value::Integer(i64::MIN)],
        vec![Value::Null, Value::Null, Value::Null],
        vec![Value::Blob(Vec::new()), Value::Real(-0.5)],
        vec![Value::from("x".repeat(5000))],
    ];
    for row in rows {
        assert_eq!(record::decode(&record::encode(&row)).unwrap(), row);
    }
}

#[test]
fn test_zero_and_one_take_no_body() {
    let bytes = record::encode(&[Value::Integer(0), Value::Integer(1)]);
    // Header size byte plus two serial types, nothing else.
    assert_eq!(bytes, vec![3, 8, 9]);
}
