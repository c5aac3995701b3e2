use std::cmp::Ordering;

use litecore::types::value::{Affinity, Value, parse_numeric};

#[test]
fn test_affinity_from_declared_type() {
    assert_eq!(Affinity::from_declared_type("INTEGER"), Affinity::Integer);
    assert_eq!(Affinity::from_declared_type("BIGINT"), Affinity::Integer);
    assert_eq!(Affinity::from_declared_type("VARCHAR(20)"), Affinity::Text);
    assert_eq!(Affinity::from_declared_type("CLOB"), Affinity::Text);
    assert_eq!(Affinity::from_declared_type("BLOB"), Affinity::Blob);
    assert_eq!(Affinity::from_declared_type(""), Affinity::Blob);
    assert_eq!(Affinity::from_declared_type("DOUBLE PRECISION"), Affinity::Real);
    assert_eq!(Affinity::from_declared_type("DECIMAL(10,2)"), Affinity::Numeric);
    // "INT" is checked first, so this is integer despite the "CHAR".
    assert_eq!(Affinity::from_declared_type("CHARINT"), Affinity::Integer);
}

#[test]
fn test_apply_affinity() {
    assert_eq!(Value::from("42").apply_affinity(Affinity::Integer), Value::Integer(42));
    assert_eq!(Value::from("4.5").apply_affinity(Affinity::Numeric), Value::Real(4.5));
    assert_eq!(Value::from("abc").apply_affinity(Affinity::Integer), Value::from("abc"));
    assert_eq!(Value::Real(3.0).apply_affinity(Affinity::Integer), Value::Integer(3));
    assert_eq!(Value::Integer(7).apply_affinity(Affinity::Real), Value::Real(7.0));
    assert_eq!(Value::Integer(7).apply_affinity(Affinity::Text), Value::from("7"));
    assert_eq!(Value::from("7").apply_affinity(Affinity::Blob), Value::from("7"));
    assert_eq!(Value::Null.apply_affinity(Affinity::Integer), Value::Null);
}

#[test]
fn test_key_order_across_storage_classes() {
    let ordered = [
        Value::Null,
        Value::Integer(-5),
        Value::Real(-4.5),
        Value::Integer(0),
        Value::Real(0.5),
        Value::Integer(1),
        Value::from("A"),
        Value::from("a"),
        Value::from("ab"),
        Value::Blob(vec![0]),
        Value::Blob(vec![0, 1]),
    ];
    for pair in ordered.windows(2) {
        assert_eq!(pair[0].compare(&pair[1]), Ordering::Less, "{:?} < {:?}", pair[0], pair[1]);
    }
    assert_eq!(Value::Integer(2).compare(&Value::Real(2.0)), Ordering::Equal);
}

#[test]
fn test_large_integers_compare_exactly_against_reals() {
    let big = Value::Integer(i64::MAX);
    assert_eq!(big.compare(&Value::Real(9.3e18)), Ordering::Less);
    assert_eq!(Value::Integer(i64::MIN).compare(&Value::Real(-9.3e18)), Ordering::Greater);
}

#[test]
fn test_truthiness() {
    assert_eq!(Value::Null.truthiness(), None);
    assert_eq!(Value::Integer(0).truthiness(), Some(false));
    assert_eq!(Value::Real(0.1).truthiness(), Some(true));
    assert_eq!(Value::from("1").truthiness(), Some(true));
    assert_eq!(Value::from("yes").truthiness(), Some(false));
}

#[test]
fn test_parse_numeric() {
    assert_eq!(parse_numeric(" 12 "), Some(Value::Integer(12)));
    assert_eq!(parse_numeric("1.0"), Some(Value::Integer(1)));
    assert_eq!(parse_numeric("1e3"), Some(Value::Real(1000.0)));
    assert_eq!(parse_numeric(""), None);
    assert_eq!(parse_numeric("twelve"), None);
}

#[test]
fn test_display() {
    assert_eq!(Value::Null.to_string(), "NULL");
    assert_eq!(Value::Real(2.0).to_string(), "2.0");
    assert_eq!(Value::Real(2.5).to_string(), "2.5");
    assert_eq!(Value::Blob(vec![0xCA, 0xFE]).to_string(), "x'CAFE'");
    assert_eq!(Value::from(Some(3)).to_string(), "3");
    assert_eq!(Value::from(None::<i64>), Value::Null);
}
