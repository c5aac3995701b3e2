//! Record codec: a header of serial types followed by the packed column bodies.

use std::cmp::Ordering;

use crate::types::{
    error::{DatabaseError, Result},
    value::Value,
    varint::{read_varint, varint_len, write_varint},
};

/// Serial type code used in the record header for `value`.
pub fn serial_type(value: &Value) -> u64 {
    match value {
        Value::Null => 0,
        Value::Integer(0) => 8,
        Value::Integer(1) => 9,
        Value::Integer(i) => {
            let i = *i;
            if (-128..=127).contains(&i) {
                1
            } else if (-32768..=32767).contains(&i) {
                2
            } else if (-8_388_608..=8_388_607).contains(&i) {
                3
            } else if (i32::MIN as i64..=i32::MAX as i64).contains(&i) {
                4
            } else if (-140_737_488_355_328..=140_737_488_355_327).contains(&i) {
                5
            } else {
                6
            }
        }
        Value::Real(_) => 7,
        Value::Blob(b) => 12 + 2 * b.len() as u64,
        Value::Text(s) => 13 + 2 * s.len() as u64,
    }
}

/// Body length in bytes for a serial type.
pub fn serial_type_len(serial: u64) -> usize {
    match serial {
        0 | 8 | 9 | 10 | 11 => 0,
        1 => 1,
        2 => 2,
        3 => 3,
        4 => 4,
        5 => 6,
        6 | 7 => 8,
        n => ((n - 12) / 2) as usize,
    }
}

/// Serializes a row of values into record format.
pub fn encode(values: &[Value]) -> Vec<u8> {
    let types: Vec<u64> = values.iter().map(serial_type).collect();
    let types_len: usize = types.iter().map(|t| varint_len(*t)).sum();
    let body_len: usize = types.iter().map(|t| serial_type_len(*t)).sum();

    // The header size counts its own varint.
    let mut header_size = types_len + 1;
    loop {
        let next = types_len + varint_len(header_size as u64);
        if next == header_size {
            break;
        }
        header_size = next;
    }

    let mut buffer = Vec::with_capacity(header_size + body_len);
    write_varint(&mut buffer, header_size as u64);
    for t in &types {
        write_varint(&mut buffer, *t);
    }
    for (value, serial) in values.iter().zip(&types) {
        match value {
            Value::Null => {}
            Value::Integer(i) => {
                let len = serial_type_len(*serial);
                let bytes = i.to_be_bytes();
                buffer.extend_from_slice(&bytes[8 - len..]);
            }
            Value::Real(r) => buffer.extend_from_slice(&r.to_bits().to_be_bytes()),
            Value::Text(s) => buffer.extend_from_slice(s.as_bytes()),
            Value::Blob(b) => buffer.extend_from_slice(b),
        }
    }
    buffer
}

fn read_header(bytes: &[u8]) -> Result<(Vec<u64>, usize)> {
    let (header_size, mut offset) = read_varint(bytes)?;
    let header_size = header_size as usize;
    if header_size > bytes.len() || header_size < offset {
        return Err(DatabaseError::corrupt(0, "record header exceeds payload"));
    }
    let mut types = Vec::new();
    while offset < header_size {
        let (serial, len) = read_varint(&bytes[offset..header_size])?;
        if serial == 10 || serial == 11 {
            return Err(DatabaseError::corrupt(0, "reserved serial type in record"));
        }
        types.push(serial);
        offset += len;
    }
    Ok((types, header_size))
}

fn decode_body(serial: u64, body: &[u8]) -> Result<Value> {
    let value = match serial {
        0 => Value::Null,
        8 => Value::Integer(0),
        9 => Value::Integer(1),
        1..=6 => {
            let len = body.len();
            let mut bytes = if body[0] & 0x80 != 0 { [0xffu8; 8] } else { [0u8; 8] };
            bytes[8 - len..].copy_from_slice(body);
            Value::Integer(i64::from_be_bytes(bytes))
        }
        7 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(body);
            let r = f64::from_bits(u64::from_be_bytes(bytes));
            if r.is_nan() { Value::Null } else { Value::Real(r) }
        }
        n if n % 2 == 0 => Value::Blob(body.to_vec()),
        _ => Value::Text(
            String::from_utf8(body.to_vec())
                .map_err(|_| DatabaseError::corrupt(0, "record text is not valid UTF-8"))?,
        ),
    };
    Ok(value)
}

/// Deserializes every column of a record.
pub fn decode(bytes: &[u8]) -> Result<Vec<Value>> {
    let (types, mut offset) = read_header(bytes)?;
    let mut values = Vec::with_capacity(types.len());
    for serial in types {
        let len = serial_type_len(serial);
        let body = bytes
            .get(offset..offset + len)
            .ok_or_else(|| DatabaseError::corrupt(0, "record body truncated"))?;
        values.push(decode_body(serial, body)?);
        offset += len;
    }
    Ok(values)
}

/// Decodes one column without materializing the rest. Columns past the end
/// of the record read as NULL, which is how rows written before an ALTER
/// behave in the file format.
pub fn decode_column(bytes: &[u8], column: usize) -> Result<Value> {
    let (types, mut offset) = read_header(bytes)?;
    let Some(&serial) = types.get(column) else {
        return Ok(Value::Null);
    };
    for t in &types[..column] {
        offset += serial_type_len(*t);
    }
    let len = serial_type_len(serial);
    let body = bytes
        .get(offset..offset + len)
        .ok_or_else(|| DatabaseError::corrupt(0, "record body truncated"))?;
    decode_body(serial, body)
}

pub fn column_count(bytes: &[u8]) -> Result<usize> {
    Ok(read_header(bytes)?.0.len())
}

/// Compares two keys column by column. A shorter key that matches the
/// longer one on every shared column compares equal, so search keys may be
/// prefixes of stored index entries.
pub fn compare_prefix(target: &[Value], stored: &[Value]) -> Ordering {
    for (a, b) in target.iter().zip(stored) {
        match a.compare(b) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    Ordering::Equal
}

/// Full ordering between two complete keys; ties on shared columns are
/// broken by length.
pub fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
    compare_prefix(a, b).then(a.len().cmp(&b.len()))
}
