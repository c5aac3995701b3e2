use serde::{Deserialize, Serialize};

use crate::types::{
    RowId,
    error::{DatabaseError, Result},
    record,
    value::Value,
};

/// A table row: its rowid key plus the column values stored in the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub row_id: Option<RowId>,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            row_id: None,
            values,
        }
    }

    pub fn with_row_id(row_id: RowId, values: Vec<Value>) -> Self {
        Self {
            row_id: Some(row_id),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get_value(&self, column_index: usize) -> Option<&Value> {
        self.values.get(column_index)
    }

    pub fn get_i64(&self, column_index: usize) -> Option<i64> {
        match self.values.get(column_index)? {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get_text(&self, column_index: usize) -> Option<&str> {
        match self.values.get(column_index)? {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn set_value(&mut self, column_index: usize, value: Value) -> Result<()> {
        let len = self.values.len();
        let slot = self.values.get_mut(column_index).ok_or_else(|| {
            DatabaseError::misuse(format!(
                "column index {column_index} out of range for row of {len} values"
            ))
        })?;
        *slot = value;
        Ok(())
    }

    /// Encodes the payload. The rowid lives in the cell key, so a column that
    /// aliases it is written as NULL.
    pub fn to_bytes(&self, rowid_alias: Option<usize>) -> Vec<u8> {
        match rowid_alias {
            Some(alias) if alias < self.values.len() => {
                let mut values = self.values.clone();
                values[alias] = Value::Null;
                record::encode(&values)
            }
            _ => record::encode(&self.values),
        }
    }

    pub fn from_bytes(row_id: RowId, bytes: &[u8], rowid_alias: Option<usize>) -> Result<Self> {
        let mut values = record::decode(bytes)?;
        if let Some(alias) = rowid_alias {
            if alias >= values.len() {
                values.resize(alias + 1, Value::Null);
            }
            values[alias] = Value::Integer(row_id);
        }
        Ok(Self::with_row_id(row_id, values))
    }
}
