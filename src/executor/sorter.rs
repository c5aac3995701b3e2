use std::cmp::Ordering;

use crate::{planner::types::SortOrder, types::value::Value};

/// In-memory sorter for ORDER BY and for buffering rows before a write.
///
/// Each record starts with one key column per entry in `order`; the rest is
/// payload. With no key columns the sorter keeps insertion order.
#[derive(Debug, Clone)]
pub struct Sorter {
    order: Vec<SortOrder>,
    rows: Vec<Vec<Value>>,
    position: usize,
    sorted: bool,
}

impl Sorter {
    pub fn new(order: Vec<SortOrder>) -> Self {
        Self {
            order,
            rows: Vec::new(),
            position: 0,
            sorted: false,
        }
    }

    pub fn insert(&mut self, record: Vec<Value>) {
        self.rows.push(record);
        self.sorted = false;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sorts the buffered rows (stable) and rewinds. Returns false when empty.
    pub fn sort(&mut self) -> bool {
        if !self.sorted {
            let order = &self.order;
            self.rows.sort_by(|a, b| compare_records(order, a, b));
            self.sorted = true;
        }
        self.position = 0;
        !self.rows.is_empty()
    }

    pub fn next(&mut self) -> bool {
        self.position += 1;
        self.position < self.rows.len()
    }

    pub fn column(&self, column: usize) -> Option<&Value> {
        self.rows.get(self.position)?.get(column)
    }
}

fn compare_records(order: &[SortOrder], a: &[Value], b: &[Value]) -> Ordering {
    for (i, direction) in order.iter().enumerate() {
        let ord = match (a.get(i), b.get(i)) {
            (Some(x), Some(y)) => x.compare(y),
            _ => Ordering::Equal,
        };
        let ord = match direction {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
