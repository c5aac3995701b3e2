use std::collections::BTreeSet;

use crate::types::RowId;

/// Rowids collected by the first pass of an UPDATE or DELETE, replayed in
/// ascending order by the second pass.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    ids: BTreeSet<RowId>,
}

impl RowSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, row_id: RowId) {
        self.ids.insert(row_id);
    }

    pub fn next(&mut self) -> Option<RowId> {
        self.ids.pop_first()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rowset_dedups_and_orders() {
        let mut set = RowSet::new();
        for id in [5, 1, 5, 3] {
            set.add(id);
        }
        assert_eq!(set.len(), 3);
        assert_eq!(set.next(), Some(1));
        assert_eq!(set.next(), Some(3));
        assert_eq!(set.next(), Some(5));
        assert_eq!(set.next(), None);
    }
}
