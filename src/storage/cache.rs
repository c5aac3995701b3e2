//! Per-connection page cache with clock (second-chance) replacement.

use std::{collections::HashMap, sync::Arc};

use crate::types::{
    PageId,
    error::{DatabaseError, Result},
};

/// Shared handle to a cached page image. While a clone is alive the page is
/// pinned and cannot be evicted.
pub type PageRef = Arc<Vec<u8>>;

struct Slot {
    page_id: PageId,
    data: PageRef,
    dirty: bool,
    referenced: bool,
}

impl Slot {
    fn is_pinned(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }
}

pub struct PageCache {
    capacity: usize,
    slots: Vec<Option<Slot>>,
    index: HashMap<PageId, usize>,
    free_slots: Vec<usize>,
    clock_hand: usize,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::with_capacity(capacity.min(1024)),
            index: HashMap::new(),
            free_slots: Vec::new(),
            clock_hand: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.index.contains_key(&page_id)
    }

    pub fn get(&mut self, page_id: PageId) -> Option<PageRef> {
        let slot_id = *self.index.get(&page_id)?;
        let slot = self.slots[slot_id].as_mut()?;
        slot.referenced = true;
        Some(Arc::clone(&slot.data))
    }

    pub fn is_dirty(&self, page_id: PageId) -> bool {
        self.index
            .get(&page_id)
            .and_then(|&i| self.slots[i].as_ref())
            .is_some_and(|s| s.dirty)
    }

    /// Adds a page, evicting a clean unpinned page if the cache is full.
    pub fn insert(&mut self, page_id: PageId, data: Vec<u8>, dirty: bool) -> Result<PageRef> {
        if let Some(&slot_id) = self.index.get(&page_id) {
            if let Some(slot) = self.slots[slot_id].as_mut() {
                slot.data = Arc::new(data);
                slot.dirty |= dirty;
                slot.referenced = true;
                return Ok(Arc::clone(&slot.data));
            }
        }

        let slot_id = self.claim_slot()?;
        let data = Arc::new(data);
        self.slots[slot_id] = Some(Slot {
            page_id,
            data: Arc::clone(&data),
            dirty,
            referenced: true,
        });
        self.index.insert(page_id, slot_id);
        Ok(data)
    }

    fn claim_slot(&mut self) -> Result<usize> {
        if let Some(slot_id) = self.free_slots.pop() {
            return Ok(slot_id);
        }
        if self.slots.len() < self.capacity {
            self.slots.push(None);
            return Ok(self.slots.len() - 1);
        }
        let victim = self.evict().ok_or(DatabaseError::CacheExhausted {
            capacity: self.capacity,
        })?;
        Ok(victim)
    }

    /// Advances the clock hand until it finds a clean, unpinned page whose
    /// reference bit is clear. Two full sweeps are enough to clear every bit.
    fn evict(&mut self) -> Option<usize> {
        let len = self.slots.len();
        for _ in 0..(2 * len) {
            let hand = self.clock_hand;
            self.clock_hand = (hand + 1) % len;
            let Some(slot) = self.slots[hand].as_mut() else {
                return Some(hand);
            };
            if slot.dirty || slot.is_pinned() {
                continue;
            }
            if slot.referenced {
                slot.referenced = false;
                continue;
            }
            let page_id = slot.page_id;
            self.slots[hand] = None;
            self.index.remove(&page_id);
            return Some(hand);
        }
        None
    }

    /// Mutable access to a cached page, marking it dirty. A page still pinned
    /// by a reader is copied first, so readers keep the old image.
    pub fn get_mut(&mut self, page_id: PageId) -> Option<&mut Vec<u8>> {
        let slot_id = *self.index.get(&page_id)?;
        let slot = self.slots[slot_id].as_mut()?;
        slot.dirty = true;
        slot.referenced = true;
        Some(Arc::make_mut(&mut slot.data))
    }

    /// Dirty pages in page order.
    pub fn dirty_pages(&self) -> Vec<(PageId, PageRef)> {
        let mut pages: Vec<(PageId, PageRef)> = self
            .slots
            .iter()
            .flatten()
            .filter(|s| s.dirty)
            .map(|s| (s.page_id, Arc::clone(&s.data)))
            .collect();
        pages.sort_by_key(|(id, _)| *id);
        pages
    }

    pub fn dirty_count(&self) -> usize {
        self.slots.iter().flatten().filter(|s| s.dirty).count()
    }

    pub fn mark_all_clean(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.dirty = false;
        }
    }

    pub fn remove(&mut self, page_id: PageId) {
        if let Some(slot_id) = self.index.remove(&page_id) {
            self.slots[slot_id] = None;
            self.free_slots.push(slot_id);
        }
    }

    /// Drops every dirty page, leaving clean pages cached.
    pub fn discard_dirty(&mut self) {
        let dirty: Vec<PageId> = self
            .slots
            .iter()
            .flatten()
            .filter(|s| s.dirty)
            .map(|s| s.page_id)
            .collect();
        for page_id in dirty {
            self.remove(page_id);
        }
    }

    /// Drops pages numbered above `db_size`.
    pub fn truncate(&mut self, db_size: PageId) {
        let beyond: Vec<PageId> = self.index.keys().copied().filter(|p| *p > db_size).collect();
        for page_id in beyond {
            self.remove(page_id);
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.free_slots.clear();
        self.clock_hand = 0;
    }
}
