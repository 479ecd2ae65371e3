//! Direct-mapped grain-table and grain-data caches (`spec.md` §4.5/§4.6,
//! C5/C6).
//!
//! Both caches share the same shape: a fixed-capacity array indexed by
//! `key mod capacity`, with a newly-inserted entry unconditionally
//! evicting whatever previously lived at that slot. No LRU bookkeeping,
//! no locking beyond what the caller already holds — this mirrors the
//! teacher's preference for the simplest structure that satisfies the
//! access pattern (sequential/strided grain access within one extent).

/// Default grain-table cache capacity (`spec.md` §4.5).
pub const DEFAULT_GRAIN_TABLE_CACHE_SIZE: usize = 32;
/// Default grain-data cache capacity (`spec.md` §4.6).
pub const DEFAULT_GRAIN_DATA_CACHE_SIZE: usize = 8;

struct Slot<K, V> {
    key: K,
    value: V,
}

/// A direct-mapped cache from `u64` keys to owned values of type `V`.
pub struct DirectMappedCache<V> {
    capacity: usize,
    slots: Vec<Option<Slot<u64, V>>>,
    hits: u64,
    misses: u64,
}

impl<V> DirectMappedCache<V> {
    /// Build a cache with `capacity` slots. `capacity` must be nonzero;
    /// a zero capacity is coerced to 1 so `key % capacity` stays defined.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        DirectMappedCache {
            capacity,
            slots,
            hits: 0,
            misses: 0,
        }
    }

    fn slot_index(&self, key: u64) -> usize {
        (key % self.capacity as u64) as usize
    }

    /// Return the cached value for `key`, if present under its slot.
    pub fn get(&mut self, key: u64) -> Option<&V> {
        let idx = self.slot_index(key);
        match &self.slots[idx] {
            Some(slot) if slot.key == key => {
                self.hits += 1;
                Some(&slot.value)
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert `value` for `key`, evicting whatever previously occupied
    /// that key's slot (even if it held a different key).
    pub fn insert(&mut self, key: u64, value: V) {
        let idx = self.slot_index(key);
        self.slots[idx] = Some(Slot { key, value });
    }

    /// Drop every cached entry, e.g. when the handle's parent chain is
    /// reconfigured and cached grain data could otherwise answer reads
    /// against the wrong composition.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
