//! Fixed-capacity least-recently-used cache.
//!
//! The cache is a plain data structure: it is not synchronized, and the
//! owning structure serializes access through its own lock. All operations
//! run in O(1). An optional eviction callback observes every entry that
//! leaves the cache; the callback must not call back into the cache or take
//! the owner's lock.

use std::collections::HashMap;
use std::hash::Hash;

/// Observes entries as they leave the cache.
pub type EvictFn<K, V> = Box<dyn Fn(&K, &V) + Send>;

const NIL: usize = usize::MAX;

struct Slot<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Order-of-use cache over slab-allocated slots linked into a list by
/// index, most recent at the head.
pub struct Lru<K, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    on_evict: Option<EvictFn<K, V>>,
}

impl<K: Eq + Hash + Clone, V> Lru<K, V> {
    /// Creates a cache holding up to `capacity` entries. `capacity` must be
    /// positive.
    pub fn new(capacity: usize, on_evict: Option<EvictFn<K, V>>) -> Lru<K, V> {
        assert!(capacity > 0, "cache capacity must be positive");
        Lru {
            capacity,
            map: HashMap::with_capacity(capacity.min(4096)),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            on_evict,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Inserts or refreshes `key`, moving it to the front. Returns whether
    /// an older entry was evicted to make room.
    pub fn add(&mut self, key: K, value: V) -> bool {
        if let Some(&idx) = self.map.get(&key) {
            if let Some(slot) = self.slots[idx].as_mut() {
                slot.value = value;
            }
            self.detach(idx);
            self.attach_front(idx);
            return false;
        }
        let slot = Slot {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.attach_front(idx);
        self.map.insert(key, idx);
        if self.map.len() > self.capacity {
            self.evict_oldest();
            return true;
        }
        false
    }

    /// Looks `key` up and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.detach(idx);
        self.attach_front(idx);
        self.slots[idx].as_ref().map(|slot| &slot.value)
    }

    /// Looks `key` up without disturbing the use order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.slots[idx].as_ref().map(|slot| &slot.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Removes `key`, notifying the eviction callback. Returns whether the
    /// key was present.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.map.get(key).copied() {
            Some(idx) => {
                self.remove_slot(idx);
                true
            }
            None => false,
        }
    }

    /// Removes and returns the least recently used entry, notifying the
    /// eviction callback.
    pub fn remove_oldest(&mut self) -> Option<(K, V)> {
        if self.tail == NIL {
            return None;
        }
        self.remove_slot(self.tail)
    }

    /// The least recently used entry, untouched.
    pub fn get_oldest(&self) -> Option<(&K, &V)> {
        if self.tail == NIL {
            return None;
        }
        self.slots[self.tail].as_ref().map(|slot| (&slot.key, &slot.value))
    }

    /// Shrinks or grows the capacity, evicting from the back as needed.
    /// Returns the number of evicted entries.
    pub fn resize(&mut self, capacity: usize) -> usize {
        assert!(capacity > 0, "cache capacity must be positive");
        let mut evicted = 0;
        while self.map.len() > capacity {
            self.evict_oldest();
            evicted += 1;
        }
        self.capacity = capacity;
        evicted
    }

    /// Drops every entry, notifying the eviction callback for each.
    pub fn purge(&mut self) {
        while self.remove_oldest().is_some() {}
    }

    fn evict_oldest(&mut self) {
        let _ = self.remove_oldest();
    }

    fn remove_slot(&mut self, idx: usize) -> Option<(K, V)> {
        self.detach(idx);
        let slot = self.slots[idx].take()?;
        self.map.remove(&slot.key);
        self.free.push(idx);
        if let Some(on_evict) = &self.on_evict {
            on_evict(&slot.key, &slot.value);
        }
        Some((slot.key, slot.value))
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(slot) => (slot.prev, slot.next),
            None => return,
        };
        if prev != NIL {
            if let Some(slot) = self.slots[prev].as_mut() {
                slot.next = next;
            }
        } else if self.head == idx {
            self.head = next;
        }
        if next != NIL {
            if let Some(slot) = self.slots[next].as_mut() {
                slot.prev = prev;
            }
        } else if self.tail == idx {
            self.tail = prev;
        }
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = NIL;
            slot.next = NIL;
        }
    }

    fn attach_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = NIL;
            slot.next = old_head;
        }
        if old_head != NIL {
            if let Some(slot) = self.slots[old_head].as_mut() {
                slot.prev = idx;
            }
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn evicts_in_use_order() {
        let mut cache = Lru::new(3, None);
        for i in 0u64..3 {
            assert!(!cache.add(i, i * 10));
        }
        // Touch 0 so that 1 becomes the oldest.
        assert_eq!(cache.get(&0), Some(&0));
        assert!(cache.add(3, 30));
        assert!(!cache.contains(&1));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get_oldest(), Some((&2, &20)));
    }

    #[test]
    fn add_refreshes_existing_keys() {
        let mut cache = Lru::new(2, None);
        cache.add(1u64, "a");
        cache.add(2, "b");
        assert!(!cache.add(1, "c"));
        assert_eq!(cache.get(&1), Some(&"c"));
        // 2 is now the oldest and leaves first.
        cache.add(3, "d");
        assert!(!cache.contains(&2));
    }

    #[test]
    fn peek_does_not_promote() {
        let mut cache = Lru::new(2, None);
        cache.add(1u64, 1);
        cache.add(2, 2);
        assert_eq!(cache.peek(&1), Some(&1));
        cache.add(3, 3);
        assert!(!cache.contains(&1));
    }

    #[test]
    fn callback_sees_every_removal() {
        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut cache = Lru::new(
            2,
            Some(Box::new(move |key: &u64, _value: &u64| {
                sink.lock().push(*key);
            })),
        );
        for i in 0..4 {
            cache.add(i, i);
        }
        assert!(cache.remove(&3));
        assert!(!cache.remove(&3));
        cache.purge();
        assert_eq!(*seen.lock(), vec![0, 1, 3, 2]);
        assert!(cache.is_empty());
    }

    #[test]
    fn remove_oldest_returns_the_entry() {
        let mut cache = Lru::new(4, None);
        for i in 0u64..3 {
            cache.add(i, i);
        }
        assert_eq!(cache.remove_oldest(), Some((0, 0)));
        assert_eq!(cache.remove_oldest(), Some((1, 1)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn resize_evicts_down_to_capacity() {
        let mut cache = Lru::new(4, None);
        for i in 0u64..4 {
            cache.add(i, i);
        }
        assert_eq!(cache.resize(2), 2);
        assert!(!cache.contains(&0));
        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));
        assert!(cache.contains(&3));
        assert_eq!(cache.resize(8), 0);
    }

    #[test]
    fn slots_are_reused_after_removal() {
        let mut cache = Lru::new(2, None);
        for round in 0u64..16 {
            cache.add(round, round);
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.slots.len() <= 3);
    }
}
