//! Row cache in front of flushed view segments.
//!
//! Eviction follows SIEVE: a hit sets the entry's `visited` bit; on insert
//! into a full cache the hand sweeps forward, clearing set bits, and evicts
//! the first entry whose bit is already clear.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
struct Slot<K, V> {
    key: K,
    value: V,
    visited: bool,
}

/// Bounded cache with SIEVE eviction.
#[derive(Debug)]
pub(crate) struct RowCache<K, V> {
    slots: Vec<Option<Slot<K, V>>>,
    index: HashMap<K, usize>,
    hand: usize,
}

impl<K, V> RowCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "row cache capacity must be > 0");
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            index: HashMap::with_capacity(capacity),
            hand: 0,
        }
    }

    pub(crate) fn get(&mut self, key: &K) -> Option<V> {
        let index = *self.index.get(key)?;
        let slot = self.slots[index].as_mut()?;
        slot.visited = true;
        Some(slot.value.clone())
    }

    pub(crate) fn insert(&mut self, key: K, value: V) {
        if let Some(&index) = self.index.get(&key) {
            if let Some(slot) = self.slots[index].as_mut() {
                slot.value = value;
                slot.visited = true;
                return;
            }
        }

        let index = match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => self.evict(),
        };
        self.index.insert(key.clone(), index);
        self.slots[index] = Some(Slot {
            key,
            value,
            visited: false,
        });
    }

    pub(crate) fn remove(&mut self, key: &K) {
        if let Some(index) = self.index.remove(key) {
            self.slots[index] = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Frees a slot and returns its index.
    fn evict(&mut self) -> usize {
        let capacity = self.slots.len();
        // Two sweeps always find a victim: the first clears every bit.
        for _ in 0..capacity * 2 {
            let current = self.hand;
            self.hand = (self.hand + 1) % capacity;
            match self.slots[current].as_mut() {
                Some(slot) if slot.visited => slot.visited = false,
                Some(slot) => {
                    self.index.remove(&slot.key);
                    self.slots[current] = None;
                    return current;
                }
                None => return current,
            }
        }
        let current = self.hand;
        if let Some(slot) = self.slots[current].take() {
            self.index.remove(&slot.key);
        }
        current
    }
}
