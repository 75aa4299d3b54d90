//! Generic keyed LRU-with-second-chance eviction, shared plumbing behind
//! the segment-cache and the file cache.
//!
//! The two caches are independent instances of the same machinery: an
//! LRU and a hash mirror the segment-cache machinery but stay independent
//! — this module factors out that shared shape so each
//! call site only supplies its key type and eviction predicate, rather
//! than duplicating the hash+order+second-chance bookkeeping twice.

use alloc::vec::Vec;
use core::hash::Hash;
use hashbrown::HashMap;

struct Entry<V> {
    value: V,
    used: bool,
}

/// `order` is oldest (LRU head) at index 0, most-recently-touched at the
/// back, matching the original's "walk LRU from head" eviction scan.
pub struct KeyedLru<K, V> {
    order: Vec<K>,
    entries: HashMap<K, Entry<V>>,
}

impl<K, V> Default for KeyedLru<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        KeyedLru { order: Vec::new(), entries: HashMap::new() }
    }
}

impl<K, V> KeyedLru<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Looks up `key`, bumps it to the most-recently-used end and sets its
    /// second-chance bit (`cread`'s "bump the LRU" step).
    pub fn touch(&mut self, key: &K) -> Option<&V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
        let entry = self.entries.get_mut(key).unwrap();
        entry.used = true;
        Some(&entry.value)
    }

    /// Inserts a freshly-constructed entry at the most-recently-used end.
    pub fn insert(&mut self, key: K, value: V) {
        self.order.push(key.clone());
        self.entries.insert(key, Entry { value, used: true });
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.entries.remove(key).map(|e| e.value)
    }

    /// Second-chance (clock) eviction: walks from the LRU head, clearing
    /// the used bit on first encounter and giving the entry another lap;
    /// evicts the first still-clear entry for which `can_evict` holds.
    /// Entries `can_evict` rejects are marked used and re-queued so the
    /// scan doesn't spin forever on a segment that's merely still pinned.
    /// Bounded to two full laps, matching the fact that a second pass
    /// always finds a cleared bit if one exists.
    pub fn evict_second_chance(&mut self, can_evict: impl Fn(&V) -> bool) -> Option<(K, V)> {
        let laps = self.order.len().saturating_mul(2).max(1);
        for _ in 0..laps {
            let key = self.order.first()?.clone();
            self.order.remove(0);
            let mut entry = self.entries.remove(&key).expect("KeyedLru: order/entries desync");
            if entry.used {
                entry.used = false;
                self.order.push(key.clone());
                self.entries.insert(key, entry);
                continue;
            }
            if can_evict(&entry.value) {
                return Some((key, entry.value));
            }
            entry.used = true;
            self.order.push(key.clone());
            self.entries.insert(key, entry);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_moves_entry_to_mru_end() {
        let mut lru: KeyedLru<u32, &str> = KeyedLru::new();
        lru.insert(1, "a");
        lru.insert(2, "b");
        lru.touch(&1);
        assert_eq!(lru.order, alloc::vec![2, 1]);
    }

    #[test]
    fn second_chance_skips_used_then_evicts() {
        let mut lru: KeyedLru<u32, u32> = KeyedLru::new();
        lru.insert(1, 100);
        lru.insert(2, 200);
        // both entries start "used" (freshly inserted); first lap clears
        // both bits without evicting anything still marked evictable=true,
        // second lap evicts the head.
        let victim = lru.evict_second_chance(|_| true);
        assert_eq!(victim, Some((1, 100)));
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn second_chance_never_evicts_pinned_entry() {
        let mut lru: KeyedLru<u32, u32> = KeyedLru::new();
        lru.insert(1, 100);
        let victim = lru.evict_second_chance(|_| false);
        assert_eq!(victim, None);
        assert_eq!(lru.len(), 1);
    }
}
