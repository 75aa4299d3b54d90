//! The shared text-segment cache: a hash keyed by
//! `qid.path` plus an LRU over all cached TEXT segments, reclaimed by
//! second-chance when it grows past `SCACHESIZE`.

use crate::cache::KeyedLru;
use crate::segment::SegmentHandle;

/// Default `SCACHESIZE` — the original picks this at compile time; kept
/// here as a sane default a host can override via
/// `TextCache::with_capacity`.
pub const SCACHESIZE: usize = 128;

/// `(dev, qid.path)`: identifies a cacheable TEXT segment's backing file.
/// `qid.type` isn't part of the key — only plain files produce TEXT
/// segments (`cacheable()` in the original already filters on that before
/// this key is ever built).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TextCacheKey {
    pub dev: u32,
    pub qid_path: u64,
}

pub struct TextCache {
    lru: KeyedLru<TextCacheKey, SegmentHandle>,
    capacity: usize,
}

impl TextCache {
    pub fn new() -> Self {
        TextCache { lru: KeyedLru::new(), capacity: SCACHESIZE }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        TextCache { lru: KeyedLru::new(), capacity }
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    /// Looks up a cached TEXT segment and bumps it, matching `newseg`'s
    /// "on hit, bump the LRU and return an additional reference" (the
    /// caller is responsible for `incref`ing before handing the segment
    /// out — see `SegmentStore::newseg`).
    pub fn lookup(&mut self, key: &TextCacheKey) -> Option<SegmentHandle> {
        self.lru.touch(key).cloned()
    }

    pub fn insert(&mut self, key: TextCacheKey, seg: SegmentHandle) {
        self.lru.insert(key, seg);
    }

    pub fn remove(&mut self, key: &TextCacheKey) -> Option<SegmentHandle> {
        self.lru.remove(key)
    }

    pub fn over_capacity(&self) -> bool {
        self.lru.len() > self.capacity
    }

    /// Evicts the first segment whose only remaining referrer is the
    /// cache itself (`ref == 1`, the victim-selection rule: never evict a
    /// segment still mapped by a live process).
    pub fn evict_one(&mut self) -> Option<(TextCacheKey, SegmentHandle)> {
        self.lru.evict_second_chance(|seg| seg.ref_count() == 1)
    }
}

impl Default for TextCache {
    fn default() -> Self {
        Self::new()
    }
}
