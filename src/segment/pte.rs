//! Sparse per-segment page table. Grounded on `segment.c`'s
//! `segwalk`/`ptealloc`/`segmapsize` and `portdat.h`'s `Pte`/`Segment.map`.
//!
//! A `Segment` doesn't map every page up front: `map` is a sparse array of
//! `Option<Ptemap>` leaves, one per `PTEPERTAB`-sized outer slot, allocated
//! the first time a page in that slot is touched.

use alloc::vec::Vec;
use static_assertions::const_assert;

use crate::memory::page::PageHandle;

/// Entries per leaf table (`PTEPERTAB` in `portdat.h`).
pub const PTE_PER_TAB: usize = 256;

const_assert!(PTE_PER_TAB.is_power_of_two());

/// One leaf of the sparse page table: up to `PTE_PER_TAB` page slots, plus
/// `first`/`last` bounds so iteration (fork, unmap) can skip empty
/// prefixes/suffixes without scanning all 256 entries.
#[derive(Default)]
pub struct Ptemap {
    pages: Vec<Option<PageHandle>>,
    first: usize,
    last: usize,
}

impl Ptemap {
    fn new() -> Self {
        Ptemap { pages: core::iter::repeat_with(|| None).take(PTE_PER_TAB).collect(), first: PTE_PER_TAB, last: 0 }
    }

    fn note_touched(&mut self, index: usize) {
        if index < self.first {
            self.first = index;
        }
        if index >= self.last {
            self.last = index + 1;
        }
    }

    pub fn get(&self, index: usize) -> Option<&PageHandle> {
        self.pages.get(index).and_then(|s| s.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.first >= self.last
    }

    /// Iterates only the `[first, last)` span that was ever touched,
    /// matching the original's bounded scan during fork/unmap.
    pub fn iter_touched(&self) -> impl Iterator<Item = (usize, &PageHandle)> {
        self.pages[self.first.min(self.pages.len())..self.last.min(self.pages.len())]
            .iter()
            .enumerate()
            .filter_map(move |(i, slot)| slot.as_ref().map(|pg| (i + self.first, pg)))
    }
}

/// A segment's sparse page table (`Segment.map`/`mapsize`/`first`/`last`).
pub struct SegmentMap {
    pgsz: usize,
    map: Vec<Option<Ptemap>>,
    first: usize,
    last: usize,
}

impl SegmentMap {
    pub fn new(pgsz: usize) -> Self {
        SegmentMap { pgsz, map: Vec::new(), first: usize::MAX, last: 0 }
    }

    fn outer_inner(&self, offset: usize) -> (usize, usize) {
        let tab_span = PTE_PER_TAB * self.pgsz;
        (offset / tab_span, (offset % tab_span) / self.pgsz)
    }

    fn grow(&mut self, outer: usize) {
        if outer >= self.map.len() {
            self.map.resize_with(outer + 1, || None);
        }
    }

    /// `segwalk(s, addr, alloc)`: returns the page slot for `offset`
    /// (relative to the segment base), allocating the leaf `Ptemap` on
    /// demand when `alloc` is set. Returns `None` only when `alloc` is
    /// false and the leaf was never touched.
    pub fn walk(&mut self, offset: usize, alloc: bool) -> Option<&mut Option<PageHandle>> {
        let (outer, inner) = self.outer_inner(offset);
        if outer >= self.map.len() {
            if !alloc {
                return None;
            }
            self.grow(outer);
        }
        if self.map[outer].is_none() {
            if !alloc {
                return None;
            }
            self.map[outer] = Some(Ptemap::new());
        }
        let leaf = self.map[outer].as_mut()?;
        leaf.note_touched(inner);
        if outer < self.first {
            self.first = outer;
        }
        if outer >= self.last {
            self.last = outer + 1;
        }
        Some(&mut leaf.pages[inner])
    }

    pub fn lookup(&self, offset: usize) -> Option<&PageHandle> {
        let (outer, inner) = self.outer_inner(offset);
        self.map.get(outer)?.as_ref()?.get(inner)
    }

    /// Iterates every present `(offset, page)` pair across touched leaves
    /// only, matching `mfreeseg`'s bounded sweep.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &PageHandle)> {
        let pgsz = self.pgsz;
        let tab_span = PTE_PER_TAB * pgsz;
        self.map[self.first.min(self.map.len())..self.last.min(self.map.len())]
            .iter()
            .enumerate()
            .filter_map(move |(oi, leaf)| leaf.as_ref().map(|l| (oi, l)))
            .flat_map(move |(oi, leaf)| {
                leaf.iter_touched().map(move |(ii, pg)| (oi * tab_span + ii * pgsz, pg))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page::Page;

    #[test]
    fn walk_allocates_leaf_on_demand() {
        let mut map = SegmentMap::new(4096);
        assert!(map.lookup(0).is_none());
        let slot = map.walk(0, true).unwrap();
        *slot = Some(Page::new(0x1000, 12, 0));
        assert!(map.lookup(0).is_some());
    }

    #[test]
    fn walk_without_alloc_does_not_touch_missing_leaf() {
        let mut map = SegmentMap::new(4096);
        assert!(map.walk(4096 * 1000, false).is_none());
    }

    #[test]
    fn iter_only_visits_touched_range() {
        let mut map = SegmentMap::new(4096);
        *map.walk(0, true).unwrap() = Some(Page::new(0x1000, 12, 0));
        *map.walk(4096 * 300, true).unwrap() = Some(Page::new(0x2000, 12, 0));
        let offsets: Vec<usize> = map.iter().map(|(o, _)| o).collect();
        assert_eq!(offsets, vec![0, 4096 * 300]);
    }
}
