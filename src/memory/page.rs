//! `Page`: the allocator's unit of physical memory.
//! Grounded on `portdat.h`'s `Page` struct and `page.c`'s
//! `pganewpg`/`pgafreepg`/`putpage`.
//!
//! The original embeds `Page` in five intrusive lists at once (free-list
//! `next`, class-list `prev`/`next` via its owning `Pgalloc`, and the
//! segment's own pte slot). This crate doesn't replicate
//! intrusive links: a `Page` is reference-counted (`PageHandle = Arc<Page>`)
//! and list membership is a plain `Vec<PageHandle>` wherever the original
//! threaded a list through the struct itself.
//!
//! `owner`/`bundle_index`/`size_log2`/`va` are mutated only by
//! `memory::pgalloc` while it holds `PageAllocator`'s single global lock, or
//! by the fault handler while it holds the page's own turnstile — never
//! both at once — so plain atomics are enough; no extra per-page lock is
//! needed beyond the turnstile itself.

use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use alloc::sync::Arc;
use spin::Mutex;

/// Sentinel recorded in `bundle_index` for a page that isn't part of a
/// BUNDLE allocator's reserved run (`NOTBUNDLED` in `portdat.h`).
pub const NOT_BUNDLED: u8 = 0xFF;

/// Physical address type. An opaque `usize` here: this crate never
/// dereferences physical memory, it only tracks ownership and bookkeeping
/// over it (see DESIGN.md "Open Questions").
pub type PAddr = usize;

/// Identifies the `Pgalloc` a page currently belongs to (see
/// `memory::pgalloc::PgallocId`). Stored as a raw index rather than a
/// reference so `Page` doesn't need to know about its owner's type.
pub type PgallocId = u32;

/// A physical page. Cheap to clone (`Arc`); clones are the handle type
/// used everywhere a pointer to `Page` appeared in the original.
pub type PageHandle = Arc<Page>;

/// Load state of a page's backing content, `Page.n` in the original:
/// `n == 0` while a demand load is in flight, `n == 1` once resident.
/// Anyone who wants to read the page's content must go through the
/// turnstile until this is `Resident`; that's exactly `pagedin()`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum LoadState {
    Loading = 0,
    Resident = 1,
}

pub struct Page {
    /// Physical base address of this page. Immutable after construction.
    pub phys_addr: PAddr,
    size_log2: AtomicU8,
    bundle_index: AtomicU8,
    owner: AtomicU32,
    load_state: AtomicU8,
    /// Virtual address this page is currently mapped at, 0 if unset.
    /// Set once by the fault handler before installing the mmu entry.
    va: AtomicUsize,
    ref_count: AtomicUsize,
    /// Per-page "turnstile": held by whoever is demand-loading this page's
    /// content, released once loaded. Anyone else touching the page during
    /// a fault blocks on this instead of polling `load_state`.
    turnstile: Mutex<()>,
}

impl Page {
    /// A brand-new page, `ref == 0`, not yet claimed by anyone. Matches the
    /// state a page sits in inside a `Pgalloc`'s free list.
    pub fn new(phys_addr: PAddr, size_log2: u8, owner: PgallocId) -> PageHandle {
        Arc::new(Page {
            phys_addr,
            size_log2: AtomicU8::new(size_log2),
            bundle_index: AtomicU8::new(NOT_BUNDLED),
            owner: AtomicU32::new(owner),
            load_state: AtomicU8::new(LoadState::Resident as u8),
            va: AtomicUsize::new(0),
            ref_count: AtomicUsize::new(0),
            turnstile: Mutex::new(()),
        })
    }

    pub fn size_log2(&self) -> u8 {
        self.size_log2.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> usize {
        1usize << self.size_log2()
    }

    pub(crate) fn set_size_log2(&self, v: u8) {
        self.size_log2.store(v, Ordering::Relaxed);
    }

    pub fn bundle_index(&self) -> u8 {
        self.bundle_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_bundle_index(&self, v: u8) {
        self.bundle_index.store(v, Ordering::Relaxed);
    }

    pub fn owner(&self) -> PgallocId {
        self.owner.load(Ordering::Relaxed)
    }

    pub(crate) fn set_owner(&self, id: PgallocId) {
        self.owner.store(id, Ordering::Relaxed);
    }

    pub fn va(&self) -> usize {
        self.va.load(Ordering::Acquire)
    }

    pub fn set_va(&self, va: usize) {
        self.va.store(va, Ordering::Release);
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// `incref(pg)`.
    pub fn incref(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// `decref(pg)`. Returns the count *after* decrementing; the caller
    /// (`putpage`) is responsible for reclaiming the page once this hits 0.
    pub fn decref(&self) -> usize {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "Page::decref: ref count underflow");
        prev - 1
    }

    /// Marks a freshly-allocated page as claimed (`ref == 1`), matching
    /// `pganewpg`'s implicit handoff.
    pub(crate) fn claim(&self) {
        let prev = self.ref_count.swap(1, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "Page::claim: page was not free");
    }

    /// Resets a page back to the free state (`ref == 0`), as `pgafreepg`
    /// does before it's pushed back onto a free list.
    pub(crate) fn release_to_free(&self) {
        self.ref_count.store(0, Ordering::Release);
        self.load_state.store(LoadState::Resident as u8, Ordering::Release);
        self.va.store(0, Ordering::Release);
    }

    pub fn is_resident(&self) -> bool {
        self.load_state.load(Ordering::Acquire) == LoadState::Resident as u8
    }

    pub(crate) fn mark_loading(&self) {
        self.load_state.store(LoadState::Loading as u8, Ordering::Release);
    }

    pub(crate) fn mark_resident(&self) {
        self.load_state.store(LoadState::Resident as u8, Ordering::Release);
    }

    /// Locks the page's turnstile. The fault handler holds this guard for
    /// the duration of a demand load (`pagein`'s `qlock(new)`); anyone
    /// else who finds `load_state == Loading` blocks on the same lock
    /// instead (`pagedin`'s `qlock(pg); qunlock(pg);`).
    pub fn turnstile(&self) -> &Mutex<()> {
        &self.turnstile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_page_is_unclaimed() {
        let pg = Page::new(0x1000, 12, 0);
        assert_eq!(pg.ref_count(), 0);
        assert!(pg.is_resident());
        assert_eq!(pg.bundle_index(), NOT_BUNDLED);
    }

    #[test]
    fn claim_then_release_round_trips() {
        let pg = Page::new(0x1000, 12, 3);
        pg.claim();
        assert_eq!(pg.ref_count(), 1);
        pg.incref();
        assert_eq!(pg.ref_count(), 2);
        assert_eq!(pg.decref(), 1);
        assert_eq!(pg.decref(), 0);
        pg.release_to_free();
        assert_eq!(pg.ref_count(), 0);
    }

    #[test]
    #[should_panic(expected = "ref count underflow")]
    fn decref_below_zero_panics() {
        let pg = Page::new(0x1000, 12, 0);
        pg.decref();
    }
}
