//! The per-process virtual-address-space abstraction:
//! segments, their sparse page-table maps, fork/copy-on-reference, the
//! shared text cache, and stack recycling. Grounded on `segment.c`
//! (`newseg`, `forkseg`, `mfreeseg`, `relocateseg`) and on
//! `memory::vspace::MappingInfo` for how a mapped range's bookkeeping is
//! shaped in a typed Rust implementation.

pub mod pte;
pub mod text_cache;

use alloc::sync::Arc;
use alloc::vec::Vec;
use bit_field::BitField;
use log::trace;
use spin::Mutex;

use crate::config::Config;
use crate::error::KError;
use crate::external::Channel;
use crate::memory::page::PageHandle;
use crate::memory::pgalloc::PageAllocator;
use crate::mmu::ShootdownFlags;
use pte::SegmentMap;
use text_cache::{TextCache, TextCacheKey};

/// `SEGMAXSIZE`: the largest span a single segment may cover. The
/// original ties this to the architecture's address-space width; kept
/// here as a generous default a host can't be meaningfully bound by
/// without its own MMU in scope.
pub const SEGMAXSIZE: usize = 1 << 40;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentType {
    Text,
    Data,
    Stack,
    Shared,
    Physical,
    Free,
}

/// Packed `RONLY`/`CEXEC`/`CACHE` flags (`Segment.flags` bitmask in
/// `portdat.h`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SegmentFlags(u8);

impl SegmentFlags {
    pub fn new(ronly: bool, cexec: bool, cache: bool) -> Self {
        let mut bits = 0u8;
        bits.set_bit(0, ronly);
        bits.set_bit(1, cexec);
        bits.set_bit(2, cache);
        SegmentFlags(bits)
    }

    pub fn ronly(self) -> bool {
        self.0.get_bit(0)
    }

    pub fn set_ronly(&mut self, v: bool) {
        self.0.set_bit(0, v);
    }

    pub fn cexec(self) -> bool {
        self.0.get_bit(1)
    }

    pub fn cache(self) -> bool {
        self.0.get_bit(2)
    }
}

/// A source segment for copy-on-reference (`Segment.src` in the
/// original): everything not yet materialised in the owning segment's map
/// logically reads through here.
pub type SegmentHandle = Arc<Segment>;

/// Per-type page production for a PHYSICAL segment: physical
/// segments delegate page production to a caller-supplied allocator.
pub trait PhysicalPageProducer: Send + Sync {
    fn produce(&self, offset: usize) -> Result<PageHandle, KError>;
    /// Replaces the default `PageAllocator::free` on clear, if present.
    fn release(&self, page: PageHandle);
}

struct SegmentState {
    kind: SegmentType,
    flags: SegmentFlags,
    base: usize,
    top: usize,
    page_size_log2: u8,
    map: SegmentMap,
    src: Option<SegmentHandle>,
    channel: Option<Arc<dyn Channel>>,
    file_offset: u64,
    /// Known file length for TEXT/DATA-with-channel segments
    /// (`Segment.flen`); also the file cache's `clength`.
    file_len: u64,
    color: i32,
    cache_key: Option<TextCacheKey>,
    cached_bytes: usize,
    physical: Option<Arc<dyn PhysicalPageProducer>>,
}

/// A half-open virtual range on a single page size. The reference count
/// lives outside the lock (sequentially consistent atomics, like `Page`'s)
/// since ref changes must stay sequentially consistent independent of
/// whoever holds the map lock; everything else — type, flags, range, map,
/// source, cache membership — is guarded by one qlock, matching "a
/// segment: one qlock protecting its page map."
pub struct Segment {
    ref_count: core::sync::atomic::AtomicUsize,
    /// Set by `segflush`, cleared by whoever performs the
    /// icache coherence action "on next schedule" — a scheduler tick this
    /// crate doesn't own, so this is just the flag.
    icache_dirty: core::sync::atomic::AtomicBool,
    state: Mutex<SegmentState>,
}

impl Segment {
    fn new(
        kind: SegmentType,
        flags: SegmentFlags,
        base: usize,
        top: usize,
        page_size_log2: u8,
        channel: Option<Arc<dyn Channel>>,
        file_len: u64,
        color: i32,
    ) -> SegmentHandle {
        Arc::new(Segment {
            ref_count: core::sync::atomic::AtomicUsize::new(1),
            icache_dirty: core::sync::atomic::AtomicBool::new(false),
            state: Mutex::new(SegmentState {
                kind,
                flags,
                base,
                top,
                page_size_log2,
                map: SegmentMap::new(1usize << page_size_log2),
                src: None,
                channel,
                file_offset: 0,
                file_len,
                color,
                cache_key: None,
                cached_bytes: 0,
                physical: None,
            }),
        })
    }

    pub fn kind(&self) -> SegmentType {
        self.state.lock().kind
    }

    pub fn flags(&self) -> SegmentFlags {
        self.state.lock().flags
    }

    pub fn base(&self) -> usize {
        self.state.lock().base
    }

    pub fn top(&self) -> usize {
        self.state.lock().top
    }

    pub fn page_size_log2(&self) -> u8 {
        self.state.lock().page_size_log2
    }

    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.state.lock().channel.clone()
    }

    pub fn file_len(&self) -> u64 {
        self.state.lock().file_len
    }

    pub fn set_file_len(&self, len: u64) {
        self.state.lock().file_len = len;
    }

    /// Rewrites `top` in place (`segbrk`/`brk`). The caller
    /// has already validated alignment, `SEGMAXSIZE` and, for a shrink,
    /// unmapped the pages being dropped — this just records the new
    /// extent.
    pub fn set_top(&self, new_top: usize) {
        self.state.lock().top = new_top;
    }

    /// `segflush(va, length)`: marks the segment dirty for
    /// icache coherence on next schedule.
    pub fn mark_icache_dirty(&self) {
        self.icache_dirty.store(true, core::sync::atomic::Ordering::Release);
    }

    /// Clears and returns the icache-dirty flag; the scheduler calls this
    /// once per context switch into a process that maps this segment.
    pub fn take_icache_dirty(&self) -> bool {
        self.icache_dirty.swap(false, core::sync::atomic::Ordering::AcqRel)
    }

    pub fn source(&self) -> Option<SegmentHandle> {
        self.state.lock().src.clone()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(core::sync::atomic::Ordering::Acquire)
    }

    pub fn incref(&self) -> usize {
        self.ref_count.fetch_add(1, core::sync::atomic::Ordering::AcqRel) + 1
    }

    /// Returns the count after decrementing.
    pub fn decref(&self) -> usize {
        let prev = self.ref_count.fetch_sub(1, core::sync::atomic::Ordering::AcqRel);
        assert!(prev > 0, "Segment::decref: ref count underflow");
        prev - 1
    }

    /// `segwalk(segment, virtual_addr, alloc)`: resolves a
    /// faulting address to its page slot, creating intermediate `Ptemap`
    /// leaves on demand. The closure runs with the segment lock held, the
    /// same "caller holds the segment lock" contract `segwalk` states.
    pub fn with_map<R>(&self, f: impl FnOnce(&mut SegmentMap) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state.map)
    }

    pub fn lookup(&self, offset: usize) -> Option<PageHandle> {
        self.state.lock().map.lookup(offset).cloned()
    }
}

/// The segment store: recycles freed segments through two
/// pools (stacks kept separate from everything else so a freed stack's
/// pages can be reused without zero-fill), and owns the shared
/// text-segment cache.
pub struct SegmentStore {
    config: Config,
    text_cache: Mutex<TextCache>,
    stack_free: Mutex<Vec<SegmentHandle>>,
    nonstack_free: Mutex<Vec<SegmentHandle>>,
}

fn validate_range(base: usize, top: usize, page_size_log2: u8) -> Result<(), KError> {
    let pgsz = 1usize << page_size_log2;
    if base % pgsz != 0 || top % pgsz != 0 || top <= base {
        return Err(KError::BadArgument);
    }
    if top - base > SEGMAXSIZE {
        return Err(KError::NoVirtualMemory);
    }
    Ok(())
}

impl SegmentStore {
    pub fn new(config: Config) -> Self {
        SegmentStore {
            config,
            text_cache: Mutex::new(TextCache::new()),
            stack_free: Mutex::new(Vec::new()),
            nonstack_free: Mutex::new(Vec::new()),
        }
    }

    fn reuse_or_create(
        &self,
        kind: SegmentType,
        flags: SegmentFlags,
        base: usize,
        top: usize,
        page_size_log2: u8,
        channel: Option<Arc<dyn Channel>>,
        file_len: u64,
        color: i32,
    ) -> SegmentHandle {
        let pool = if kind == SegmentType::Stack { &self.stack_free } else { &self.nonstack_free };
        if let Some(seg) = pool.lock().pop() {
            let mut state = seg.state.lock();
            state.kind = kind;
            state.flags = flags;
            state.channel = channel;
            state.file_offset = 0;
            state.file_len = file_len;
            state.color = color;
            state.cache_key = None;
            state.cached_bytes = 0;
            state.physical = None;
            state.src = None;
            if kind == SegmentType::Stack && state.page_size_log2 == page_size_log2 {
                // Stack-pool fast path:
                // relocate the existing map in place by rewriting each
                // mapped page's `va`, instead of discarding and
                // rebuilding it. Offsets are base-relative so the map's
                // own indices don't change, only each page's absolute va.
                for (offset, page) in state.map.iter() {
                    page.set_va(base + offset);
                }
                state.base = base;
                state.top = top;
            } else {
                state.map = SegmentMap::new(1usize << page_size_log2);
                state.base = base;
                state.top = top;
                state.page_size_log2 = page_size_log2;
            }
            drop(state);
            seg.ref_count.store(1, core::sync::atomic::Ordering::Release);
            seg
        } else {
            Segment::new(kind, flags, base, top, page_size_log2, channel, file_len, color)
        }
    }

    /// `newseg(type, base, top, backing_chan?, page_size_log2)`.
    pub fn newseg(
        &self,
        kind: SegmentType,
        flags: SegmentFlags,
        base: usize,
        top: usize,
        page_size_log2: u8,
        channel: Option<Arc<dyn Channel>>,
        file_len: u64,
        color: i32,
    ) -> Result<SegmentHandle, KError> {
        validate_range(base, top, page_size_log2)?;

        if kind == SegmentType::Text {
            if let Some(ref ch) = channel {
                if ch.is_cacheable() {
                    let key = TextCacheKey { dev: ch.dev_id(), qid_path: ch.qid_path() };
                    {
                        let mut cache = self.text_cache.lock();
                        if let Some(hit) = cache.lookup(&key) {
                            hit.incref();
                            return Ok(hit);
                        }
                    }
                    let seg = self.reuse_or_create(
                        kind,
                        flags,
                        base,
                        top,
                        page_size_log2,
                        channel,
                        file_len,
                        color,
                    );
                    seg.state.lock().cache_key = Some(key);
                    let mut cache = self.text_cache.lock();
                    // Someone may have raced us in since we dropped the
                    // lock to build `seg` (matches `newseg`'s "the loser
                    // discards its construction" — here the loser's
                    // fresh segment simply goes straight back to the
                    // non-stack pool instead of being inserted).
                    if let Some(hit) = cache.lookup(&key) {
                        hit.incref();
                        drop(cache);
                        self.nonstack_free.lock().push(seg);
                        return Ok(hit);
                    }
                    cache.insert(key, seg.clone());
                    self.maybe_reclaim_text_cache(&mut cache);
                    return Ok(seg);
                }
            }
        }

        Ok(self.reuse_or_create(kind, flags, base, top, page_size_log2, channel, file_len, color))
    }

    fn maybe_reclaim_text_cache(&self, cache: &mut TextCache) {
        while cache.over_capacity() {
            match cache.evict_one() {
                Some((key, seg)) => {
                    trace!("text cache: evicted dev={} qid_path={:#x}, {} entries remain", key.dev, key.qid_path, cache.len());
                    // The cache's own hold is gone; drop it to ref == 0
                    // through the ordinary recycling path.
                    self.recycle(seg);
                }
                None => break,
            }
        }
    }

    fn recycle(&self, seg: SegmentHandle) {
        let kind = seg.state.lock().kind;
        let pool = if kind == SegmentType::Stack { &self.stack_free } else { &self.nonstack_free };
        pool.lock().push(seg);
    }

    /// `putseg(segment)`: decrements the reference count and, on zero,
    /// unmaps every page still present and returns the segment object to
    /// its recycling pool.
    pub fn putseg(&self, allocator: &PageAllocator, seg: SegmentHandle) {
        if seg.decref() != 0 {
            return;
        }
        let kind = seg.state.lock().kind;
        if kind != SegmentType::Stack {
            let (base, top) = {
                let state = seg.state.lock();
                (state.base, state.top)
            };
            self.mfreeseg_no_shootdown(allocator, &seg, base, top);
        }
        // STACK segments keep their pages; the next stack allocation
        // relocates the existing map in place (see `reuse_or_create`).
        self.recycle(seg);
    }

    fn mfreeseg_no_shootdown(&self, allocator: &PageAllocator, seg: &SegmentHandle, from: usize, to: usize) {
        let collected = self.collect_range(seg, from, to);
        self.drop_collected(allocator, seg, collected);
    }

    fn collect_range(&self, seg: &SegmentHandle, from: usize, to: usize) -> Vec<PageHandle> {
        let mut state = seg.state.lock();
        let base = state.base;
        let pgsz = 1usize << state.page_size_log2;
        let mut collected = Vec::new();
        let mut off = from - base;
        let end = to - base;
        while off < end {
            if let Some(slot) = state.map.walk(off, false) {
                if let Some(pg) = slot.take() {
                    collected.push(pg);
                }
            }
            off += pgsz;
        }
        collected
    }

    fn drop_collected(&self, allocator: &PageAllocator, seg: &SegmentHandle, collected: Vec<PageHandle>) {
        let physical = seg.state.lock().physical.clone();
        for pg in collected {
            if pg.decref() == 0 {
                match &physical {
                    Some(producer) => producer.release(pg),
                    None => allocator.free(pg),
                }
            }
        }
    }

    /// `mfreeseg(segment, from, to)`: mass-unmap a range. The invariant
    /// that prevents a TLB retaining a translation to a freed frame is
    /// clear-then-flush-then-drop: slots are cleared under the segment
    /// lock first, the shootdown barrier runs next, and only then are the
    /// pages' references dropped (and, at zero, freed).
    pub fn mfreeseg(
        &self,
        allocator: &PageAllocator,
        seg: &SegmentHandle,
        from: usize,
        to: usize,
        shootdown: &ShootdownFlags,
        cpus: &[usize],
    ) {
        let collected = self.collect_range(seg, from, to);
        trace!("mfreeseg: [{:#x}, {:#x}) collected {} pages, shooting down {} cpus", from, to, collected.len(), cpus.len());
        shootdown.shoot_and_wait(cpus);
        self.drop_collected(allocator, seg, collected);
    }

    /// `clearseg(segment)`: unmaps the segment's entire range.
    pub fn clearseg(
        &self,
        allocator: &PageAllocator,
        seg: &SegmentHandle,
        shootdown: &ShootdownFlags,
        cpus: &[usize],
    ) {
        let (base, top) = {
            let state = seg.state.lock();
            (state.base, state.top)
        };
        self.mfreeseg(allocator, seg, base, top, shootdown, cpus);
    }

    /// `relocateseg(segment, new_base, old_base)`: rewrites every mapped
    /// page's `va` to reflect a new base, without touching the map's own
    /// offset-keyed structure (offsets are already base-relative) or
    /// copying any data.
    pub fn relocateseg(&self, seg: &SegmentHandle, new_base: usize, new_top: usize) {
        let mut state = seg.state.lock();
        for (offset, page) in state.map.iter() {
            page.set_va(new_base + offset);
        }
        state.base = new_base;
        state.top = new_top;
    }

    /// `prefaultseg(segment)`: touches every page in range so the demand
    /// loader runs up front. Left to the fault handler: this just walks
    /// the addresses and invokes the supplied fault callback per page,
    /// matching the original's simple loop over `fault()`.
    pub fn prefaultseg(&self, seg: &SegmentHandle, mut fault_one: impl FnMut(usize) -> Result<(), KError>) -> Result<(), KError> {
        let (base, top, pgsz) = {
            let state = seg.state.lock();
            (state.base, state.top, 1usize << state.page_size_log2)
        };
        let mut va = base;
        while va < top {
            fault_one(va)?;
            va += pgsz;
        }
        Ok(())
    }

    /// Sets the PHYSICAL segment's page producer: physical
    /// segments delegate page production to it.
    pub fn set_physical_producer(&self, seg: &SegmentHandle, producer: Arc<dyn PhysicalPageProducer>) {
        seg.state.lock().physical = Some(producer);
    }

    pub fn physical_producer(&self, seg: &SegmentHandle) -> Option<Arc<dyn PhysicalPageProducer>> {
        seg.state.lock().physical.clone()
    }

    /// `forkseg(child_proc, seg_index, share_flag)`. Returns the handle
    /// the child should install in its own `seg[]` slot. For a shallow
    /// DATA copy, also returns the list of pages that must be
    /// re-protected read-only and shot down in every other process still
    /// mapping the parent — the caller (process-fork code, a host concern
    /// this crate doesn't own) owns the MMU re-protect step and the
    /// shootdown itself.
    ///
    /// `deep_copy`, when given, is used instead of the shallow
    /// copy-on-reference path whenever `Config::nopageshare` is set: never
    /// shallow-copy DATA segments on fork, always deep-copy, trading fork
    /// cost for simpler ownership.
    pub fn forkseg(
        &self,
        parent: &SegmentHandle,
        share: bool,
        promote_to_text: bool,
        deep_copy: Option<(&PageAllocator, &dyn crate::external::PhysMemOps)>,
    ) -> ForkOutcome {
        let kind = parent.state.lock().kind;
        match kind {
            SegmentType::Text | SegmentType::Shared | SegmentType::Physical => {
                parent.incref();
                ForkOutcome { child: parent.clone(), shared_parent_pages: Vec::new() }
            }
            SegmentType::Data if share => {
                parent.incref();
                ForkOutcome { child: parent.clone(), shared_parent_pages: Vec::new() }
            }
            SegmentType::Data if self.config.nopageshare && deep_copy.is_some() => {
                let (allocator, phys_mem) = deep_copy.unwrap();
                let child = self.deep_copy_data(allocator, phys_mem, parent, promote_to_text);
                ForkOutcome { child, shared_parent_pages: Vec::new() }
            }
            SegmentType::Data => {
                let (base, top, page_size_log2, flags, color, src) = {
                    let state = parent.state.lock();
                    let src = state.src.clone().unwrap_or_else(|| parent.clone());
                    (state.base, state.top, state.page_size_log2, state.flags, state.color, src)
                };
                let child_kind = if promote_to_text { SegmentType::Text } else { SegmentType::Data };
                let child = self.reuse_or_create(child_kind, flags, base, top, page_size_log2, None, 0, color);
                {
                    let mut child_state = child.state.lock();
                    child_state.src = Some(src);
                }
                let mut shared_parent_pages = Vec::new();
                let mut parent_state = parent.state.lock();
                let base = parent_state.base;
                let pages: Vec<(usize, PageHandle)> =
                    parent_state.map.iter().map(|(o, p)| (o, p.clone())).collect();
                for (offset, page) in pages {
                    page.incref();
                    *child.state.lock().map.walk(offset, true).unwrap() = Some(page.clone());
                    shared_parent_pages.push(page);
                    let _ = base;
                }
                parent_state.flags.set_ronly(true);
                drop(parent_state);
                if promote_to_text {
                    if let Some(ch) = child.state.lock().channel.clone() {
                        if ch.is_cacheable() {
                            let key = TextCacheKey { dev: ch.dev_id(), qid_path: ch.qid_path() };
                            child.state.lock().cache_key = Some(key);
                            let mut cache = self.text_cache.lock();
                            cache.insert(key, child.clone());
                            self.maybe_reclaim_text_cache(&mut cache);
                        }
                    }
                }
                ForkOutcome { child, shared_parent_pages }
            }
            SegmentType::Stack => {
                // Deep copy is performed by the caller via `deep_copy_stack`
                // once it has a `PhysMemOps` handle and a fresh allocation;
                // this entry point only describes the shape expected.
                ForkOutcome { child: parent.clone(), shared_parent_pages: Vec::new() }
            }
            SegmentType::Free => {
                parent.incref();
                ForkOutcome { child: parent.clone(), shared_parent_pages: Vec::new() }
            }
        }
    }

    /// The STACK fork path (deep copy now, matching the original's
    /// "STACK: deep copy now"):
    /// allocates a fresh page per mapped slot in the parent, copies
    /// content via `phys_mem`, and installs the copies in a fresh
    /// segment. Kept as a dedicated entry point (rather than folded into
    /// `forkseg`) because it's the one fork path that needs a
    /// `PageAllocator` and a `PhysMemOps` to do its work.
    pub fn fork_stack(
        &self,
        allocator: &PageAllocator,
        phys_mem: &dyn crate::external::PhysMemOps,
        parent: &SegmentHandle,
    ) -> SegmentHandle {
        let (base, top, page_size_log2, flags, color) = {
            let state = parent.state.lock();
            (state.base, state.top, state.page_size_log2, state.flags, state.color)
        };
        let child = self.reuse_or_create(SegmentType::Stack, flags, base, top, page_size_log2, None, 0, color);
        let parent_pages: Vec<(usize, PageHandle)> = {
            let state = parent.state.lock();
            state.map.iter().map(|(o, p)| (o, p.clone())).collect()
        };
        for (offset, src_page) in parent_pages {
            let dst_page = allocator.alloc(page_size_log2, color);
            phys_mem.copy(&dst_page, &src_page);
            dst_page.set_va(base + offset);
            let mut child_state = child.state.lock();
            *child_state.map.walk(offset, true).unwrap() = Some(dst_page);
        }
        child
    }

    /// `Config::nopageshare`'s eager DATA fork path: same shape as
    /// `fork_stack` (fresh page per slot, content copied up front) but
    /// for a DATA segment — no `src` link, no read-only reprotection of
    /// the parent, since the child is independent from the moment it's
    /// created.
    fn deep_copy_data(
        &self,
        allocator: &PageAllocator,
        phys_mem: &dyn crate::external::PhysMemOps,
        parent: &SegmentHandle,
        promote_to_text: bool,
    ) -> SegmentHandle {
        let (base, top, page_size_log2, flags, color, channel, file_len) = {
            let state = parent.state.lock();
            (state.base, state.top, state.page_size_log2, state.flags, state.color, state.channel.clone(), state.file_len)
        };
        let child_kind = if promote_to_text { SegmentType::Text } else { SegmentType::Data };
        let child = self.reuse_or_create(child_kind, flags, base, top, page_size_log2, channel, file_len, color);
        let parent_pages: Vec<(usize, PageHandle)> = {
            let state = parent.state.lock();
            state.map.iter().map(|(o, p)| (o, p.clone())).collect()
        };
        for (offset, src_page) in parent_pages {
            let dst_page = allocator.alloc(page_size_log2, color);
            phys_mem.copy(&dst_page, &src_page);
            dst_page.set_va(base + offset);
            let mut child_state = child.state.lock();
            *child_state.map.walk(offset, true).unwrap() = Some(dst_page);
        }
        child
    }

    pub fn text_cache_len(&self) -> usize {
        self.text_cache.lock().len()
    }
}

/// Result of `SegmentStore::forkseg`'s DATA-share=false path: the new
/// child segment, plus every parent page that must now be re-protected
/// read-only (and shot down) in any other process that maps the parent.
pub struct ForkOutcome {
    pub child: SegmentHandle,
    pub shared_parent_pages: Vec<PageHandle>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ColorOracle;
    use crate::memory::pgalloc::{MemoryBank, SizeClassConfig};
    use crate::memory::AllocatorKind;

    struct SingleColor;
    impl ColorOracle for SingleColor {
        fn color_of(&self, _p: usize) -> i32 {
            0
        }
        fn num_colors(&self) -> i32 {
            1
        }
    }

    fn alloc_4k_only() -> PageAllocator {
        let banks = [MemoryBank { base: 0, len: 1 << 24 }];
        PageAllocator::new(
            Config::default(),
            alloc::vec![SizeClassConfig { size_log2: 12, kind: AllocatorKind::Prealloc }],
            &banks,
            &SingleColor,
        )
        .unwrap()
    }

    #[test]
    fn newseg_rejects_misaligned_range() {
        let store = SegmentStore::new(Config::default());
        let res = store.newseg(SegmentType::Data, SegmentFlags::default(), 1, 4096, 12, None, 0, -1);
        assert!(res.is_err());
    }

    #[test]
    fn fork_data_share_false_copies_map_shallow_and_protects_parent_ronly() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let parent = store
            .newseg(SegmentType::Data, SegmentFlags::default(), 0x1000, 0x2000, 12, None, 0, -1)
            .unwrap();
        let pg = alloc.alloc(12, -1);
        *parent.with_map(|m| m.walk(0, true)).unwrap() = Some(pg.clone());

        let outcome = store.forkseg(&parent, false, false, None);
        assert!(!Arc::ptr_eq(&outcome.child, &parent));
        assert_eq!(outcome.shared_parent_pages.len(), 1);
        assert_eq!(pg.ref_count(), 2, "page now referenced by both parent and child map");
        assert!(parent.flags().ronly(), "parent must be protected read-only after a shallow copy fork");
        assert!(Arc::ptr_eq(&outcome.child.source().unwrap(), &parent));
    }

    #[test]
    fn fork_data_share_true_shares_same_segment() {
        let store = SegmentStore::new(Config::default());
        let parent = store
            .newseg(SegmentType::Data, SegmentFlags::default(), 0x1000, 0x2000, 12, None, 0, -1)
            .unwrap();
        let before = parent.ref_count();
        let outcome = store.forkseg(&parent, true, false, None);
        assert!(Arc::ptr_eq(&outcome.child, &parent));
        assert_eq!(parent.ref_count(), before + 1);
    }

    #[test]
    fn putseg_to_zero_unmaps_and_recycles_nonstack_segment() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let seg = store
            .newseg(SegmentType::Data, SegmentFlags::default(), 0x1000, 0x2000, 12, None, 0, -1)
            .unwrap();
        let pg = alloc.alloc(12, -1);
        *seg.with_map(|m| m.walk(0, true)).unwrap() = Some(pg.clone());
        store.putseg(&alloc, seg);
        assert_eq!(pg.ref_count(), 0, "page must have been released back to the allocator");

        // the recycled segment object should be handed back out by the
        // next allocation from the non-stack pool.
        let reused = store
            .newseg(SegmentType::Data, SegmentFlags::default(), 0x3000, 0x4000, 12, None, 0, -1)
            .unwrap();
        assert_eq!(reused.ref_count(), 1);
    }

    #[test]
    fn stack_recycle_relocates_map_without_touching_pages() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let seg = store
            .newseg(SegmentType::Stack, SegmentFlags::default(), 0x1000, 0x2000, 12, None, 0, -1)
            .unwrap();
        let pg = alloc.alloc(12, -1);
        pg.set_va(0x1000);
        *seg.with_map(|m| m.walk(0, true)).unwrap() = Some(pg.clone());
        store.putseg(&alloc, seg);
        assert_eq!(pg.ref_count(), 1, "stack pages are not released on putseg");

        let next = store
            .newseg(SegmentType::Stack, SegmentFlags::default(), 0x5000, 0x6000, 12, None, 0, -1)
            .unwrap();
        let relocated = next.lookup(0).unwrap();
        assert_eq!(relocated.phys_addr, pg.phys_addr, "the same physical page is reused");
        assert_eq!(relocated.va(), 0x5000, "va rewritten to the new base, no copy");
    }

    #[test]
    fn set_top_and_icache_dirty_round_trip() {
        let store = SegmentStore::new(Config::default());
        let seg = store
            .newseg(SegmentType::Shared, SegmentFlags::default(), 0x1000, 0x2000, 12, None, 0, -1)
            .unwrap();
        seg.set_top(0x4000);
        assert_eq!(seg.top(), 0x4000);
        assert!(!seg.take_icache_dirty());
        seg.mark_icache_dirty();
        assert!(seg.take_icache_dirty());
        assert!(!seg.take_icache_dirty(), "flag clears after being taken once");
    }

    #[test]
    fn text_cache_hit_shares_identity_across_two_opens() {
        struct FakeChannel;
        impl Channel for FakeChannel {
            fn dev_id(&self) -> u32 {
                7
            }
            fn qid_path(&self) -> u64 {
                42
            }
            fn qid_vers(&self) -> u32 {
                1
            }
            fn is_cacheable(&self) -> bool {
                true
            }
            fn read(&self, _buf: &mut [u8], _offset: u64) -> Result<usize, KError> {
                Ok(0)
            }
            fn write(&self, _buf: &[u8], _offset: u64) -> Result<usize, KError> {
                Ok(0)
            }
        }
        let store = SegmentStore::new(Config::default());
        let ch: Arc<dyn Channel> = Arc::new(FakeChannel);
        let first = store
            .newseg(SegmentType::Text, SegmentFlags::default(), 0x1000, 0x2000, 12, Some(ch.clone()), 100, -1)
            .unwrap();
        let second = store
            .newseg(SegmentType::Text, SegmentFlags::default(), 0x1000, 0x2000, 12, Some(ch), 100, -1)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second), "two opens of the same (dev, qid) share the cached segment");
        assert_eq!(first.ref_count(), 2);
    }
}
