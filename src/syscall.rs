//! The user-visible system-call surface:
//! `segattach`/`segdetach`/`segfree`/`segflush`/`segbrk`/`brk`. Grounded on
//! `sysseg.c`, built entirely out of the collaborators the rest of this
//! crate already exposes (`SegmentStore`, `PageAllocator`, `Mmu`,
//! `ShootdownFlags`, `process::ProcessDirectory`) — this module owns no
//! state of its own beyond the address-search helper below.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::KError;
use crate::memory::pgalloc::PageAllocator;
use crate::mmu::{Mmu, ShootdownFlags};
use crate::process::{Proc, ProcessDirectory, INITIAL_STACK_SLOT};
use crate::segment::{PhysicalPageProducer, SegmentFlags, SegmentHandle, SegmentStore, SegmentType};

/// What a named attach class resolves to (`segattach`'s `attr`/`name`
/// pair in the original — e.g. a shared-memory class shared by cooperating
/// processes, or a named PHYSICAL segment such as a framebuffer). Resolved
/// by a host-supplied [`SegmentRegistry`]; this crate has no notion of
/// class names itself — the name-resolution layer belongs to the host.
pub struct AttachSpec {
    pub kind: SegmentType,
    pub page_size_log2: u8,
    /// Present only for `SegmentType::Physical` attach classes.
    pub producer: Option<Arc<dyn PhysicalPageProducer>>,
}

/// Resolves `segattach`'s `(attr, name)` pair to an attachable segment
/// specification. The host owns the namespace of attach classes (shared
/// memory by name, device-backed physical regions, ...); this crate only
/// needs to know what kind of segment results and, for PHYSICAL, how its
/// pages get produced.
pub trait SegmentRegistry: Send + Sync {
    fn resolve(&self, attr: &str, name: &str) -> Result<AttachSpec, KError>;
}

/// The syscall surface. Holds only shared references to its
/// collaborators, matching `FaultHandler`'s shape: all real state lives in
/// `PageAllocator`/`SegmentStore`/the architecture's `Mmu`, each already
/// safe to share behind `&`.
pub struct VmSyscalls<'a> {
    pub allocator: &'a PageAllocator,
    pub store: &'a SegmentStore,
    pub mmu: &'a dyn Mmu,
    pub shootdown: &'a ShootdownFlags,
    pub process_dir: &'a dyn ProcessDirectory,
}

fn round_up(n: usize, pgsz: usize) -> usize {
    (n + pgsz - 1) & !(pgsz - 1)
}

fn round_down(n: usize, pgsz: usize) -> usize {
    n & !(pgsz - 1)
}

impl<'a> VmSyscalls<'a> {
    pub fn new(
        allocator: &'a PageAllocator,
        store: &'a SegmentStore,
        mmu: &'a dyn Mmu,
        shootdown: &'a ShootdownFlags,
        process_dir: &'a dyn ProcessDirectory,
    ) -> Self {
        VmSyscalls { allocator, store, mmu, shootdown, process_dir }
    }

    /// `segattach(attr, name, hint_va, length) -> base_va`: maps a named
    /// segment into a free process slot. When `hint_va == 0`, the base
    /// address is chosen by searching downward from the initial stack
    /// segment for the first gap large enough to hold `length` bytes;
    /// otherwise `hint_va` must be page-aligned and free of
    /// overlap with every segment already attached to `proc`.
    pub fn segattach(
        &self,
        proc: &mut Proc,
        registry: &dyn SegmentRegistry,
        attr: &str,
        name: &str,
        hint_va: usize,
        length: usize,
    ) -> Result<usize, KError> {
        if length == 0 {
            return Err(KError::BadArgument);
        }
        let spec = registry.resolve(attr, name)?;
        let pgsz = 1usize << spec.page_size_log2;
        let span = round_up(length, pgsz);

        let base = if hint_va == 0 {
            self.pick_attach_address(proc, span, pgsz)?
        } else {
            if hint_va % pgsz != 0 {
                return Err(KError::BadArgument);
            }
            self.check_no_overlap(proc, hint_va, hint_va + span)?;
            hint_va
        };

        let slot = proc.free_slot().ok_or(KError::NoVirtualMemory)?;
        let seg = self.store.newseg(
            spec.kind,
            SegmentFlags::default(),
            base,
            base + span,
            spec.page_size_log2,
            None,
            0,
            -1,
        )?;
        if let Some(producer) = spec.producer {
            self.store.set_physical_producer(&seg, producer);
        }
        proc.set_seg(slot, Some(seg));
        Ok(base)
    }

    /// Searches downward from the stack segment's base for the first
    /// page-aligned gap of at least `span` bytes that overlaps none of
    /// `proc`'s existing segments: the original chooses an address when
    /// `hint_va == 0` by searching downward from the stack segment.
    fn pick_attach_address(&self, proc: &Proc, span: usize, pgsz: usize) -> Result<usize, KError> {
        let stack_base = proc.seg(INITIAL_STACK_SLOT).map(|s| s.base()).ok_or(KError::BadArgument)?;
        let ranges: Vec<(usize, usize)> = proc.iter_segs().map(|(_, s)| (s.base(), s.top())).collect();

        let mut candidate = round_down(stack_base.saturating_sub(span), pgsz);
        loop {
            if candidate.checked_add(span).map_or(true, |top| top > stack_base) {
                return Err(KError::NoVirtualMemory);
            }
            let conflict = ranges.iter().filter(|&&(b, t)| candidate < t && candidate + span > b).map(|&(b, _)| b).min();
            match conflict {
                None => return Ok(candidate),
                Some(lowest) => {
                    if lowest < span {
                        return Err(KError::NoVirtualMemory);
                    }
                    candidate = round_down(lowest - span, pgsz);
                }
            }
        }
    }

    fn check_no_overlap(&self, proc: &Proc, base: usize, top: usize) -> Result<(), KError> {
        let overlaps = proc.iter_segs().any(|(_, s)| base < s.top() && top > s.base());
        if overlaps {
            Err(KError::SegmentOverlap)
        } else {
            Ok(())
        }
    }

    /// `segdetach(va) -> 0`: removes the segment mapping `va` from `proc`.
    /// Rejects the initial stack segment. `putseg` only
    /// unmaps the segment's pages once this is the *last* reference — a
    /// TEXT/SHARED/PHYSICAL segment's map is the same shared structure
    /// every referencing process's `seg[]` slot points at, so dropping one
    /// process's reference must never clear pages still visible to
    /// another. Once detached, the calling CPU's TLB
    /// is flushed.
    pub fn segdetach(&self, proc: &mut Proc, va: usize) -> Result<(), KError> {
        let (slot, seg) = proc.seg_containing(va).ok_or(KError::BadArgument)?;
        if slot == INITIAL_STACK_SLOT {
            return Err(KError::BadArgument);
        }
        let seg = seg.clone();
        proc.set_seg(slot, None);
        self.store.putseg(self.allocator, seg);
        self.mmu.flush_local();
        Ok(())
    }

    /// `segfree(va, length) -> 0`: mass-unmaps `[va, va+length)` within the
    /// segment that contains `va`, clamped to the segment's own top.
    pub fn segfree(&self, proc: &Proc, va: usize, length: usize) -> Result<(), KError> {
        let (_, seg) = proc.seg_containing(va).ok_or(KError::BadArgument)?;
        let pgsz = 1usize << seg.page_size_log2();
        let from = round_down(va, pgsz);
        let to = round_up(va + length, pgsz).min(seg.top());
        if to <= from {
            return Err(KError::BadArgument);
        }
        let cpus = self.process_dir.cpus_referencing(seg);
        self.store.mfreeseg(self.allocator, seg, from, to, self.shootdown, &cpus);
        Ok(())
    }

    /// `segflush(va, length) -> 0`: marks the segment containing `va` for
    /// icache coherence on next schedule. `length` only needs to identify
    /// the segment — the original has no sub-range flush and always
    /// flushes the whole segment.
    pub fn segflush(&self, proc: &Proc, va: usize, _length: usize) -> Result<(), KError> {
        let (_, seg) = proc.seg_containing(va).ok_or(KError::BadArgument)?;
        seg.mark_icache_dirty();
        Ok(())
    }

    /// `segbrk(unused, addr) -> new_top`: grows or shrinks a non-TEXT/
    /// DATA/STACK segment to `addr`. Shrinking unmaps the dropped range
    /// first, the same clear-before-flush-before-drop ordering as
    /// `segfree`; growing only moves the boundary — new pages are
    /// demand-faulted, never allocated up front.
    pub fn segbrk(&self, proc: &Proc, va: usize, addr: usize) -> Result<usize, KError> {
        let (_, seg) = proc.seg_containing(va).ok_or(KError::BadArgument)?;
        match seg.kind() {
            SegmentType::Text | SegmentType::Data | SegmentType::Stack => return Err(KError::BadArgument),
            _ => {}
        }
        self.resize(seg, addr)
    }

    /// `brk(addr) -> 0`: grows (or shrinks) `proc`'s DATA segment to
    /// `addr`.
    pub fn brk(&self, proc: &Proc, addr: usize) -> Result<(), KError> {
        let (_, seg) =
            proc.iter_segs().find(|(_, s)| s.kind() == SegmentType::Data).ok_or(KError::BadArgument)?;
        self.resize(seg, addr)?;
        Ok(())
    }

    fn resize(&self, seg: &SegmentHandle, new_top: usize) -> Result<usize, KError> {
        let pgsz = 1usize << seg.page_size_log2();
        if new_top % pgsz != 0 || new_top <= seg.base() {
            return Err(KError::BadArgument);
        }
        if new_top - seg.base() > crate::segment::SEGMAXSIZE {
            return Err(KError::NoVirtualMemory);
        }
        let old_top = seg.top();
        if new_top < old_top {
            let cpus = self.process_dir.cpus_referencing(seg);
            self.store.mfreeseg(self.allocator, seg, new_top, old_top, self.shootdown, &cpus);
        }
        seg.set_top(new_top);
        Ok(new_top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::external::ColorOracle;
    use crate::memory::pgalloc::{MemoryBank, SizeClassConfig};
    use crate::memory::AllocatorKind;
    use crate::mmu::{MapAction, ProcessId};
    use crate::memory::page::PageHandle;

    struct SingleColor;
    impl ColorOracle for SingleColor {
        fn color_of(&self, _p: usize) -> i32 {
            0
        }
        fn num_colors(&self) -> i32 {
            1
        }
    }

    struct NullMmu;
    impl Mmu for NullMmu {
        fn put(&self, _proc: ProcessId, _va: usize, _page: &PageHandle, _action: MapAction) -> Result<(), KError> {
            Ok(())
        }
        fn resolve(&self, _proc: ProcessId, _va: usize) -> Option<(PageHandle, MapAction)> {
            None
        }
        fn switch_to(&self, _proc: ProcessId) {}
        fn release(&self, _proc: ProcessId) {}
        fn flush_local(&self) {}
        fn flush_page_local(&self, _page: &PageHandle) {}
    }

    struct NoSharers;
    impl ProcessDirectory for NoSharers {
        fn cpus_referencing(&self, _seg: &SegmentHandle) -> Vec<usize> {
            Vec::new()
        }
    }

    struct SharedOnlyRegistry;
    impl SegmentRegistry for SharedOnlyRegistry {
        fn resolve(&self, _attr: &str, _name: &str) -> Result<AttachSpec, KError> {
            Ok(AttachSpec { kind: SegmentType::Shared, page_size_log2: 12, producer: None })
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

    fn proc_with_stack(store: &SegmentStore, stack_base: usize, stack_top: usize) -> Proc {
        let mut proc = Proc::new(1, 12);
        let stack = store
            .newseg(SegmentType::Stack, SegmentFlags::default(), stack_base, stack_top, 12, None, 0, -1)
            .unwrap();
        proc.set_seg(INITIAL_STACK_SLOT, Some(stack));
        proc
    }

    #[test]
    fn segattach_with_hint_rejects_overlap() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let mmu = NullMmu;
        let shootdown = ShootdownFlags::new(1);
        let dir = NoSharers;
        let sys = VmSyscalls::new(&alloc, &store, &mmu, &shootdown, &dir);
        let mut proc = proc_with_stack(&store, 0x10_0000, 0x10_1000);
        let registry = SharedOnlyRegistry;

        let base = sys.segattach(&mut proc, &registry, "shared", "x", 0x2000, 0x1000).unwrap();
        assert_eq!(base, 0x2000);

        let res = sys.segattach(&mut proc, &registry, "shared", "y", 0x2000, 0x1000);
        assert!(matches!(res, Err(KError::SegmentOverlap)));
    }

    #[test]
    fn segattach_without_hint_searches_below_stack() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let mmu = NullMmu;
        let shootdown = ShootdownFlags::new(1);
        let dir = NoSharers;
        let sys = VmSyscalls::new(&alloc, &store, &mmu, &shootdown, &dir);
        let mut proc = proc_with_stack(&store, 0x10_0000, 0x10_1000);
        let registry = SharedOnlyRegistry;

        let base = sys.segattach(&mut proc, &registry, "shared", "x", 0, 0x1000).unwrap();
        assert!(base + 0x1000 <= 0x10_0000, "attach address must sit below the stack segment");

        let base2 = sys.segattach(&mut proc, &registry, "shared", "y", 0, 0x1000).unwrap();
        assert_ne!(base, base2, "second search must avoid the first attach's range");
    }

    #[test]
    fn segdetach_rejects_initial_stack_slot() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let mmu = NullMmu;
        let shootdown = ShootdownFlags::new(1);
        let dir = NoSharers;
        let sys = VmSyscalls::new(&alloc, &store, &mmu, &shootdown, &dir);
        let mut proc = proc_with_stack(&store, 0x10_0000, 0x10_1000);

        let res = sys.segdetach(&mut proc, 0x10_0000);
        assert!(matches!(res, Err(KError::BadArgument)));
    }

    #[test]
    fn segdetach_removes_non_stack_segment() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let mmu = NullMmu;
        let shootdown = ShootdownFlags::new(1);
        let dir = NoSharers;
        let sys = VmSyscalls::new(&alloc, &store, &mmu, &shootdown, &dir);
        let mut proc = proc_with_stack(&store, 0x10_0000, 0x10_1000);
        let registry = SharedOnlyRegistry;
        sys.segattach(&mut proc, &registry, "shared", "x", 0x2000, 0x1000).unwrap();

        sys.segdetach(&mut proc, 0x2000).unwrap();
        assert!(proc.seg_containing(0x2000).is_none());
    }

    #[test]
    fn segbrk_grows_shared_segment_and_rejects_core_kinds() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let mmu = NullMmu;
        let shootdown = ShootdownFlags::new(1);
        let dir = NoSharers;
        let sys = VmSyscalls::new(&alloc, &store, &mmu, &shootdown, &dir);
        let mut proc = proc_with_stack(&store, 0x10_0000, 0x10_1000);
        let registry = SharedOnlyRegistry;
        sys.segattach(&mut proc, &registry, "shared", "x", 0x2000, 0x1000).unwrap();

        let new_top = sys.segbrk(&proc, 0x2000, 0x4000).unwrap();
        assert_eq!(new_top, 0x4000);
        assert_eq!(proc.seg_containing(0x2000).unwrap().1.top(), 0x4000);

        let res = sys.segbrk(&proc, 0x10_0000, 0x10_2000);
        assert!(matches!(res, Err(KError::BadArgument)), "segbrk must reject the STACK segment");
    }

    #[test]
    fn brk_grows_data_segment() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let mmu = NullMmu;
        let shootdown = ShootdownFlags::new(1);
        let dir = NoSharers;
        let sys = VmSyscalls::new(&alloc, &store, &mmu, &shootdown, &dir);
        let mut proc = proc_with_stack(&store, 0x10_0000, 0x10_1000);
        let data = store.newseg(SegmentType::Data, SegmentFlags::default(), 0x3000, 0x4000, 12, None, 0, -1).unwrap();
        proc.set_seg(1, Some(data));

        sys.brk(&proc, 0x6000).unwrap();
        let (_, seg) = proc.iter_segs().find(|(_, s)| s.kind() == SegmentType::Data).unwrap();
        assert_eq!(seg.top(), 0x6000);
    }

    #[test]
    fn segflush_marks_segment_dirty() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let mmu = NullMmu;
        let shootdown = ShootdownFlags::new(1);
        let dir = NoSharers;
        let sys = VmSyscalls::new(&alloc, &store, &mmu, &shootdown, &dir);
        let mut proc = proc_with_stack(&store, 0x10_0000, 0x10_1000);
        let registry = SharedOnlyRegistry;
        sys.segattach(&mut proc, &registry, "shared", "x", 0x2000, 0x1000).unwrap();

        sys.segflush(&proc, 0x2000, 0x1000).unwrap();
        let (_, seg) = proc.seg_containing(0x2000).unwrap();
        assert!(seg.take_icache_dirty());
    }
}
