//! The fault handler: resolves an address-space fault into
//! a resolved, MMU-installed page — demand-loading from a segment's
//! backing channel, zero-filling first-touch pages, or materialising a
//! private copy on a write to a shared page. Grounded on `fault.c`
//! (`fault`, `fixfault`, `pagein`).

use alloc::vec;
use log::{error, trace};

use crate::config::Config;
use crate::error::KError;
use crate::external::PhysMemOps;
use crate::memory::page::PageHandle;
use crate::memory::pgalloc::PageAllocator;
use crate::mmu::{MapAction, Mmu, ProcessId};
use crate::segment::{SegmentHandle, SegmentStore, SegmentType};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultAccess {
    Read,
    Write,
}

/// `fault(virtual_addr, is_read)`. Holds references to the
/// collaborators a real fault path needs; none of them are owned here —
/// the host constructs one of these per CPU (or shares one behind `&`,
/// since every method here only takes shared references to its
/// collaborators and relies on their own internal locking).
pub struct FaultHandler<'a> {
    pub allocator: &'a PageAllocator,
    pub store: &'a SegmentStore,
    pub mmu: &'a dyn Mmu,
    pub phys_mem: &'a dyn PhysMemOps,
    #[allow(dead_code)]
    pub config: Config,
}

impl<'a> FaultHandler<'a> {
    pub fn new(
        allocator: &'a PageAllocator,
        store: &'a SegmentStore,
        mmu: &'a dyn Mmu,
        phys_mem: &'a dyn PhysMemOps,
        config: Config,
    ) -> Self {
        FaultHandler { allocator, store, mmu, phys_mem, config }
    }

    /// Resolves a fault at `va` against `seg` (the segment `seg(proc,
    /// addr, lock=true)` already picked out) and installs the result in
    /// `proc`'s MMU. Returns `Ok(())` on success; every `Err` other than
    /// `KError::Interrupted` is meant to be turned into a process kill by
    /// the caller (`faulterror` in the original — process teardown is
    /// a host concern, not owned by this crate).
    pub fn fault(&self, proc: ProcessId, seg: &SegmentHandle, va: usize, access: FaultAccess) -> Result<(), KError> {
        let page_size = 1usize << seg.page_size_log2();
        let va_aligned = va & !(page_size - 1);
        let offset = va_aligned - seg.base();

        if access == FaultAccess::Write && seg.flags().ronly() {
            return Err(KError::BadArgument);
        }

        let (page, action) = match seg.kind() {
            SegmentType::Text => {
                let page = self.pagein(seg, offset, true)?;
                (page, MapAction::read_execute())
            }
            SegmentType::Shared | SegmentType::Stack => {
                let page = self.first_touch(seg, offset)?;
                (page, MapAction::read_write())
            }
            SegmentType::Data => {
                let page = self.pagein(seg, offset, false)?;
                let page = self.copy_on_reference_if_shared(seg, offset, page, access)?;
                (page, MapAction::read_write())
            }
            SegmentType::Physical => {
                let page = self.physical_fault(seg, offset)?;
                (page, MapAction::read_write_uncached())
            }
            SegmentType::Free => return Err(KError::BadArgument),
        };

        page.set_va(va_aligned);
        trace!("fault: proc={} va={:#x} access={:?} pa={:#x}", proc, va_aligned, access, page.phys_addr);
        self.mmu.put(proc, va_aligned, &page, action)
    }

    /// Installs `candidate` into `seg`'s map slot at `offset` in a single
    /// critical section if the slot is still empty, so two callers racing
    /// the same unmapped offset never both observe it empty and both
    /// install. Returns `None` on a win (`candidate` is now resident) or
    /// `Some(existing)` on a loss (someone else's page got there first).
    fn claim_slot(seg: &SegmentHandle, offset: usize, candidate: &PageHandle) -> Option<PageHandle> {
        seg.with_map(|m| {
            let slot = m.walk(offset, true).expect("walk always succeeds with alloc=true");
            match slot.clone() {
                Some(existing) => Some(existing),
                None => {
                    *slot = Some(candidate.clone());
                    None
                }
            }
        })
    }

    /// First-touch zero-fill path (SHARED, STACK, and any segment's never
    /// before-touched slot): allocate, zero, install.
    fn first_touch(&self, seg: &SegmentHandle, offset: usize) -> Result<PageHandle, KError> {
        let page = self.allocator.alloc(seg.page_size_log2(), -1);
        self.phys_mem.zero(&page);
        match Self::claim_slot(seg, offset, &page) {
            None => Ok(page),
            Some(existing) => {
                if page.decref() == 0 {
                    self.allocator.free(page);
                }
                let _wait = existing.turnstile().lock();
                Ok(existing)
            }
        }
    }

    /// `pagein`: demand-loads a page's content through the segment's
    /// channel, chasing `src` first when the segment is a copy, and
    /// otherwise allocating+reading (or zero-filling past EOF for a DATA
    /// segment, since only TEXT segments fail past `flen` — DATA beyond
    /// the known file length is ordinary first-touch-ish zero-fill). Every
    /// install goes through `claim_slot` so a racing second fault on the
    /// same offset never clobbers the first installer's page.
    fn pagein(&self, seg: &SegmentHandle, offset: usize, is_text: bool) -> Result<PageHandle, KError> {
        if let Some(existing) = seg.with_map(|m| m.walk(offset, true).and_then(|s| s.clone())) {
            let _wait = existing.turnstile().lock();
            return Ok(existing);
        }

        if let Some(src) = seg.source() {
            if let Some(src_page) = src.lookup(offset) {
                src_page.incref();
                match Self::claim_slot(seg, offset, &src_page) {
                    None => {
                        let _wait = src_page.turnstile().lock();
                        return Ok(src_page);
                    }
                    Some(existing) => {
                        src_page.decref();
                        let _wait = existing.turnstile().lock();
                        return Ok(existing);
                    }
                }
            }
        }

        let file_len = seg.file_len();
        if !is_text && offset as u64 >= file_len {
            return self.first_touch(seg, offset);
        }

        let page = self.allocator.alloc(seg.page_size_log2(), -1);
        let guard = page.turnstile().lock();
        page.mark_loading();
        if let Some(existing) = Self::claim_slot(seg, offset, &page) {
            drop(guard);
            if page.decref() == 0 {
                self.allocator.free(page);
            }
            let _wait = existing.turnstile().lock();
            return Ok(existing);
        }

        let page_size = page.size();
        let channel = seg.channel();
        self.phys_mem.zero(&page);
        if let Some(ch) = channel {
            let file_off = offset as u64;
            let want = page_size.min(file_len.saturating_sub(file_off) as usize);
            if want > 0 {
                let mut buf = vec![0u8; want];
                let n = Self::readn(ch.as_ref(), &mut buf, file_off).map_err(|e| {
                    error!("pagein: demand load at offset={:#x} failed: {:?}", file_off, e);
                    e
                })?;
                self.phys_mem.write(&page, 0, &buf[..n]);
            }
        }
        page.mark_resident();
        drop(guard);
        Ok(page)
    }

    /// `readn`: loops a channel read until `buf` is full or the channel
    /// runs dry (a short read at EOF — the tail is left zero, matching
    /// TEXT's "zero-pad tail of last page"). An `Eintr` retries the read
    /// rather than failing the fault.
    fn readn(channel: &dyn crate::external::Channel, buf: &mut [u8], offset: u64) -> Result<usize, KError> {
        let mut got = 0usize;
        while got < buf.len() {
            match channel.read(&mut buf[got..], offset + got as u64) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(KError::Interrupted) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(got)
    }

    fn physical_fault(&self, seg: &SegmentHandle, offset: usize) -> Result<PageHandle, KError> {
        if let Some(existing) = seg.with_map(|m| m.walk(offset, true).and_then(|s| s.clone())) {
            return Ok(existing);
        }
        let producer = self.store.physical_producer(seg).ok_or(KError::BadArgument)?;
        let page = producer.produce(offset)?;
        match Self::claim_slot(seg, offset, &page) {
            None => Ok(page),
            Some(existing) => Ok(existing),
        }
    }

    /// Copy-on-reference: if the resolved page is shared
    /// (`ref > 1`) and this is a write, materialise a private copy before
    /// handing the page back.
    fn copy_on_reference_if_shared(
        &self,
        seg: &SegmentHandle,
        offset: usize,
        page: PageHandle,
        access: FaultAccess,
    ) -> Result<PageHandle, KError> {
        if access != FaultAccess::Write || page.ref_count() <= 1 {
            return Ok(page);
        }
        let fresh = self.allocator.alloc(page.size_log2(), -1);
        trace!("copy-on-reference: pa={:#x} (ref={}) -> pa={:#x}", page.phys_addr, page.ref_count(), fresh.phys_addr);
        self.phys_mem.copy(&fresh, &page);
        *seg.with_map(|m| m.walk(offset, true)).unwrap() = Some(fresh.clone());
        if page.decref() == 0 {
            self.allocator.free(page);
        }
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::external::{Channel, ColorOracle};
    use crate::memory::pgalloc::{MemoryBank, SizeClassConfig};
    use crate::memory::AllocatorKind;
    use alloc::sync::Arc;
    use spin::Mutex as SpinMutex;

    struct SingleColor;
    impl ColorOracle for SingleColor {
        fn color_of(&self, _p: usize) -> i32 {
            0
        }
        fn num_colors(&self) -> i32 {
            1
        }
    }

    struct VecPhysMem;
    impl PhysMemOps for VecPhysMem {
        fn zero(&self, _page: &PageHandle) {}
        fn copy(&self, _dst: &PageHandle, _src: &PageHandle) {}
        fn write(&self, _page: &PageHandle, _offset: usize, _data: &[u8]) {}
    }

    struct NullMmu {
        installed: SpinMutex<alloc::vec::Vec<(ProcessId, usize, usize)>>,
    }
    impl Mmu for NullMmu {
        fn put(&self, proc: ProcessId, va: usize, page: &PageHandle, _action: MapAction) -> Result<(), KError> {
            self.installed.lock().push((proc, va, page.phys_addr));
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

    struct FixedContentChannel {
        content: alloc::vec::Vec<u8>,
    }
    impl Channel for FixedContentChannel {
        fn dev_id(&self) -> u32 {
            1
        }
        fn qid_path(&self) -> u64 {
            1
        }
        fn qid_vers(&self) -> u32 {
            1
        }
        fn is_cacheable(&self) -> bool {
            false
        }
        fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, KError> {
            let off = offset as usize;
            if off >= self.content.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.content.len() - off);
            buf[..n].copy_from_slice(&self.content[off..off + n]);
            Ok(n)
        }
        fn write(&self, _buf: &[u8], _offset: u64) -> Result<usize, KError> {
            Ok(0)
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
    fn write_fault_on_readonly_segment_fails() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let mmu = NullMmu { installed: SpinMutex::new(alloc::vec::Vec::new()) };
        let phys = VecPhysMem;
        let handler = FaultHandler::new(&alloc, &store, &mmu, &phys, Config::default());
        let mut flags = crate::segment::SegmentFlags::default();
        flags.set_ronly(true);
        let seg = store.newseg(SegmentType::Data, flags, 0x1000, 0x2000, 12, None, 0, -1).unwrap();
        let res = handler.fault(1, &seg, 0x1000, FaultAccess::Write);
        assert!(res.is_err());
    }

    #[test]
    fn shared_first_touch_zero_fills_and_installs() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let mmu = NullMmu { installed: SpinMutex::new(alloc::vec::Vec::new()) };
        let phys = VecPhysMem;
        let handler = FaultHandler::new(&alloc, &store, &mmu, &phys, Config::default());
        let seg = store
            .newseg(SegmentType::Shared, crate::segment::SegmentFlags::default(), 0x1000, 0x2000, 12, None, 0, -1)
            .unwrap();
        handler.fault(1, &seg, 0x1000, FaultAccess::Read).unwrap();
        assert!(seg.lookup(0).is_some());
        assert_eq!(mmu.installed.lock().len(), 1);
    }

    #[test]
    fn text_demand_load_short_read_zero_pads_tail() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let mmu = NullMmu { installed: SpinMutex::new(alloc::vec::Vec::new()) };
        let phys = VecPhysMem;
        let handler = FaultHandler::new(&alloc, &store, &mmu, &phys, Config::default());
        let ch: Arc<dyn Channel> = Arc::new(FixedContentChannel { content: alloc::vec![7u8; 6000] });
        let seg = store
            .newseg(SegmentType::Text, crate::segment::SegmentFlags::default(), 0x1000, 0x3000, 12, Some(ch), 6000, -1)
            .unwrap();
        handler.fault(1, &seg, 0x2000, FaultAccess::Read).unwrap();
        let page = seg.lookup(0x1000).unwrap();
        assert_eq!(page.size_log2(), 12);
    }

    #[test]
    fn data_fault_past_file_len_zero_fills() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let mmu = NullMmu { installed: SpinMutex::new(alloc::vec::Vec::new()) };
        let phys = VecPhysMem;
        let handler = FaultHandler::new(&alloc, &store, &mmu, &phys, Config::default());
        let seg = store
            .newseg(SegmentType::Data, crate::segment::SegmentFlags::default(), 0x1000, 0x2000, 12, None, 0, -1)
            .unwrap();
        handler.fault(1, &seg, 0x1000, FaultAccess::Write).unwrap();
        assert!(seg.lookup(0).is_some());
    }

    #[test]
    fn data_copy_on_reference_materialises_private_page_on_write() {
        let alloc = alloc_4k_only();
        let store = SegmentStore::new(Config::default());
        let mmu = NullMmu { installed: SpinMutex::new(alloc::vec::Vec::new()) };
        let phys = VecPhysMem;
        let handler = FaultHandler::new(&alloc, &store, &mmu, &phys, Config::default());
        let seg = store
            .newseg(SegmentType::Data, crate::segment::SegmentFlags::default(), 0x1000, 0x2000, 12, None, 0, -1)
            .unwrap();
        let shared = alloc.alloc(12, -1);
        shared.incref();
        *seg.with_map(|m| m.walk(0, true)).unwrap() = Some(shared.clone());
        handler.fault(1, &seg, 0x1000, FaultAccess::Write).unwrap();
        let resolved = seg.lookup(0).unwrap();
        assert!(!Arc::ptr_eq(&resolved, &shared) || resolved.phys_addr != shared.phys_addr);
    }
}
