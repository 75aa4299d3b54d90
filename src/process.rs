//! The VM-relevant slice of a process. Scheduling,
//! the rest of `Proc`'s fields, and the ready queues belong to the host;
//! this only carries what the segment/fault/syscall layers
//! need: the segment-slot array, the per-CPU MMU-flush flag this
//! process's CPUs participate in, and the per-process "selfish" page
//! pool.

use alloc::sync::Arc;

use crate::memory::pgalloc::ProcessPagePool;
use crate::mmu::ProcessId;
use crate::segment::SegmentHandle;

/// `NSEG`: number of segment slots a process has (`Proc.seg[]` in
/// `portdat.h`). Slot 0 is always the initial stack segment created at
/// `exec` time; `segdetach` refuses to remove it.
pub const NSEG: usize = 8;

pub const INITIAL_STACK_SLOT: usize = 0;

/// Base user-page size used for the per-process selfish pool
/// (the original's per-process cache); hosts with a different default
/// page size construct `Proc::new` with their own value instead of this
/// constant directly.
const SELFISH_POOL_CAPACITY: usize = 32;

pub struct Proc {
    pub id: ProcessId,
    seg: [Option<SegmentHandle>; NSEG],
    /// The selfish per-process page pool, consulted by the
    /// fault handler before the global allocator.
    pub page_pool: ProcessPagePool,
}

impl Proc {
    pub fn new(id: ProcessId, base_page_size_log2: u8) -> Self {
        Proc {
            id,
            seg: Default::default(),
            page_pool: ProcessPagePool::new(SELFISH_POOL_CAPACITY, base_page_size_log2),
        }
    }

    pub fn seg(&self, slot: usize) -> Option<&SegmentHandle> {
        self.seg.get(slot).and_then(|s| s.as_ref())
    }

    pub fn set_seg(&mut self, slot: usize, seg: Option<SegmentHandle>) {
        self.seg[slot] = seg;
    }

    /// Finds the slot, if any, whose range contains `va`
    /// (`seg(proc, addr, lock)`'s lookup half — locking itself is the
    /// caller's job since only the segment's own qlock needs holding,
    /// not anything at the process level).
    pub fn seg_containing(&self, va: usize) -> Option<(usize, &SegmentHandle)> {
        self.seg.iter().enumerate().find_map(|(i, s)| {
            let s = s.as_ref()?;
            (va >= s.base() && va < s.top()).then(|| (i, s))
        })
    }

    /// First free slot, used by `segattach` to pick where to install a
    /// newly attached segment.
    pub fn free_slot(&self) -> Option<usize> {
        self.seg.iter().position(|s| s.is_none())
    }

    pub fn iter_segs(&self) -> impl Iterator<Item = (usize, &SegmentHandle)> {
        self.seg.iter().enumerate().filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }
}

/// A process table entry set: the minimal "every process that might share
/// a segment" registry the segment manager needs to compute which CPUs to
/// shoot down. A real kernel's scheduler owns the
/// authoritative process table; this is the narrow read-only view this
/// crate needs from it.
pub trait ProcessDirectory: Send + Sync {
    /// CPUs currently running a process that has `seg` mapped in any
    /// slot, used to build the shootdown CPU list for `mfreeseg` and for
    /// fork-time shallow DATA copies.
    fn cpus_referencing(&self, seg: &SegmentHandle) -> alloc::vec::Vec<usize>;
}

pub type ProcHandle = Arc<spin::Mutex<Proc>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_slot_finds_first_empty_and_respects_initial_stack() {
        let proc = Proc::new(1, 12);
        assert_eq!(proc.free_slot(), Some(0));
        assert_eq!(INITIAL_STACK_SLOT, 0);
    }
}
