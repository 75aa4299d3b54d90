//! The MMU shim: interface only. The target architecture
//! supplies the implementation; this module defines the contract every
//! implementation must satisfy, and the cross-CPU shootdown coordinator
//! that the segment manager and fault handler drive.
//!
//! Grounded on `memory::vspace`'s trait boundary
//! (`AddressSpace`, `MapAction`, `TlbFlushHandle` as used by
//! `arch::unix::vspace::VSpace`): the kernel core defines the contract,
//! the architecture layer provides the page-table encoding.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::KError;
use crate::memory::page::PageHandle;

/// Mapping permissions requested of an MMU install (`mmuput`'s flags
/// argument in the original, `MapAction` in `arch::unix::vspace`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MapAction {
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
    pub cached: bool,
}

impl MapAction {
    pub const fn read_only() -> Self {
        MapAction { writable: false, executable: false, user: true, cached: true }
    }

    pub const fn read_write() -> Self {
        MapAction { writable: true, executable: false, user: true, cached: true }
    }

    pub const fn read_write_uncached() -> Self {
        MapAction { writable: true, executable: false, user: true, cached: false }
    }

    pub const fn read_execute() -> Self {
        MapAction { writable: false, executable: true, user: true, cached: true }
    }
}

/// A single process's page-table root and bookkeeping (`Proc.mmuhead`
/// equivalent). Opaque to this crate: only the architecture layer knows
/// the on-disk/in-memory encoding of a page table.
pub type ProcessId = u32;

/// The architecture-supplied MMU implementation. Every
/// implementation must satisfy:
///
/// - installing the same `(va, page)` pair twice is idempotent;
/// - `release` frees every PTP page the process owns back to the PTP
///   pool, disjoint from `memory::PageAllocator`;
/// - a `flush_page` of page `P` invalidates any TLB that could contain a
///   translation for `P`, on every CPU currently running the owning
///   process.
pub trait Mmu: Send + Sync {
    /// `mmuput(process, page, flags)`: installs a single translation.
    fn put(&self, proc: ProcessId, va: usize, page: &PageHandle, action: MapAction) -> Result<(), KError>;

    /// `mmuwalk(va, level, alloc_fn?)`: architecture-level page-table walk,
    /// used by the fault handler only to discover whether a translation
    /// already exists at a given level; never used to synthesize one
    /// outside of `put`.
    fn resolve(&self, proc: ProcessId, va: usize) -> Option<(PageHandle, MapAction)>;

    /// `mmuswitch()`: activates `proc`'s address space on the calling CPU.
    fn switch_to(&self, proc: ProcessId);

    /// `mmurelease(process)`: tears down every mapping and frees every PTP
    /// page the process owns.
    fn release(&self, proc: ProcessId);

    /// `mmuflush()`: invalidates every TLB entry for the calling CPU's
    /// current process.
    fn flush_local(&self);

    /// `mmuflushpg(page)`: invalidates `page`'s translation for the
    /// calling CPU's current process only. Cross-CPU invalidation is the
    /// shootdown coordinator's job, not this call's.
    fn flush_page_local(&self, page: &PageHandle);
}

/// One flag per CPU (`Proc.mmuflush`/per-CPU `Mach.mmuflush` pairing in
/// the original): set by the initiator before a page can be freed or
/// re-pointed, cleared by the owning CPU "on the next clock interrupt
/// after a context switch". A real kernel clears these from
/// its scheduler tick; this crate only models the flag array and the
/// spin-until-clear barrier, since scheduling belongs to the host, not
/// this crate.
pub struct ShootdownFlags {
    /// Cache-padded so one CPU spinning on its neighbor's flag in
    /// `wait_for` doesn't bounce the cache line backing a third CPU's
    /// unrelated flag (`Mach` structs are one per CPU and never share a
    /// line in the original for the same reason).
    flags: Vec<CachePadded<AtomicBool>>,
}

impl ShootdownFlags {
    pub fn new(ncpu: usize) -> Self {
        let mut flags = Vec::with_capacity(ncpu);
        flags.resize_with(ncpu, || CachePadded::new(AtomicBool::new(false)));
        ShootdownFlags { flags }
    }

    /// Raises the flag on every CPU in `cpus`, matching `mfreeseg`'s "set
    /// mmuflush on every CPU whose current process references this
    /// segment" step.
    pub fn request(&self, cpus: &[usize]) {
        for &cpu in cpus {
            self.flags[cpu].store(true, Ordering::Release);
        }
    }

    /// Called by CPU `cpu` once it has acted on the shootdown (flushed
    /// its TLB for the relevant page/segment).
    pub fn acknowledge(&self, cpu: usize) {
        self.flags[cpu].store(false, Ordering::Release);
    }

    /// Busy-waits until every requested CPU has acknowledged. This is the
    /// barrier required before a freed page re-enters a free
    /// list, or before a fork-time shallow-copied DATA segment is
    /// considered safe to let the child run.
    pub fn wait_for(&self, cpus: &[usize]) {
        for &cpu in cpus {
            while self.flags[cpu].load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
        }
    }

    /// Convenience: raise on `cpus`, then spin until every one clears.
    /// The caller is responsible for having *already* performed whatever
    /// action (clearing a segment slot, unmapping) must precede the
    /// shootdown becoming visible to other CPUs.
    pub fn shoot_and_wait(&self, cpus: &[usize]) {
        self.request(cpus);
        self.wait_for(cpus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shoot_and_wait_returns_once_acknowledged() {
        let flags = ShootdownFlags::new(4);
        flags.request(&[1, 2]);
        assert!(flags.flags[1].load(Ordering::Acquire));
        assert!(flags.flags[2].load(Ordering::Acquire));
        assert!(!flags.flags[0].load(Ordering::Acquire));
        flags.acknowledge(1);
        flags.acknowledge(2);
        flags.wait_for(&[1, 2]);
    }
}
