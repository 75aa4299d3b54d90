//! Consumed interfaces: the boundary this crate calls *out*
//! through instead of owning. Grounded on `chan.c`/`devmnt.c` (the channel
//! read/write and RPC shape), `port.c`'s `memcolor`, and `proc.c`'s `kproc`.
//!
//! `memory/mod.rs` draws this same line with its `PhysicalPageProvider`/
//! `PageTableProvider` traits: the kernel core defines the
//! contract, the architecture/platform layer provides the implementation.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::KError;
use crate::memory::page::PageHandle;

/// Raw physical-memory access (`Frame::zero`/`Frame::fill` and the
/// kernel-virtual-mapped memcpy `Frame::kernel_vaddr` makes
/// possible). This crate tracks page *ownership*, never dereferences
/// physical memory directly (see `memory::page`'s module doc) — zero-fill
/// (first-touch faults) and content copy (copy-on-reference, stack deep
/// copy on fork) are requested through this trait instead.
pub trait PhysMemOps: Send + Sync {
    /// Zero-fills `page` in place (`fault.c`'s first-touch zero-fill).
    fn zero(&self, page: &PageHandle);
    /// Copies `src`'s content into `dst` (`pagecopy` in `fault.c`'s
    /// copy-on-reference path, and the STACK deep-copy fork path).
    /// Both pages must be the same size.
    fn copy(&self, dst: &PageHandle, src: &PageHandle);
    /// Writes `data` into `page` starting at byte `offset` (`pagein`'s
    /// "copy the bytes just read off the channel into the frame" step).
    fn write(&self, page: &PageHandle, offset: usize, data: &[u8]);
}

/// A device or mount channel backing a TEXT/DATA segment or a cached file.
/// Stands in for `Chan` + its `dev->read`/`dev->write` entry points.
pub trait Channel: Send + Sync {
    /// Opaque device identifier, used together with `qid_path` as the file
    /// cache key (§4.E).
    fn dev_id(&self) -> u32;
    /// `qid.path`: the filesystem-unique identifier of the underlying file.
    fn qid_path(&self) -> u64;
    /// `qid.vers`: bumped by the server whenever the file's content changes;
    /// cache entries are invalidated when this no longer matches.
    fn qid_vers(&self) -> u32;
    /// `qid.type`: only `QTFILE`-like channels are cacheable (`cacheable()`
    /// in `cache.c`).
    fn is_cacheable(&self) -> bool;
    /// Synchronous read of `len` bytes at `offset`. May return fewer bytes
    /// than requested (short read at EOF) but never more.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, KError>;
    /// Synchronous write of `buf` at `offset`.
    fn write(&self, buf: &[u8], offset: u64) -> Result<usize, KError>;
}

/// A single in-flight read issued by `mcread`'s pipelined window (§4.E).
/// The file cache issues several of these back to back before collecting
/// any of them, matching `mntrdwring`'s fire-then-collect shape.
pub trait PendingRead: Send {
    /// Blocks until the read completes, returning the byte count actually
    /// read (a short read narrows `Segment::clength`, see `ceof`).
    fn collect(self: Box<Self>) -> Result<usize, KError>;
    /// Cancels an in-flight read during error unwind (`mcread`'s
    /// `waserror` cleanup path aborts every RPC still outstanding).
    fn abort(self: Box<Self>);
}

/// RPC façade used by the read-ahead path to issue windowed, pipelined
/// reads without blocking on each one individually.
pub trait RpcTransport: Send + Sync {
    fn read_async(
        &self,
        channel: &dyn Channel,
        buf: &mut [u8],
        offset: u64,
    ) -> Box<dyn PendingRead>;
}

/// NUMA/cache coloring oracle (`memcolor` in `page.c`): maps a physical
/// address to the color class the allocator should bucket it under.
pub trait ColorOracle: Send + Sync {
    fn color_of(&self, phys_addr: usize) -> i32;
    /// Number of distinct colors in use; `-1`/`ANYCOLOR` requests bypass
    /// this and match any color.
    fn num_colors(&self) -> i32;
}

/// Any color matches — used when `Config::nocolors` is set or a caller has
/// no color preference.
pub const ANY_COLOR: i32 = -1;

/// Background worker spawn point (`kproc` in `proc.c`), used by the
/// read-ahead pool to start up to `NRPROCS` helper workers on demand.
pub trait Spawner: Send + Sync {
    fn spawn(&self, name: &'static str, work: Box<dyn FnOnce() + Send>);
}

/// Point-in-time snapshot of one allocator class's bookkeeping, the same
/// `AllocatorStatistics` shape `memory/mod.rs` already
/// defines, generalized to any of the three allocator kinds.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocatorSnapshot {
    pub size_log2: u8,
    pub free: usize,
    pub allocated: usize,
    pub capacity: usize,
    pub nsplit: usize,
    pub nbundled: usize,
}

/// Segment-cache and file-cache summary snapshot (`segsummary`/
/// `cachesummary` in the original).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CacheSnapshot {
    pub entries: usize,
    pub bytes: usize,
    pub lru_evictions: u64,
}

/// Polling surface for whoever wants periodic summaries of allocator and
/// cache state (a console driver, a metrics exporter) without this crate
/// owning how that surface is rendered.
pub trait SummaryRegistry: Send + Sync {
    fn allocator_summaries(&self) -> Vec<AllocatorSnapshot>;
    fn segment_cache_summary(&self) -> CacheSnapshot;
    fn file_cache_summary(&self) -> CacheSnapshot;
}
