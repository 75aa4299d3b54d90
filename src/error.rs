//! Error taxonomy.
//!
//! The original kernel unwinds with `waserror`/`nexterror`/`poperror`; here
//! every fallible operation returns a `Result` and every acquired lock is
//! released before the `Err` propagates, the same no-lock-leaked-on-error
//! guarantee the original's unwinding gave.

use custom_error::custom_error;

use crate::filecache::FileSystemError;

custom_error! {
    /// Errors a virtual-memory operation can hand back to its caller.
    ///
    /// Out-of-memory at the page-allocator level is deliberately *not* a
    /// variant here: the allocator panics rather than returning,
    /// after a reclaim attempt has already failed. `KError::OutOfMemory`
    /// is for higher layers that can still negotiate (e.g. a `GrowBackend`
    /// declining to grow) before that fatal point is reached.
    #[derive(Clone, PartialEq)]
    pub KError
    OutOfMemory = "no memory available for this request",
    NoVirtualMemory = "no virtual address space available",
    SegmentOverlap = "requested range overlaps an existing segment",
    BadArgument = "invalid argument",
    IoLoad = "demand load failed",
    Interrupted = "operation interrupted, retry",
    FileSystem{source: FileSystemError} = "file cache error: {source}",
}
