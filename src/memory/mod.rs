//! Physical memory management: the multi-size page
//! allocator, its `Page` unit of accounting, and the small index-based
//! arena that replaces the original's intrusive pointer links (see
//! `arena`'s module doc).

pub mod arena;
pub mod page;
pub mod pgalloc;

pub use page::{LoadState, PAddr, Page, PageHandle, NOT_BUNDLED};
pub use pgalloc::{
    AllocatorKind, MemoryBank, PageAllocator, PgallocId, ProcessPagePool, SizeClassConfig,
};
