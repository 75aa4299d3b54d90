//! Boot-time configuration flags.
//!
//! The original reads these through `getconf("*flag")` at boot and never
//! touches them again; we thread an explicit `Config` through constructors
//! instead of stashing them in a global, preferring explicit state over
//! ambient globals on hot paths.

/// Boot configuration, built once and handed to `PageAllocator`,
/// `SegmentStore` and `FileCache` at construction time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    /// `*nocache`: disable the file-content cache entirely (every `cread`
    /// becomes a direct RPC, no segment is attached).
    pub nocache: bool,
    /// `*nolater`: run deferred reclaim work inline instead of queuing it.
    pub nolater: bool,
    /// `*joinpages`: rejoin freed bundle/split pages back into their parent
    /// immediately. Disabling this trades fragmentation for cheaper frees.
    pub joinpages: bool,
    /// `*nocolors`: disable NUMA-color-aware allocation; every request is
    /// treated as color-agnostic.
    pub nocolors: bool,
    /// `*testpage`: run the boot-time allocator self-test
    /// (`PageAllocator::self_test`) that exhausts and rebuilds memory.
    /// Only takes effect when this crate is built with the `testpage`
    /// feature; `PageAllocator::new` checks this flag at that point.
    pub testpage: bool,
    /// `*nopageshare`: never shallow-copy DATA segments on fork; always
    /// deep-copy, trading fork cost for simpler ownership.
    pub nopageshare: bool,
}

impl Default for Config {
    /// Mirrors the original's defaults: every flag off, i.e. caching,
    /// deferred reclaim, page joining, NUMA coloring and page sharing are
    /// all enabled, and the self-test does not run unless asked for.
    fn default() -> Self {
        Config {
            nocache: false,
            nolater: false,
            joinpages: true,
            nocolors: false,
            testpage: false,
            nopageshare: false,
        }
    }
}
