//! The file-content cache: opens a file through a DATA
//! segment, shares that segment across concurrent opens of the same
//! `(dev, qid.path)` keyed by `FileCacheKey`, and demand-loads its
//! content page by page. Grounded on `cache.c` (`cinit`, `copen`,
//! `cread`, `cwrite`, `mcread`) and reuses `cache::KeyedLru`'s
//! second-chance eviction — the same mechanism `segment::text_cache`
//! uses, independently instanced here: the two caches are kept
//! independent rather than sharing a single `KeyedLru`.

pub mod readahead;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use custom_error::custom_error;
use log::trace;
use spin::Mutex;

use crate::cache::KeyedLru;
use crate::config::Config;
use crate::error::KError;
use crate::external::{Channel, PhysMemOps, RpcTransport};
use crate::memory::page::PageHandle;
use crate::memory::pgalloc::PageAllocator;
use crate::mmu::ShootdownFlags;
use crate::segment::{SegmentFlags, SegmentHandle, SegmentStore, SegmentType};

/// `NFILES`: default ceiling on the number of cached file segments.
pub const DEFAULT_MAX_FILES: usize = 512;
/// `NBYTES`: default ceiling on cached bytes across all file segments.
pub const DEFAULT_MAX_BYTES: usize = 64 * 1024 * 1024;

custom_error! {
    /// Errors specific to the file-content cache, folded into `KError`
    /// via `KError::FileSystem`.
    #[derive(Clone, PartialEq)]
    pub FileSystemError
    ShortRead{expected: usize, got: usize} = "short read: expected {expected} bytes, got {got}",
}

/// `(dev, qid.path)`: identifies a cacheable file's content segment.
/// Matches `segment::text_cache::TextCacheKey`'s shape — both caches key
/// on the same device/file identity, just over disjoint segment kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FileCacheKey {
    pub dev: u32,
    pub qid_path: u64,
}

struct CachedFile {
    seg: SegmentHandle,
    qid_vers: u32,
}

/// The file cache.
pub struct FileCache {
    config: Config,
    cache: Mutex<KeyedLru<FileCacheKey, CachedFile>>,
    max_files: usize,
    max_bytes: usize,
    bytes: AtomicUsize,
}

impl FileCache {
    pub fn new(config: Config) -> Self {
        Self::with_limits(config, DEFAULT_MAX_FILES, DEFAULT_MAX_BYTES)
    }

    pub fn with_limits(config: Config, max_files: usize, max_bytes: usize) -> Self {
        FileCache { config, cache: Mutex::new(KeyedLru::new()), max_files, max_bytes, bytes: AtomicUsize::new(0) }
    }

    fn key_for(channel: &dyn Channel) -> FileCacheKey {
        FileCacheKey { dev: channel.dev_id(), qid_path: channel.qid_path() }
    }

    /// `copen`: attaches (or shares) the DATA segment backing `channel`'s
    /// content. `*nocache` or a non-cacheable channel bypasses the shared
    /// cache entirely — every open gets its own private segment.
    pub fn copen(
        &self,
        store: &SegmentStore,
        channel: Arc<dyn Channel>,
        page_size_log2: u8,
        length: u64,
    ) -> Result<SegmentHandle, KError> {
        let top = round_up(length, page_size_log2);

        if self.config.nocache || !channel.is_cacheable() {
            return store.newseg(SegmentType::Data, SegmentFlags::default(), 0, top, page_size_log2, Some(channel), length, -1);
        }

        let key = Self::key_for(channel.as_ref());
        {
            let mut cache = self.cache.lock();
            if let Some(hit) = self.lookup_fresh(&mut cache, &key, channel.qid_vers()) {
                hit.incref();
                return Ok(hit);
            }
        }

        let seg = store.newseg(SegmentType::Data, SegmentFlags::default(), 0, top, page_size_log2, Some(channel.clone()), length, -1)?;
        let mut cache = self.cache.lock();
        if let Some(hit) = self.lookup_fresh(&mut cache, &key, channel.qid_vers()) {
            hit.incref();
            // `seg` never had any pages attached; dropping it is enough.
            return Ok(hit);
        }
        cache.insert(key, CachedFile { seg: seg.clone(), qid_vers: channel.qid_vers() });
        self.bytes.fetch_add((top - 0) as usize, Ordering::Relaxed);
        Ok(seg)
    }

    /// Looks up `key`, evicting and discarding a stale entry (its `qid`
    /// version no longer matches the channel's) instead of returning it.
    fn lookup_fresh(
        &self,
        cache: &mut KeyedLru<FileCacheKey, CachedFile>,
        key: &FileCacheKey,
        qid_vers: u32,
    ) -> Option<SegmentHandle> {
        let stale = matches!(cache.get(key), Some(entry) if entry.qid_vers != qid_vers);
        if stale {
            cache.remove(key);
            return None;
        }
        cache.touch(key).map(|entry| entry.seg.clone())
    }

    /// Reclaims cached files (second-chance, `ref == 1` only) until the
    /// cache is back under both the file-count and byte-count ceilings.
    pub fn reclaim(&self, allocator: &PageAllocator, store: &SegmentStore) {
        let mut cache = self.cache.lock();
        while cache.len() > self.max_files || self.bytes.load(Ordering::Relaxed) > self.max_bytes {
            match cache.evict_second_chance(|entry| entry.seg.ref_count() == 1) {
                Some((key, entry)) => {
                    let freed = 1usize << entry.seg.page_size_log2();
                    let npages = (entry.seg.top() - entry.seg.base()) / freed;
                    self.bytes.fetch_sub(freed.saturating_mul(npages), Ordering::Relaxed);
                    trace!("file cache: reclaimed dev={} qid_path={:#x}, {} files remain", key.dev, key.qid_path, cache.len());
                    store.putseg(allocator, entry.seg);
                }
                None => break,
            }
        }
    }

    /// `cread`: demand-loads every page covering `[offset, offset+len)`
    /// into `seg`'s map, reading through its channel — synchronously
    /// page-by-page, or via a pipelined `mcread` window when `transport`
    /// is given and more than one page is missing. Past the file's known
    /// length (`clength`/`Segment::file_len`), pages are zero-filled
    /// instead of read.
    pub fn cread(
        &self,
        allocator: &PageAllocator,
        phys_mem: &dyn PhysMemOps,
        transport: Option<&dyn RpcTransport>,
        seg: &SegmentHandle,
        offset: u64,
        len: usize,
    ) -> Result<Vec<PageHandle>, KError> {
        let pgsz = 1usize << seg.page_size_log2();
        let file_len = seg.file_len();
        let channel = seg.channel();

        let start = (offset as usize) & !(pgsz - 1);
        let end = (offset as usize + len + pgsz - 1) & !(pgsz - 1);

        // One pass to claim every slot in range: either the page already
        // there (waited on below) or a fresh zeroed page this call now
        // owns the loading of. All installs happen before anything in
        // `slots` is borrowed, so nothing here races a `Vec` growth.
        let mut slots: Vec<(usize, PageHandle, bool)> = Vec::new();
        let mut po = start;
        while po < end {
            let (page, is_new) = placeholder(allocator, seg, po);
            slots.push((po, page, is_new));
            po += pgsz;
        }

        for (_, page, is_new) in &slots {
            if !is_new {
                let _wait = page.turnstile().lock();
            }
        }

        let missing: Vec<(usize, PageHandle)> =
            slots.iter().filter(|(_, _, is_new)| *is_new).map(|(po, page, _)| (*po, page.clone())).collect();
        if missing.is_empty() {
            return Ok(slots.into_iter().map(|(_, page, _)| page).collect());
        }

        for (_, page) in &missing {
            page.mark_loading();
        }
        let guards: Vec<_> = missing.iter().map(|(_, page)| page.turnstile().lock()).collect();

        match (channel.as_ref(), transport) {
            (Some(ch), Some(transport)) if missing.len() > 1 => {
                let targets: Vec<(u64, usize)> = missing
                    .iter()
                    .map(|(po, _)| (*po as u64, pgsz.min(file_len.saturating_sub(*po as u64) as usize)))
                    .collect();
                let results = mcread_window(transport, ch.as_ref(), &targets)?;
                for ((_, page), (n, buf)) in missing.iter().zip(results.into_iter()) {
                    if n > 0 {
                        phys_mem.write(page, 0, &buf[..n]);
                    }
                }
            }
            (Some(ch), _) => {
                for (po, page) in &missing {
                    let want = pgsz.min(file_len.saturating_sub(*po as u64) as usize);
                    if want > 0 {
                        let mut buf = vec![0u8; want];
                        let n = readn(ch.as_ref(), &mut buf, *po as u64)?;
                        phys_mem.write(page, 0, &buf[..n]);
                    }
                }
            }
            (None, _) => {}
        }
        for (_, page) in &missing {
            page.mark_resident();
        }
        drop(guards);

        Ok(slots.into_iter().map(|(_, page, _)| page).collect())
    }

    /// `cwrite`: forwards the write straight through the channel, then
    /// invalidates the whole segment (matching the original's write-path
    /// whole-segment invalidation) so the next read re-demand-loads
    /// affected pages rather than serving stale cached content.
    pub fn cwrite(
        &self,
        allocator: &PageAllocator,
        store: &SegmentStore,
        shootdown: &ShootdownFlags,
        cpus: &[usize],
        seg: &SegmentHandle,
        offset: u64,
        buf: &[u8],
    ) -> Result<usize, KError> {
        let channel = seg.channel().ok_or(KError::BadArgument)?;
        let n = channel.write(buf, offset)?;
        if n > 0 {
            trace!("cwrite: {}-byte write at offset={:#x} invalidates cached segment", n, offset);
            store.clearseg(allocator, seg, shootdown, cpus);
            let new_end = offset + n as u64;
            if new_end > seg.file_len() {
                seg.set_file_len(new_end);
            }
        }
        Ok(n)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Installs a placeholder slot for `offset` if none exists yet. The
/// check and the install happen inside a single `with_map` call, so a
/// racing second caller never allocates a page only to have it silently
/// overwritten — it sees the slot already claimed and discards its own
/// page instead. Returns the page now sitting in the slot and whether
/// this call was the one that just installed it.
fn placeholder(allocator: &PageAllocator, seg: &SegmentHandle, offset: usize) -> (PageHandle, bool) {
    let page = allocator.alloc(seg.page_size_log2(), -1);
    let installed = seg.with_map(|m| {
        let slot = m.walk(offset, true).expect("walk always succeeds with alloc=true");
        match slot.clone() {
            Some(existing) => Err(existing),
            None => {
                *slot = Some(page.clone());
                Ok(())
            }
        }
    });
    match installed {
        Ok(()) => (page, true),
        Err(existing) => {
            if page.decref() == 0 {
                allocator.free(page);
            }
            (existing, false)
        }
    }
}

fn readn(channel: &dyn Channel, buf: &mut [u8], offset: u64) -> Result<usize, KError> {
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

/// `mcread`: fires every target read in the window concurrently through
/// `transport`, then collects them in order, aborting whatever is still
/// outstanding as soon as one fails (`mcread`'s `waserror` cleanup path).
fn mcread_window(
    transport: &dyn RpcTransport,
    channel: &dyn Channel,
    targets: &[(u64, usize)],
) -> Result<Vec<(usize, Vec<u8>)>, KError> {
    let mut bufs: Vec<Vec<u8>> = targets.iter().map(|&(_, want)| vec![0u8; want]).collect();
    let mut pending: Vec<Box<dyn crate::external::PendingRead>> = Vec::with_capacity(targets.len());
    for (i, &(offset, _)) in targets.iter().enumerate() {
        pending.push(transport.read_async(channel, &mut bufs[i], offset));
    }

    let mut results = Vec::with_capacity(targets.len());
    let mut failed: Option<KError> = None;
    for (i, p) in pending.into_iter().enumerate() {
        if failed.is_some() {
            p.abort();
            continue;
        }
        match p.collect() {
            Ok(n) => results.push((n, core::mem::take(&mut bufs[i]))),
            Err(e) => failed = Some(e),
        }
    }
    match failed {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

fn round_up(len: u64, page_size_log2: u8) -> usize {
    let pgsz = 1usize << page_size_log2;
    let len = len as usize;
    if len == 0 {
        pgsz
    } else {
        (len + pgsz - 1) & !(pgsz - 1)
    }
}
