//! Page - a block of bytes living in the shared-memory arena.
//!
//! A [`Page`] couples an arena block with everything the cache needs to
//! manage it:
//! - Identity ([`CacheKey`] + node)
//! - Reference count and pinned flag
//! - Dirty / in-flush / in-eviction state for the flush pipeline
//! - Access sequence number for LRU/MRU ordering
//! - On-disk coordinate once the page has been flushed

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::buffer::LocalitySet;
use crate::common::{CacheKey, Error, NodeId, PageId, PageIndex, Result};
use crate::memory::{SharedMemory, ShmBlock};

use super::page_guard::{PageReadGuard, PageWriteGuard};
use super::page_header::{PageHeader, RECORD_LEN_SIZE};

/// Shared handle to a cached page.
pub type PageHandle = Arc<Page>;

/// A cached page.
///
/// The buffer is `None` once the cache has freed it back to the arena;
/// any access after that fails with `Error::PageReleased` instead of
/// touching recycled memory.
///
/// # Thread Safety
/// - `buffer`: `RwLock`, readers share the bytes, a writer (or the cache
///   freeing the block) is exclusive
/// - `ref_count`, flags, `access_seq`: atomics
/// - `location`, `owner`: `Mutex`
///
/// # Lifetime
/// A page with `ref_count > 0` is never freed. The cache decrements the
/// count only through `PageCache::dec_page_ref_count`.
pub struct Page {
    key: CacheKey,
    node_id: NodeId,
    shm: Arc<SharedMemory>,
    buffer: RwLock<Option<ShmBlock>>,
    size: usize,

    ref_count: AtomicU32,
    pinned: AtomicBool,
    dirty: AtomicBool,
    in_flush: AtomicBool,
    in_eviction: AtomicBool,
    access_seq: AtomicU64,

    /// Where records go next; only touched under the buffer write lock.
    append_offset: AtomicUsize,
    num_objects: AtomicU32,

    location: Mutex<Option<PageIndex>>,
    owner: Mutex<Option<Weak<LocalitySet>>>,
}

impl Page {
    pub(crate) fn new(key: CacheKey, node_id: NodeId, shm: Arc<SharedMemory>, block: ShmBlock) -> Self {
        Self {
            key,
            node_id,
            shm,
            size: block.len,
            buffer: RwLock::new(Some(block)),
            ref_count: AtomicU32::new(0),
            pinned: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            in_flush: AtomicBool::new(false),
            in_eviction: AtomicBool::new(false),
            access_seq: AtomicU64::new(0),
            append_offset: AtomicUsize::new(PageHeader::SIZE),
            num_objects: AtomicU32::new(0),
            location: Mutex::new(None),
            owner: Mutex::new(None),
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    #[inline]
    pub fn key(&self) -> CacheKey {
        self.key
    }

    #[inline]
    pub fn page_id(&self) -> PageId {
        self.key.page_id
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Size of the page's buffer in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of the buffer inside the arena, or `None` once released.
    pub fn shm_offset(&self) -> Option<usize> {
        self.buffer.read().as_ref().map(|b| self.shm.compute_offset(b))
    }

    /// Padding between the raw allocation and the aligned buffer.
    pub fn align_offset(&self) -> Option<usize> {
        self.buffer.read().as_ref().map(|b| b.align_offset)
    }

    // ========================================================================
    // Byte access (RwLock)
    // ========================================================================

    /// Shared access to the page's bytes.
    ///
    /// # Errors
    /// `Error::PageReleased` if the cache already freed the buffer.
    pub fn read(&self) -> Result<PageReadGuard<'_>> {
        let lock = self.buffer.read();
        let block = (*lock).ok_or(Error::PageReleased(self.key))?;
        Ok(PageReadGuard::new(&self.shm, block, lock))
    }

    /// Exclusive access to the page's bytes. Marks the page dirty on drop.
    ///
    /// # Errors
    /// `Error::PageReleased` if the cache already freed the buffer.
    pub fn write(&self) -> Result<PageWriteGuard<'_>> {
        self.write_inner(true)
    }

    /// Exclusive access that leaves the dirty flag alone; used when filling
    /// a page from its file.
    pub(crate) fn write_clean(&self) -> Result<PageWriteGuard<'_>> {
        self.write_inner(false)
    }

    fn write_inner(&self, mark_dirty: bool) -> Result<PageWriteGuard<'_>> {
        let lock = self.buffer.write();
        let block = (*lock).ok_or(Error::PageReleased(self.key))?;
        let dirty = mark_dirty.then_some(&self.dirty);
        Ok(PageWriteGuard::new(&self.shm, block, lock, dirty))
    }

    /// Copy the page's bytes out.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(self.read()?.to_vec())
    }

    /// Free the buffer back to the arena. Returns false if already released.
    pub(crate) fn release(&self) -> bool {
        let mut lock = self.buffer.write();
        match lock.take() {
            Some(block) => {
                self.shm.free(block);
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.buffer.read().is_none()
    }

    // ========================================================================
    // Records
    // ========================================================================

    /// Write a fresh header and reset the record cursor.
    pub fn prepare(&self) -> Result<()> {
        let mut guard = self.write_clean()?;
        PageHeader::new(self.node_id, self.key).write_to(&mut guard);
        self.append_offset.store(PageHeader::SIZE, Ordering::Relaxed);
        self.num_objects.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Reserve room for a `size`-byte record.
    ///
    /// Writes the `[u64 length]` prefix and bumps the record count; returns
    /// the offset of the record body, or `None` if the page is full or
    /// released.
    pub fn add_variable_bytes(&self, size: usize) -> Option<usize> {
        let mut guard = self.write().ok()?;
        let offset = self.append_offset.load(Ordering::Relaxed);
        let end = offset.checked_add(RECORD_LEN_SIZE)?.checked_add(size)?;
        if end > guard.len() {
            return None;
        }
        guard[offset..offset + RECORD_LEN_SIZE].copy_from_slice(&(size as u64).to_le_bytes());
        let num_objects = self.num_objects.fetch_add(1, Ordering::Relaxed) + 1;
        PageHeader::write_num_objects(&mut guard, num_objects);
        self.append_offset.store(end, Ordering::Relaxed);
        Some(offset + RECORD_LEN_SIZE)
    }

    /// Number of records appended through [`Page::add_variable_bytes`].
    #[inline]
    pub fn num_objects(&self) -> u32 {
        self.num_objects.load(Ordering::Relaxed)
    }

    /// Bytes still available for records, including their length prefix.
    pub fn remaining(&self) -> usize {
        self.size
            .saturating_sub(self.append_offset.load(Ordering::Relaxed))
    }

    /// Parse the header from the page's bytes.
    pub fn header(&self) -> Result<PageHeader> {
        Ok(PageHeader::from_bytes(&self.read()?))
    }

    // ========================================================================
    // Reference counting (Atomic)
    // ========================================================================

    /// Increment the reference count. Returns the new count.
    #[inline]
    pub fn inc_ref_count(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the reference count. Returns the new count, or `None` if
    /// it was already 0.
    #[inline]
    pub(crate) fn dec_ref_count(&self) -> Option<u32> {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .ok()
            .map(|old| old - 1)
    }

    /// Force the count to zero. Shutdown only.
    pub(crate) fn reset_ref_count(&self) {
        self.ref_count.store(0, Ordering::Release);
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    // ========================================================================
    // Flags (Atomic)
    // ========================================================================

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::Release);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    #[inline]
    pub fn is_in_flush(&self) -> bool {
        self.in_flush.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_in_flush(&self, in_flush: bool) {
        self.in_flush.store(in_flush, Ordering::Release);
    }

    #[inline]
    pub fn is_in_eviction(&self) -> bool {
        self.in_eviction.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_in_eviction(&self, in_eviction: bool) {
        self.in_eviction.store(in_eviction, Ordering::Release);
    }

    /// Position in the cache's total access order.
    #[inline]
    pub fn access_seq(&self) -> u64 {
        self.access_seq.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_access_seq(&self, seq: u64) {
        self.access_seq.store(seq, Ordering::Release);
    }

    /// Whether the evictor may pick this page right now.
    #[inline]
    pub fn is_evictable(&self) -> bool {
        self.ref_count() == 0 && !(self.is_dirty() && self.is_in_flush())
    }

    // ========================================================================
    // Placement
    // ========================================================================

    /// On-disk coordinate, known once the page was loaded or flushed.
    pub fn location(&self) -> Option<PageIndex> {
        *self.location.lock()
    }

    pub(crate) fn set_location(&self, location: Option<PageIndex>) {
        *self.location.lock() = location;
    }

    /// Locality set the page is accounted to, if it is still alive.
    pub fn owner(&self) -> Option<Arc<LocalitySet>> {
        self.owner.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_owner(&self, owner: Option<&Arc<LocalitySet>>) {
        *self.owner.lock() = owner.map(Arc::downgrade);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("ref_count", &self.ref_count())
            .field("dirty", &self.is_dirty())
            .field("in_flush", &self.is_in_flush())
            .field("access_seq", &self.access_seq())
            .finish()
    }
}
