//! Page Cache - the shared buffer pool every set reads and writes through.
//!
//! The [`PageCache`] provides:
//! - Page caching between set files and the shared-memory arena
//! - Reference counting (a referenced page is never evicted)
//! - Dirty page write-back through the flush pipeline
//! - Pluggable eviction strategies

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::flush::{FlushQueue, FlushTarget};
use crate::buffer::locality_set::{LocalitySet, OperationType, ReplacementPolicy};
use crate::buffer::replacer::{self, EvictionStrategy, PriorityBuckets, PriorityLevel};
use crate::buffer::CacheStats;
use crate::common::config::{CacheSizing, StorageConfig, SHM_ALIGNMENT};
use crate::common::{CacheKey, Error, NodeId, PageId, PageIndex, Result, SetKey};
use crate::memory::{SharedMemory, ShmBlock};
use crate::storage::page::{Page, PageHandle, PageHeader};
use crate::storage::PdbFile;

/// Caches pages of every set in one shared-memory arena.
///
/// # Architecture
/// ```text
/// ┌─────────────────────────────────────────────────────────────┐
/// │                         PageCache                           │
/// │  ┌──────────────────┐   ┌─────────────────────────────┐    │
/// │  │ pages            │   │ shm: SharedMemory           │    │
/// │  │ CacheKey → Page  │──▶│ [page][page][free][page]... │    │
/// │  └──────────────────┘   └─────────────────────────────┘    │
/// │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
/// │  │ strategy     │  │ buckets      │  │ flush_queue  │      │
/// │  │ MRU/LRU/Prio │  │ 6 priorities │  │ dirty pages  │      │
/// │  └──────────────┘  └──────────────┘  └──────────────┘      │
/// └─────────────────────────────────────────────────────────────┘
/// ```
///
/// # Thread Safety
/// - `pages`: `Mutex`, held for map lookups and updates, never across I/O
/// - `eviction_and_flush`: `RwLock`, eviction scans take it exclusively,
///   flushes share it, so no page is freed while a flush is writing it
/// - `eviction_mutex`: `Mutex`, one eviction pass at a time
/// - `access_count`: `Mutex`, the total order of page touches
/// - `stats`: no lock, atomic counters
///
/// Lock order is `eviction_mutex` → `eviction_and_flush` → `pages` → a
/// locality set's own lock.
///
/// # Loading
/// Only one thread is expected to miss on a given key at a time; the scan
/// model of the callers guarantees it, the cache does not lock per key.
pub struct PageCache {
    node_id: NodeId,
    page_size: usize,
    max_size: usize,
    warn_size: AtomicUsize,
    evict_stop_size: AtomicUsize,

    shm: Arc<SharedMemory>,
    pages: Mutex<HashMap<CacheKey, PageHandle>>,

    eviction_and_flush: RwLock<()>,
    eviction_mutex: Mutex<()>,
    in_eviction: AtomicBool,
    access_count: Mutex<u64>,

    strategy: Box<dyn EvictionStrategy>,
    buckets: PriorityBuckets,

    flush_queue: FlushQueue,
    targets: RwLock<HashMap<SetKey, Weak<dyn FlushTarget>>>,

    stats: CacheStats,
}

impl PageCache {
    /// Build a cache over `shm` with the sizes and strategy in `config`.
    ///
    /// # Errors
    /// `Error::InvalidConfig` if `config` does not validate.
    pub fn new(config: &StorageConfig, shm: Arc<SharedMemory>) -> Result<Self> {
        config.validate()?;
        let CacheSizing {
            max_pages,
            warn_size,
            evict_stop_size,
        } = CacheSizing::new(
            shm.capacity(),
            config.page_size,
            config.warn_threshold,
            config.evict_stop_threshold,
        );
        let strategy = replacer::for_strategy(config.strategy);
        info!(
            "page cache: {} pages of {} bytes, warn at {}, evict down to {}, strategy {}",
            max_pages,
            config.page_size,
            warn_size,
            evict_stop_size,
            strategy.name()
        );

        Ok(Self {
            node_id: config.node_id,
            page_size: config.page_size,
            max_size: max_pages,
            warn_size: AtomicUsize::new(warn_size),
            evict_stop_size: AtomicUsize::new(evict_stop_size),
            shm,
            pages: Mutex::new(HashMap::new()),
            eviction_and_flush: RwLock::new(()),
            eviction_mutex: Mutex::new(()),
            in_eviction: AtomicBool::new(false),
            access_count: Mutex::new(0),
            strategy,
            buckets: PriorityBuckets::new(),
            flush_queue: FlushQueue::new(),
            targets: RwLock::new(HashMap::new()),
            stats: CacheStats::new(),
        })
    }

    // ========================================================================
    // Public API: Get pages
    // ========================================================================

    /// Get a page of `file`, loading it on a miss. The page comes back
    /// referenced; release it with [`PageCache::dec_page_ref_count`].
    ///
    /// `location` may be `None`, in which case it is looked up in the
    /// file's metadata. Returns `None` if the page is neither cached nor on
    /// disk, or if loading it failed.
    pub fn get_page(
        &self,
        file: &PdbFile,
        location: Option<PageIndex>,
        page_id: PageId,
        sequential: bool,
        set: Option<&Arc<LocalitySet>>,
    ) -> Option<PageHandle> {
        let key = file.set_key().page(page_id);

        let cached = {
            let _evicting = self.eviction_mutex.lock();
            let _guard = self.eviction_and_flush.write();
            let cached = self.reference_cached(key);
            if let Some(page) = &cached {
                page.set_pinned(true);
            }
            cached
        };

        if let Some(page) = cached {
            self.touch(&page);
            if let Some(set) = set {
                set.update_cached_page(Arc::clone(&page));
            }
            self.stats.record_hit();
            return Some(page);
        }

        self.stats.record_miss();
        let location = match location.or_else(|| file.page_index(page_id)) {
            Some(location) => location,
            None => {
                debug!("page {} is neither cached nor flushed", key);
                return None;
            }
        };
        let page = match self.load_page(file, location, page_id, sequential) {
            Ok(Some(page)) => page,
            Ok(None) => return None,
            Err(e) => {
                error!("failed to load page {} at {}: {}", key, location, e);
                return None;
            }
        };
        self.touch(&page);

        let _evicting = self.eviction_mutex.lock();
        if !self.cache_page(&page, set) {
            // lost a race against another loader; use its copy
            page.release();
            return self.reference_cached(key);
        }
        page.set_pinned(true);
        page.set_dirty(false);
        page.inc_ref_count();
        Some(page)
    }

    /// Cache-only lookup. The page comes back referenced.
    pub fn get_cached_page(&self, key: CacheKey, set: Option<&Arc<LocalitySet>>) -> Option<PageHandle> {
        let Some(page) = self.reference_cached(key) else {
            warn!("page {} is not in the cache", key);
            return None;
        };
        self.touch(&page);
        if let Some(set) = set {
            set.update_cached_page(Arc::clone(&page));
        }
        self.stats.record_hit();
        Some(page)
    }

    /// Whether `key` is cached.
    pub fn contains_page(&self, key: CacheKey) -> bool {
        self.pages.lock().contains_key(&key)
    }

    // ========================================================================
    // Public API: Create pages
    // ========================================================================

    /// Create a page for `key`, blocking until the arena has room.
    ///
    /// The page comes back referenced, pinned, dirty and with a fresh
    /// header.
    ///
    /// # Errors
    /// `Error::DuplicatePage` if `key` is already cached.
    pub fn get_new_page(
        &self,
        node_id: NodeId,
        key: CacheKey,
        set: Option<&Arc<LocalitySet>>,
    ) -> Result<PageHandle> {
        {
            let _evicting = self.eviction_mutex.lock();
            if self.contains_page(key) {
                return Err(Error::DuplicatePage(key));
            }
        }
        let block = self.allocate_buffer_blocking(self.page_size);
        self.install_new_page(node_id, key, block, set)
    }

    /// Like [`PageCache::get_new_page`], but gives up after one eviction
    /// attempt if the arena is full.
    pub fn get_new_page_non_blocking(
        &self,
        node_id: NodeId,
        key: CacheKey,
        set: Option<&Arc<LocalitySet>>,
    ) -> Option<PageHandle> {
        if self.contains_page(key) {
            return None;
        }
        let block = self.try_allocate_buffer(self.page_size)?;
        self.install_new_page(node_id, key, block, set).ok()
    }

    fn install_new_page(
        &self,
        node_id: NodeId,
        key: CacheKey,
        block: ShmBlock,
        set: Option<&Arc<LocalitySet>>,
    ) -> Result<PageHandle> {
        let page = Arc::new(Page::new(key, node_id, Arc::clone(&self.shm), block));
        if let Err(e) = page.prepare() {
            page.release();
            return Err(e);
        }
        self.touch(&page);
        page.set_pinned(true);
        page.set_dirty(true);

        let _evicting = self.eviction_mutex.lock();
        if !self.cache_page(&page, set) {
            page.release();
            return Err(Error::DuplicatePage(key));
        }
        page.inc_ref_count();
        debug!("created page {}", key);
        Ok(page)
    }

    /// Read `len` bytes from `reader` into a new page and cache it clean.
    ///
    /// If `key` is already cached the bytes are still consumed and the
    /// cached page is returned instead. The page comes back referenced.
    pub fn build_and_cache_page_from_reader<R: Read>(
        &self,
        reader: &mut R,
        len: usize,
        node_id: NodeId,
        key: CacheKey,
        set: Option<&Arc<LocalitySet>>,
    ) -> Result<PageHandle> {
        if len > self.page_size {
            return Err(Error::RecordTooLarge {
                requested: len,
                capacity: self.page_size,
            });
        }
        let block = self.allocate_buffer_blocking(self.page_size);
        let page = Arc::new(Page::new(key, node_id, Arc::clone(&self.shm), block));
        let filled = page
            .write_clean()
            .and_then(|mut guard| Ok(reader.read_exact(&mut guard[..len])?));
        if let Err(e) = filled {
            page.release();
            return Err(e);
        }
        self.touch(&page);
        self.stats.record_load();

        let _evicting = self.eviction_mutex.lock();
        if !self.cache_page(&page, set) {
            page.release();
            return self.reference_cached(key).ok_or(Error::PageNotCached(key));
        }
        page.set_pinned(true);
        page.set_dirty(false);
        page.inc_ref_count();
        Ok(page)
    }

    // ========================================================================
    // Public API: Reference counting
    // ========================================================================

    /// Drop one reference to a cached page. Returns false if the key is not
    /// cached or the page is not referenced.
    pub fn dec_page_ref_count(&self, key: CacheKey) -> bool {
        let page = self.pages.lock().get(&key).cloned();
        match page.map(|page| page.dec_ref_count()) {
            Some(Some(_)) => true,
            Some(None) => {
                warn!("page {} is not referenced", key);
                false
            }
            None => false,
        }
    }

    // ========================================================================
    // Public API: Eviction
    // ========================================================================

    /// Evict one page.
    ///
    /// A dirty page is handed to the flush pipeline and freed once written,
    /// unless it belongs to a temporary set or `try_flush` is false, in which
    /// case its contents are dropped. Returns false if the page is not cached
    /// or still referenced.
    pub fn evict_page(&self, key: CacheKey, try_flush: bool) -> bool {
        let page = self.pages.lock().get(&key).cloned();
        let Some(page) = page else {
            debug!("can not evict page {}: not cached", key);
            return false;
        };
        if page.ref_count() > 0 {
            info!(
                "can not evict page {}: referenced by {} clients",
                key,
                page.ref_count()
            );
            return false;
        }

        page.set_pinned(false);
        if page.is_in_flush() {
            return true;
        }
        if page.is_dirty() && try_flush && !key.set_key().is_temporary() {
            page.set_in_flush(true);
            page.set_in_eviction(true);
            self.flush_queue.push(page);
            trace!("queued page {} for flush", key);
        } else {
            let _flush = self.flush_lock();
            if !self.free_page_if_unreferenced(&page) {
                return false;
            }
            trace!("freed page {}", key);
        }
        true
    }

    /// Run one eviction pass with the configured strategy.
    ///
    /// Returns immediately if another pass is running. Returns the number
    /// of pages evicted or queued for flushing.
    pub fn evict(&self) -> usize {
        if self.in_eviction.load(Ordering::Acquire) {
            return 0;
        }
        let _evicting = self.eviction_mutex.lock();
        self.in_eviction.store(true, Ordering::Release);
        let evicted = self.strategy.evict(self);
        self.in_eviction.store(false, Ordering::Release);
        debug!("eviction pass done: {} pages, {} cached", evicted, self.size());
        evicted
    }

    /// Hand every unreferenced dirty page to the flush pipeline.
    pub fn evict_all_dirty_pages(&self) -> usize {
        self.evict_dirty_pages(false)
    }

    /// Like [`PageCache::evict_all_dirty_pages`], but first drops every
    /// reference to the dirty pages. Only safe at shutdown.
    pub fn unpin_and_evict_all_dirty_pages(&self) -> usize {
        self.evict_dirty_pages(true)
    }

    fn evict_dirty_pages(&self, unpin: bool) -> usize {
        if self.in_eviction.load(Ordering::Acquire) {
            return 0;
        }
        info!("evicting all dirty pages");
        let _evicting = self.eviction_mutex.lock();
        self.in_eviction.store(true, Ordering::Release);

        let dirty: Vec<PageHandle> = {
            let _guard = self.eviction_lock();
            self.pages
                .lock()
                .values()
                .filter(|p| p.is_dirty() && !p.is_in_flush())
                .filter(|p| {
                    if unpin {
                        p.reset_ref_count();
                    }
                    p.ref_count() == 0
                })
                .cloned()
                .collect()
        };

        let evicted = dirty
            .iter()
            .filter(|p| self.evict_page(p.key(), true))
            .count();
        self.in_eviction.store(false, Ordering::Release);
        evicted
    }

    /// Queue a dirty page for writing without evicting it.
    ///
    /// Returns false if the page is not cached, clean, or already queued.
    pub fn flush_page_without_eviction(&self, key: CacheKey) -> bool {
        let page = self.pages.lock().get(&key).cloned();
        match page {
            Some(page) if page.is_dirty() && !page.is_in_flush() => {
                page.set_in_flush(true);
                page.set_in_eviction(false);
                self.flush_queue.push(page);
                true
            }
            _ => false,
        }
    }

    /// Uncache a page and free its buffer. Returns false if `page` was not
    /// the cached page for its key.
    pub fn free_page(&self, page: &PageHandle) -> bool {
        let removed = Self::uncache(&mut self.pages.lock(), page);
        self.release_page(page, removed);
        removed
    }

    /// Free `page` only if nobody references it.
    ///
    /// The count is checked under the page-table lock, the same lock
    /// [`PageCache::get_cached_page`] takes a reference under, so a page
    /// handed out concurrently is never freed. Returns false if the page is
    /// still referenced.
    pub(crate) fn free_page_if_unreferenced(&self, page: &PageHandle) -> bool {
        let removed = {
            let mut pages = self.pages.lock();
            if page.ref_count() > 0 {
                return false;
            }
            Self::uncache(&mut pages, page)
        };
        self.release_page(page, removed);
        true
    }

    fn uncache(pages: &mut HashMap<CacheKey, PageHandle>, page: &PageHandle) -> bool {
        let key = page.key();
        match pages.get(&key) {
            Some(cached) if Arc::ptr_eq(cached, page) => pages.remove(&key).is_some(),
            _ => false,
        }
    }

    fn release_page(&self, page: &PageHandle, removed: bool) {
        let key = page.key();
        page.release();
        if let Some(owner) = page.owner() {
            owner.remove_cached_page(key);
        }
        if removed {
            self.stats.record_eviction();
        }
    }

    /// Look `key` up and take a reference while the page table is locked.
    fn reference_cached(&self, key: CacheKey) -> Option<PageHandle> {
        let pages = self.pages.lock();
        let page = pages.get(&key)?;
        page.inc_ref_count();
        Some(Arc::clone(page))
    }

    // ========================================================================
    // Public API: Shared memory
    // ========================================================================

    /// Allocate a page buffer, evicting until the arena has room.
    ///
    /// Never gives up: if nothing can ever be evicted this spins forever.
    pub fn allocate_buffer_blocking(&self, size: usize) -> ShmBlock {
        let mut attempts: u64 = 0;
        loop {
            if let Some(block) = self.shm.malloc_align(size, SHM_ALIGNMENT) {
                return block;
            }
            if attempts == 0 {
                info!("out of shared memory, start eviction");
            }
            attempts += 1;
            if self.in_eviction.load(Ordering::Acquire) {
                thread::yield_now();
            } else {
                self.evict();
            }
        }
    }

    /// Allocate a page buffer, evicting at most once.
    pub fn try_allocate_buffer(&self, size: usize) -> Option<ShmBlock> {
        if let Some(block) = self.shm.malloc_align(size, SHM_ALIGNMENT) {
            return Some(block);
        }
        info!("out of shared memory, start eviction");
        self.evict();
        self.shm.malloc_align(size, SHM_ALIGNMENT)
    }

    // ========================================================================
    // Public API: Locality sets
    // ========================================================================

    /// Start using `set` with `policy`, moving it to its active bucket.
    pub fn pin(&self, set: &Arc<LocalitySet>, policy: ReplacementPolicy, operation: OperationType) {
        set.pin(policy, operation);
        self.buckets.place(set, PriorityLevel::active(set));
    }

    /// Finish using `set`, moving it to its lifetime-ended bucket.
    pub fn unpin(&self, set: &Arc<LocalitySet>) {
        set.unpin();
        self.buckets.place(set, PriorityLevel::ended(set));
    }

    /// Forget `set` entirely.
    pub fn remove_locality_set(&self, set: &Arc<LocalitySet>) {
        self.buckets.remove(set);
    }

    pub fn priority_buckets(&self) -> &PriorityBuckets {
        &self.buckets
    }

    // ========================================================================
    // Public API: Flush targets
    // ========================================================================

    /// Route flushed pages of `set_key` to `target`.
    pub fn register_flush_target(&self, set_key: SetKey, target: Weak<dyn FlushTarget>) {
        self.targets.write().insert(set_key, target);
    }

    pub fn unregister_flush_target(&self, set_key: SetKey) {
        self.targets.write().remove(&set_key);
    }

    pub fn flush_target(&self, set_key: SetKey) -> Option<Arc<dyn FlushTarget>> {
        self.targets.read().get(&set_key).and_then(Weak::upgrade)
    }

    pub fn flush_queue(&self) -> &FlushQueue {
        &self.flush_queue
    }

    // ========================================================================
    // Public API: Sizes and stats
    // ========================================================================

    /// Number of cached pages.
    pub fn size(&self) -> usize {
        self.pages.lock().len()
    }

    /// Pages the arena can hold.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn warn_size(&self) -> usize {
        self.warn_size.load(Ordering::Relaxed)
    }

    pub fn evict_stop_size(&self) -> usize {
        self.evict_stop_size.load(Ordering::Relaxed)
    }

    /// Set the warn size to `threshold` of the maximum size.
    pub fn set_warn_threshold(&self, threshold: f64) {
        let size = (self.max_size as f64 * threshold) as usize;
        self.warn_size.store(size, Ordering::Relaxed);
        info!("warn size set to {}", size);
    }

    /// Set the eviction stop size to `threshold` of the maximum size.
    pub fn set_evict_stop_threshold(&self, threshold: f64) {
        let size = (self.max_size as f64 * threshold) as usize;
        self.evict_stop_size.store(size, Ordering::Relaxed);
        info!("evict stop size set to {}", size);
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn shared_memory(&self) -> &Arc<SharedMemory> {
        &self.shm
    }

    pub fn is_in_eviction(&self) -> bool {
        self.in_eviction.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    // ========================================================================
    // Internal: Locks used by strategies, consumers and iterators
    // ========================================================================

    /// Exclusive side of the eviction/flush lock.
    pub(crate) fn eviction_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.eviction_and_flush.write()
    }

    /// Shared side of the eviction/flush lock.
    pub(crate) fn flush_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.eviction_and_flush.read()
    }

    /// Every page an eviction pass may pick right now.
    pub(crate) fn evictable_pages(&self) -> Vec<PageHandle> {
        self.pages
            .lock()
            .values()
            .filter(|p| p.is_evictable())
            .cloned()
            .collect()
    }

    // ========================================================================
    // Internal: Loading and caching
    // ========================================================================

    /// Stamp `page` with the next access sequence number.
    fn touch(&self, page: &Page) {
        let mut count = self.access_count.lock();
        page.set_access_seq(*count);
        *count += 1;
    }

    /// Insert `page` and account it to `set`. Returns false if the key was
    /// already cached.
    fn cache_page(&self, page: &PageHandle, set: Option<&Arc<LocalitySet>>) -> bool {
        let key = page.key();
        let size = {
            let mut pages = self.pages.lock();
            if pages.contains_key(&key) {
                warn!("page {} is already cached", key);
                return false;
            }
            pages.insert(key, Arc::clone(page));
            pages.len()
        };
        if size == self.warn_size() {
            info!("page cache reached its warn size of {} pages", size);
        }
        if let Some(set) = set {
            set.add_cached_page(Arc::clone(page));
            page.set_owner(Some(set));
        }
        true
    }

    /// Read the page at `location` into a fresh buffer.
    ///
    /// `Ok(None)` if the location lies past the end of its partition.
    fn load_page(
        &self,
        file: &PdbFile,
        location: PageIndex,
        page_id: PageId,
        sequential: bool,
    ) -> Result<Option<PageHandle>> {
        let key = file.set_key().page(page_id);
        match file.partition_num_pages(location.partition_id) {
            Some(n) if location.seq_in_partition < n => {}
            _ => {
                debug!("page {} at {} has not been flushed", key, location);
                return Ok(None);
            }
        }

        let block = self.allocate_buffer_blocking(self.page_size);
        let page = Arc::new(Page::new(key, file.node_id(), Arc::clone(&self.shm), block));
        let loaded = page.write_clean().and_then(|mut guard| {
            let n = if sequential {
                file.load_page_sequential(location.partition_id, location.seq_in_partition, &mut guard)?
            } else {
                file.load_page(location.partition_id, location.seq_in_partition, &mut guard)?
            };
            Ok((n, PageHeader::read_page_id(&guard)))
        });
        let stored_id = match loaded {
            Ok((_, stored_id)) => stored_id,
            Err(e) => {
                page.release();
                return Err(e);
            }
        };
        if stored_id != page_id {
            debug!("page at {} carries id {}, expected {}", location, stored_id, page_id);
        }

        page.set_location(Some(location));
        self.stats.record_load();
        Ok(Some(page))
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("size", &self.size())
            .field("max_size", &self.max_size)
            .field("strategy", &self.strategy.name())
            .field("flush_queue", &self.flush_queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::locality_set::{DurabilityType, LocalityType, PersistenceType};
    use crate::common::config::CacheStrategy;

    const PAGE_SIZE: usize = 512;

    fn test_cache(num_pages: usize, strategy: CacheStrategy) -> PageCache {
        let config = StorageConfig {
            page_size: PAGE_SIZE,
            shm_size: num_pages * PAGE_SIZE,
            strategy,
            ..StorageConfig::default()
        };
        let shm = Arc::new(SharedMemory::new(config.shm_size).unwrap());
        PageCache::new(&config, shm).unwrap()
    }

    fn key(page: u32) -> CacheKey {
        CacheKey::new(1, 2, 3, PageId::new(page))
    }

    #[test]
    fn test_new_page_is_pinned_and_dirty() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        let page = cache.get_new_page(1, key(7), None).unwrap();

        assert_eq!(page.ref_count(), 1);
        assert!(page.is_pinned());
        assert!(page.is_dirty());
        assert_eq!(page.header().unwrap().page_id, PageId::new(7));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_duplicate_new_page() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        cache.get_new_page(1, key(7), None).unwrap();
        assert!(matches!(
            cache.get_new_page(1, key(7), None),
            Err(Error::DuplicatePage(k)) if k == key(7)
        ));
        assert!(cache.get_new_page_non_blocking(1, key(7), None).is_none());
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_dec_ref_count() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        let page = cache.get_new_page(1, key(0), None).unwrap();

        assert!(cache.dec_page_ref_count(key(0)));
        assert_eq!(page.ref_count(), 0);
        assert!(!cache.dec_page_ref_count(key(0)));
        assert!(!cache.dec_page_ref_count(key(1)));
    }

    #[test]
    fn test_concurrent_dec_ref_count() {
        let cache = Arc::new(test_cache(16, CacheStrategy::UnifiedMru));
        for round in 0..200 {
            let key = key(round);
            cache.get_new_page(1, key, None).unwrap();

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let cache = Arc::clone(&cache);
                    thread::spawn(move || cache.dec_page_ref_count(key))
                })
                .collect();
            let released = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|&ok| ok)
                .count();
            assert_eq!(released, 1);
            cache.evict_page(key, false);
        }
    }

    #[test]
    fn test_evict_referenced_page_fails() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        let page = cache.get_new_page(1, key(0), None).unwrap();
        page.set_dirty(false);

        assert!(!cache.evict_page(key(0), true));
        assert!(cache.contains_page(key(0)));

        cache.dec_page_ref_count(key(0));
        assert!(cache.evict_page(key(0), true));
        assert!(!cache.contains_page(key(0)));
        assert!(page.is_released());
        assert!(!cache.evict_page(key(0), true));
    }

    #[test]
    fn test_evict_dirty_page_queues_flush() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        let page = cache.get_new_page(1, key(0), None).unwrap();
        cache.dec_page_ref_count(key(0));

        assert!(cache.evict_page(key(0), true));
        assert!(page.is_in_flush());
        assert!(page.is_in_eviction());
        assert!(cache.contains_page(key(0)));
        assert_eq!(cache.flush_queue().len(), 1);

        // already on its way out
        assert!(cache.evict_page(key(0), true));
        assert_eq!(cache.flush_queue().len(), 1);
    }

    #[test]
    fn test_evict_without_flush_drops_dirty_page() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        cache.get_new_page(1, key(0), None).unwrap();
        cache.dec_page_ref_count(key(0));

        assert!(cache.evict_page(key(0), false));
        assert!(!cache.contains_page(key(0)));
        assert!(cache.flush_queue().is_empty());
    }

    #[test]
    fn test_temporary_set_pages_are_dropped() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        let temp = CacheKey::new(0, 1, 5, PageId::new(0));
        cache.get_new_page(1, temp, None).unwrap();
        cache.dec_page_ref_count(temp);

        assert!(cache.evict_page(temp, true));
        assert!(!cache.contains_page(temp));
        assert!(cache.flush_queue().is_empty());
    }

    #[test]
    fn test_mru_eviction_converges() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        for i in 0..cache.max_size() as u32 {
            let page = cache.get_new_page(1, key(i), None).unwrap();
            page.set_dirty(false);
            cache.dec_page_ref_count(key(i));
        }
        assert!(cache.size() > cache.evict_stop_size());

        cache.evict();
        assert!(cache.size() <= cache.evict_stop_size());
        // the newest page went first
        assert!(!cache.contains_page(key(cache.max_size() as u32 - 1)));
        assert!(cache.contains_page(key(0)));
    }

    #[test]
    fn test_lru_eviction_evicts_oldest() {
        let cache = test_cache(16, CacheStrategy::UnifiedLru);
        for i in 0..cache.max_size() as u32 {
            let page = cache.get_new_page(1, key(i), None).unwrap();
            page.set_dirty(false);
            cache.dec_page_ref_count(key(i));
        }

        cache.evict();
        assert!(!cache.contains_page(key(0)));
        assert!(cache.contains_page(key(cache.max_size() as u32 - 1)));
    }

    #[test]
    fn test_eviction_skips_referenced_pages() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        for i in 0..cache.max_size() as u32 {
            cache.get_new_page(1, key(i), None).unwrap().set_dirty(false);
        }
        assert_eq!(cache.evict(), 0);
        assert_eq!(cache.size(), cache.max_size());
    }

    #[test]
    fn test_blocking_allocation_evicts() {
        let cache = test_cache(16, CacheStrategy::UnifiedLru);
        for i in 0..cache.max_size() as u32 {
            cache.get_new_page(1, key(i), None).unwrap().set_dirty(false);
            cache.dec_page_ref_count(key(i));
        }
        assert!(cache.shared_memory().malloc_align(PAGE_SIZE, SHM_ALIGNMENT).is_none());

        let page = cache.get_new_page(1, key(100), None).unwrap();
        assert_eq!(page.ref_count(), 1);
        assert!(!cache.contains_page(key(0)));
    }

    #[test]
    fn test_non_blocking_allocation_gives_up() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        for i in 0..cache.max_size() as u32 {
            cache.get_new_page(1, key(i), None).unwrap();
        }
        assert!(cache.get_new_page_non_blocking(1, key(100), None).is_none());
    }

    #[test]
    fn test_evict_all_dirty_pages() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        for i in 0..4 {
            cache.get_new_page(1, key(i), None).unwrap();
        }
        cache.dec_page_ref_count(key(0));
        cache.dec_page_ref_count(key(1));

        assert_eq!(cache.evict_all_dirty_pages(), 2);
        assert_eq!(cache.flush_queue().len(), 2);
        assert_eq!(cache.unpin_and_evict_all_dirty_pages(), 2);
        assert_eq!(cache.flush_queue().len(), 4);
    }

    #[test]
    fn test_flush_page_without_eviction() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        let page = cache.get_new_page(1, key(0), None).unwrap();

        assert!(cache.flush_page_without_eviction(key(0)));
        assert!(page.is_in_flush());
        assert!(!page.is_in_eviction());
        assert!(!cache.flush_page_without_eviction(key(0)));
        assert!(!cache.flush_page_without_eviction(key(1)));
    }

    #[test]
    fn test_cached_lookup_touches_page() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        let first = cache.get_new_page(1, key(0), None).unwrap();
        let second = cache.get_new_page(1, key(1), None).unwrap();
        assert!(first.access_seq() < second.access_seq());

        let again = cache.get_cached_page(key(0), None).unwrap();
        assert!(again.access_seq() > second.access_seq());
        assert_eq!(again.ref_count(), 2);
        assert!(cache.get_cached_page(key(9), None).is_none());
    }

    #[test]
    fn test_pin_unpin_moves_bucket() {
        let cache = test_cache(16, CacheStrategy::UnifiedIntelligent);
        let set = Arc::new(LocalitySet::new(
            SetKey::new(1, 2, 3),
            LocalityType::ShuffleData,
            ReplacementPolicy::Mru,
            OperationType::Write,
            DurabilityType::TryCache,
            PersistenceType::Transient,
        ));

        cache.pin(&set, ReplacementPolicy::Lru, OperationType::Read);
        assert_eq!(
            cache.priority_buckets().level_of(&set),
            Some(PriorityLevel::TransientLifetimeNotEndedShuffleData)
        );
        cache.unpin(&set);
        assert_eq!(
            cache.priority_buckets().level_of(&set),
            Some(PriorityLevel::TransientLifetimeEnded)
        );
        assert!(set.is_lifetime_ended());
    }

    #[test]
    fn test_intelligent_eviction_prefers_ended_sets() {
        let cache = test_cache(32, CacheStrategy::UnifiedIntelligent);
        let make_set = |id| {
            Arc::new(LocalitySet::new(
                SetKey::new(1, 2, id),
                LocalityType::JobData,
                ReplacementPolicy::Mru,
                OperationType::Write,
                DurabilityType::TryCache,
                PersistenceType::Persistent,
            ))
        };
        let active = make_set(1);
        let ended = make_set(2);
        cache.pin(&active, ReplacementPolicy::Mru, OperationType::Write);
        cache.pin(&ended, ReplacementPolicy::Mru, OperationType::Write);
        cache.unpin(&ended);

        for (set, id) in [(&active, 1), (&ended, 2)] {
            for i in 0..3 {
                let key = SetKey::new(1, 2, id).page(PageId::new(i));
                cache.get_new_page(1, key, Some(set)).unwrap().set_dirty(false);
                cache.dec_page_ref_count(key);
            }
        }

        assert_eq!(cache.evict(), 1);
        assert_eq!(ended.num_cached_pages(), 2);
        assert_eq!(active.num_cached_pages(), 3);
        assert!(!cache.contains_page(SetKey::new(1, 2, 2).page(PageId::new(2))));
    }

    #[test]
    fn test_build_page_from_reader() {
        let cache = test_cache(16, CacheStrategy::UnifiedMru);
        let bytes = vec![5u8; PAGE_SIZE];
        let mut reader = &bytes[..];

        let page = cache
            .build_and_cache_page_from_reader(&mut reader, PAGE_SIZE, 1, key(0), None)
            .unwrap();
        assert!(!page.is_dirty());
        assert_eq!(page.ref_count(), 1);
        assert!(page.read().unwrap().iter().all(|&b| b == 5));
        assert_eq!(cache.stats().snapshot().pages_loaded, 1);
    }
}
