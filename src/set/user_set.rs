//! User Set - a persistent, page-structured set of records.
//!
//! A [`UserSet`] ties together a [`LocalitySet`] (its eviction policy), a
//! [`PdbFile`] (where its pages end up) and the shared [`PageCache`]. New
//! pages start dirty in the cache and are tracked in the set's dirty-page
//! map until a flush consumer has written them out.
//!
//! ```text
//!   add_page / get_new_bytes
//!            │
//!            ▼
//!   dirty map: page_id → { in_cache: true }
//!            │  flushed by a FlushConsumer
//!            ▼
//!   pinned set:   { in_cache: false, location }  (removed by an iterator)
//!   unpinned set: entry removed
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::buffer::flush::FlushTarget;
use crate::buffer::locality_set::{
    DurabilityType, LocalitySet, LocalityType, OperationType, PersistenceType, ReplacementPolicy,
};
use crate::buffer::PageCache;
use crate::common::{Error, NodeId, PageId, PageIndex, Result, SetKey};
use crate::set::iterator::{PageIterator, PartitionPageIterator, SetCachePageIterator};
use crate::storage::page::{PageHandle, PageHeader, RECORD_LEN_SIZE};
use crate::storage::{FileType, PdbFile};

/// How a set's pages are grouped and evicted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LocalityOptions {
    pub locality_type: LocalityType,
    pub policy: ReplacementPolicy,
    pub operation: OperationType,
    pub durability: DurabilityType,
    pub persistence: PersistenceType,
}

/// State of one page in the dirty-page map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyPageEntry {
    /// Still only in the cache.
    pub in_cache: bool,
    /// Where the page was flushed, once it has been.
    pub location: Option<PageIndex>,
}

/// Dirty pages plus the pin flag that decides how a flush updates them.
#[derive(Default)]
pub(crate) struct DirtyPageSet {
    pinned: bool,
    entries: BTreeMap<PageId, DirtyPageEntry>,
}

impl DirtyPageSet {
    fn insert(&mut self, page_id: PageId) -> bool {
        if self.entries.contains_key(&page_id) {
            return false;
        }
        self.entries.insert(
            page_id,
            DirtyPageEntry {
                in_cache: true,
                location: None,
            },
        );
        true
    }

    /// A pinned set may have iterators walking the map, so the entry stays
    /// and only flips to flushed.
    fn mark_flushed(&mut self, page_id: PageId, location: PageIndex) {
        if !self.pinned {
            self.entries.remove(&page_id);
            return;
        }
        match self.entries.get_mut(&page_id) {
            Some(entry) => {
                entry.in_cache = false;
                entry.location = Some(location);
            }
            None => debug!("flushed page {} is not in the dirty page set", page_id),
        }
    }

    pub(crate) fn get(&self, page_id: PageId) -> Option<DirtyPageEntry> {
        self.entries.get(&page_id).copied()
    }

    pub(crate) fn remove(&mut self, page_id: PageId) -> Option<DirtyPageEntry> {
        self.entries.remove(&page_id)
    }

    fn page_ids(&self) -> Vec<PageId> {
        self.entries.keys().copied().collect()
    }
}

/// Where [`UserSet::get_new_bytes`] reserved a record.
///
/// Holds the page it points into; the page stays referenced as the set's
/// input page until the set moves on to a new one.
pub struct RecordSlot {
    page: PageHandle,
    offset: usize,
    len: usize,
}

impl RecordSlot {
    pub fn page(&self) -> &PageHandle {
        &self.page
    }

    /// Offset of the record body within the page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `bytes` into the record, starting at its first byte.
    ///
    /// # Errors
    /// `Error::RecordTooLarge` if `bytes` is longer than the reservation,
    /// `Error::PageReleased` if the page has been freed.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.len {
            return Err(Error::RecordTooLarge {
                requested: bytes.len(),
                capacity: self.len,
            });
        }
        let mut guard = self.page.write()?;
        guard[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy of the record's bytes.
    pub fn read(&self) -> Result<Vec<u8>> {
        let guard = self.page.read()?;
        Ok(guard[self.offset..self.offset + self.len].to_vec())
    }
}

/// A set of pages owned by one client, persisted through its file.
///
/// # Thread Safety
/// - `dirty`: `Mutex`, the dirty-page map together with the pin flag.
///   Flush consumers take it inside the cache's flush read lock.
/// - `input_page`: `Mutex`, serializes record allocation.
/// - `next_page_id`: atomic, hands out page ids.
///
/// Never hold `dirty` while fetching a page through the cache.
pub struct UserSet {
    name: String,
    node_id: NodeId,
    locality: Arc<LocalitySet>,
    file: PdbFile,
    cache: Arc<PageCache>,
    next_page_id: AtomicU32,
    dirty: Mutex<DirtyPageSet>,
    input_page: Mutex<Option<PageHandle>>,
}

impl UserSet {
    /// Build a set over `file` and register it with the cache's flush
    /// pipeline.
    ///
    /// An existing file keeps its pages; new page ids continue after the
    /// last flushed one.
    pub fn new(
        cache: Arc<PageCache>,
        file: PdbFile,
        name: impl Into<String>,
        options: LocalityOptions,
    ) -> Result<Arc<Self>> {
        file.open_all()?;
        let set_key = file.set_key();
        // an empty file reports INVALID, whose successor is 0
        let next_page_id = file.last_flushed_page_id().next();

        let locality = Arc::new(LocalitySet::new(
            set_key,
            options.locality_type,
            options.policy,
            options.operation,
            options.durability,
            options.persistence,
        ));
        let set = Arc::new(Self {
            name: name.into(),
            node_id: file.node_id(),
            locality,
            file,
            cache,
            next_page_id: AtomicU32::new(next_page_id.0),
            dirty: Mutex::new(DirtyPageSet::default()),
            input_page: Mutex::new(None),
        });

        let target: Weak<dyn FlushTarget> = Arc::downgrade(&set) as Weak<dyn FlushTarget>;
        set.cache.register_flush_target(set_key, target);
        info!(
            "opened user set {} ({}), next page id {}",
            set.name, set_key, next_page_id
        );
        Ok(set)
    }

    // ========================================================================
    // Pages
    // ========================================================================

    /// Create the next page of this set.
    ///
    /// The page comes back referenced, pinned and dirty, and is recorded in
    /// the dirty-page map.
    pub fn add_page(&self) -> Option<PageHandle> {
        let page_id = PageId::new(self.next_page_id.fetch_add(1, Ordering::AcqRel));
        let key = self.set_key().page(page_id);
        let page = match self.cache.get_new_page(self.node_id, key, Some(&self.locality)) {
            Ok(page) => page,
            Err(e) => {
                error!("failed to add page {}: {}", key, e);
                return None;
            }
        };
        self.add_page_to_dirty_page_set(page_id);
        Some(page)
    }

    /// Reserve `size` bytes for a record in the current input page.
    ///
    /// A full input page is released (and evicted if `evict_when_unpin`)
    /// and a new one takes its place. Returns `None` if `size` is zero or
    /// cannot fit into an empty page.
    pub fn get_new_bytes(&self, size: usize, evict_when_unpin: bool) -> Option<RecordSlot> {
        if size == 0 {
            return None;
        }
        if size > self.max_record_size() {
            warn!(
                "record of {} bytes does not fit into a page of {}",
                size,
                self.name
            );
            return None;
        }
        let mut input = self.input_page.lock();
        let page = match input.as_ref() {
            Some(page) => Arc::clone(page),
            None => {
                let page = self.add_page()?;
                *input = Some(Arc::clone(&page));
                page
            }
        };
        if let Some(offset) = page.add_variable_bytes(size) {
            return Some(RecordSlot {
                page,
                offset,
                len: size,
            });
        }

        self.retire_input_page(&page, evict_when_unpin);
        *input = None;
        let page = self.add_page()?;
        *input = Some(Arc::clone(&page));
        let offset = page.add_variable_bytes(size)?;
        Some(RecordSlot {
            page,
            offset,
            len: size,
        })
    }

    /// Largest record an empty page can hold.
    pub fn max_record_size(&self) -> usize {
        self.cache
            .page_size()
            .saturating_sub(PageHeader::SIZE + RECORD_LEN_SIZE)
    }

    fn retire_input_page(&self, page: &PageHandle, evict: bool) {
        let key = page.key();
        self.cache.dec_page_ref_count(key);
        if self.locality.durability() == DurabilityType::CacheThrough {
            self.cache.flush_page_without_eviction(key);
        }
        if evict {
            self.cache.evict_page(key, true);
        }
    }

    /// Release the reference held on the current input page.
    pub fn unpin_buffer_page(&self) {
        if let Some(page) = self.input_page.lock().take() {
            self.cache.dec_page_ref_count(page.key());
        }
    }

    /// Fetch one page of this set, from the cache or from disk.
    ///
    /// `location` may be `None` to look the page up in the file.
    pub fn get_page(&self, location: Option<PageIndex>, page_id: PageId) -> Option<PageHandle> {
        self.cache
            .get_page(&self.file, location, page_id, false, Some(&self.locality))
    }

    /// Iterators covering every page of the set: one over pages still in
    /// the dirty-page map, one per non-empty data partition.
    ///
    /// The snapshot is taken with flushing held off, so a page is either in
    /// the dirty-page map or counted in its partition, never both.
    pub fn get_iterators(self: &Arc<Self>) -> Vec<Box<dyn PageIterator>> {
        let _flush = self.cache.eviction_lock();
        let mut dirty = self.dirty.lock();
        dirty.entries.retain(|_, entry| entry.in_cache);
        let mut iterators: Vec<Box<dyn PageIterator>> = Vec::new();
        if !dirty.entries.is_empty() {
            iterators.push(Box::new(SetCachePageIterator::new(
                Arc::clone(self),
                dirty.page_ids(),
            )));
        }
        match self.file.file_type() {
            FileType::Sequence => {
                iterators.push(Box::new(PartitionPageIterator::new(Arc::clone(self), 0)));
            }
            FileType::Partitioned => {
                for partition_id in 0..self.file.num_partitions() as u32 {
                    if self.file.partition_num_pages(partition_id).unwrap_or(0) > 0 {
                        iterators.push(Box::new(PartitionPageIterator::new(
                            Arc::clone(self),
                            partition_id,
                        )));
                    }
                }
            }
        }
        iterators
    }

    /// Concatenated bytes of every page of the set.
    pub fn dump(self: &Arc<Self>) -> Result<Vec<u8>> {
        self.set_pinned(true);
        let mut bytes = Vec::new();
        let mut result = Ok(());
        for mut iterator in self.get_iterators() {
            while iterator.has_next() {
                let Some(page) = iterator.next() else {
                    continue;
                };
                let copied = page.read().map(|guard| bytes.extend_from_slice(&guard));
                self.cache.dec_page_ref_count(page.key());
                if let Err(e) = copied {
                    result = Err(e);
                    break;
                }
            }
            if result.is_err() {
                break;
            }
        }
        self.set_pinned(false);
        result.map(|()| bytes)
    }

    // ========================================================================
    // Dirty page set
    // ========================================================================

    pub fn add_page_to_dirty_page_set(&self, page_id: PageId) {
        if !self.dirty.lock().insert(page_id) {
            warn!("page {} of {} is already in the dirty page set", page_id, self.name);
        }
    }

    /// Record that `page_id` was flushed to `location`.
    pub fn remove_page_from_dirty_page_set(&self, page_id: PageId, location: PageIndex) {
        self.dirty.lock().mark_flushed(page_id, location);
    }

    /// Drop entries whose pages have been flushed.
    pub fn clean_dirty_page_set(&self) {
        self.dirty.lock().entries.retain(|_, entry| entry.in_cache);
    }

    /// Queue every cached dirty page for writing, and forget them.
    pub fn flush_dirty_pages(&self) -> usize {
        let mut dirty = self.dirty.lock();
        let set_key = self.set_key();
        let mut queued = 0;
        dirty.entries.retain(|page_id, entry| {
            if !entry.in_cache {
                return true;
            }
            if self.cache.flush_page_without_eviction(set_key.page(*page_id)) {
                queued += 1;
            }
            false
        });
        debug!("queued {} dirty pages of {}", queued, self.name);
        queued
    }

    pub fn dirty_page_entry(&self, page_id: PageId) -> Option<DirtyPageEntry> {
        self.dirty.lock().get(page_id)
    }

    pub fn num_dirty_pages(&self) -> usize {
        self.dirty.lock().entries.len()
    }

    pub(crate) fn dirty_pages(&self) -> MutexGuard<'_, DirtyPageSet> {
        self.dirty.lock()
    }

    pub fn set_pinned(&self, pinned: bool) {
        self.dirty.lock().pinned = pinned;
    }

    pub fn is_pinned(&self) -> bool {
        self.dirty.lock().pinned
    }

    // ========================================================================
    // Lifetime
    // ========================================================================

    /// Start a job over this set.
    pub fn pin(&self, policy: ReplacementPolicy, operation: OperationType) {
        self.cache.pin(&self.locality, policy, operation);
    }

    /// Finish the job; the set's pages become preferred eviction victims.
    pub fn unpin(&self) {
        self.cache.unpin(&self.locality);
    }

    /// Drop every page of the set, cached or on disk.
    pub fn clear(&self) -> Result<()> {
        self.input_page.lock().take();
        for page in self.locality.cached_pages() {
            page.reset_ref_count();
            self.cache.free_page(&page);
        }
        self.dirty.lock().entries.clear();
        self.file.clear()?;
        self.next_page_id.store(0, Ordering::Release);
        info!("cleared user set {}", self.name);
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_key(&self) -> SetKey {
        self.locality.set_key()
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn locality(&self) -> &Arc<LocalitySet> {
        &self.locality
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn file(&self) -> &PdbFile {
        &self.file
    }

    /// Pages created over the set's life, flushed or not.
    pub fn num_pages(&self) -> u32 {
        self.next_page_id.load(Ordering::Acquire)
    }

    pub fn last_flushed_page_id(&self) -> PageId {
        self.file.last_flushed_page_id()
    }
}

impl FlushTarget for UserSet {
    fn file(&self) -> &PdbFile {
        &self.file
    }

    fn page_flushed(&self, page_id: PageId, location: PageIndex, persist_meta: bool) {
        let mut dirty = self.dirty.lock();
        if persist_meta {
            if let Err(e) = self.file.write_meta() {
                error!("failed to persist metadata of {}: {}", self.name, e);
            }
        }
        dirty.mark_flushed(page_id, location);
    }
}

impl Drop for UserSet {
    fn drop(&mut self) {
        self.cache.remove_locality_set(&self.locality);
    }
}

impl fmt::Debug for UserSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSet")
            .field("name", &self.name)
            .field("set_key", &self.set_key())
            .field("num_pages", &self.num_pages())
            .field("file_type", &self.file.file_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::{IoMode, StorageConfig};
    use crate::memory::SharedMemory;
    use crate::storage::{PartitionedFile, SequenceFile};
    use crate::buffer::FlushConsumer;
    use tempfile::{tempdir, TempDir};

    const PAGE_SIZE: usize = 512;

    fn cache(pages: usize) -> Arc<PageCache> {
        let config = StorageConfig {
            page_size: PAGE_SIZE,
            shm_size: pages * PAGE_SIZE,
            ..StorageConfig::default()
        };
        let shm = Arc::new(SharedMemory::new(config.shm_size).unwrap());
        Arc::new(PageCache::new(&config, shm).unwrap())
    }

    fn partitioned(dir: &TempDir, set_key: SetKey) -> PdbFile {
        PartitionedFile::create(
            set_key,
            0,
            dir.path().join("meta"),
            vec![dir.path().join("d0"), dir.path().join("d1")],
            PAGE_SIZE,
            IoMode::Buffered,
        )
        .unwrap()
        .into()
    }

    fn user_set(cache: &Arc<PageCache>, dir: &TempDir) -> Arc<UserSet> {
        let file = partitioned(dir, SetKey::new(1, 1, 1));
        UserSet::new(Arc::clone(cache), file, "test", LocalityOptions::default()).unwrap()
    }

    #[test]
    fn test_add_page_tracks_dirty() {
        let dir = tempdir().unwrap();
        let cache = cache(32);
        let set = user_set(&cache, &dir);

        let page = set.add_page().unwrap();
        assert_eq!(page.page_id(), PageId::new(0));
        assert!(page.is_dirty());
        assert_eq!(set.add_page().unwrap().page_id(), PageId::new(1));
        assert_eq!(set.num_pages(), 2);
        assert_eq!(
            set.dirty_page_entry(PageId::new(0)),
            Some(DirtyPageEntry {
                in_cache: true,
                location: None
            })
        );
        assert_eq!(set.locality().num_cached_pages(), 2);
    }

    #[test]
    fn test_duplicate_dirty_insert_keeps_entry() {
        let dir = tempdir().unwrap();
        let cache = cache(32);
        let set = user_set(&cache, &dir);

        set.add_page_to_dirty_page_set(PageId::new(4));
        set.add_page_to_dirty_page_set(PageId::new(4));
        assert_eq!(set.num_dirty_pages(), 1);
    }

    #[test]
    fn test_dirty_transition_pinned_and_unpinned() {
        let dir = tempdir().unwrap();
        let cache = cache(32);
        let set = user_set(&cache, &dir);
        let location = PageIndex::new(1, 3);

        set.add_page_to_dirty_page_set(PageId::new(0));
        set.set_pinned(true);
        set.remove_page_from_dirty_page_set(PageId::new(0), location);
        assert_eq!(
            set.dirty_page_entry(PageId::new(0)),
            Some(DirtyPageEntry {
                in_cache: false,
                location: Some(location)
            })
        );

        set.clean_dirty_page_set();
        assert_eq!(set.num_dirty_pages(), 0);

        set.add_page_to_dirty_page_set(PageId::new(1));
        set.set_pinned(false);
        set.remove_page_from_dirty_page_set(PageId::new(1), location);
        assert_eq!(set.dirty_page_entry(PageId::new(1)), None);
    }

    #[test]
    fn test_get_new_bytes_rotates_input_page() {
        let dir = tempdir().unwrap();
        let cache = cache(32);
        let set = user_set(&cache, &dir);

        let first = set.get_new_bytes(200, false).unwrap();
        first.write(&[7u8; 200]).unwrap();
        assert_eq!(first.read().unwrap(), vec![7u8; 200]);

        let second = set.get_new_bytes(200, false).unwrap();
        assert_eq!(second.page().page_id(), PageId::new(1));
        assert_eq!(first.page().ref_count(), 0);
        assert_eq!(second.page().ref_count(), 1);
        assert_eq!(set.num_pages(), 2);
    }

    #[test]
    fn test_get_new_bytes_rejects_oversized() {
        let dir = tempdir().unwrap();
        let cache = cache(32);
        let set = user_set(&cache, &dir);

        assert!(set.get_new_bytes(0, false).is_none());
        assert!(set.get_new_bytes(PAGE_SIZE, false).is_none());
        assert!(set.get_new_bytes(usize::MAX, false).is_none());
        assert_eq!(set.num_pages(), 0);
        assert_eq!(set.num_dirty_pages(), 0);

        set.get_new_bytes(set.max_record_size(), false).unwrap();
        for _ in 0..3 {
            assert!(set.get_new_bytes(PAGE_SIZE, false).is_none());
        }
        assert_eq!(set.num_pages(), 1);
        assert_eq!(set.num_dirty_pages(), 1);
        assert_eq!(cache.size(), 1);

        let slot = set.get_new_bytes(8, false).unwrap();
        assert!(matches!(
            slot.write(&[0u8; 9]),
            Err(Error::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn test_evict_when_unpin_queues_full_page() {
        let dir = tempdir().unwrap();
        let cache = cache(32);
        let set = user_set(&cache, &dir);

        let first = set.get_new_bytes(400, true).unwrap();
        set.get_new_bytes(400, true).unwrap();
        assert!(first.page().is_in_flush());

        FlushConsumer::new(Arc::clone(&cache), 1).flush_pending();
        assert!(first.page().is_released());
        assert_eq!(set.file().page_index(PageId::new(0)), Some(PageIndex::new(1, 0)));
        assert_eq!(set.dirty_page_entry(PageId::new(0)), None);
    }

    #[test]
    fn test_flush_dirty_pages_keeps_pages_cached() {
        let dir = tempdir().unwrap();
        let cache = cache(32);
        let set = user_set(&cache, &dir);
        let page = set.add_page().unwrap();
        set.add_page().unwrap();

        assert_eq!(set.flush_dirty_pages(), 2);
        assert_eq!(set.num_dirty_pages(), 0);
        FlushConsumer::new(Arc::clone(&cache), 0).flush_pending();

        assert!(!page.is_dirty());
        assert!(cache.contains_page(page.key()));
        assert_eq!(set.file().num_flushed_pages(), 2);
        assert_eq!(set.last_flushed_page_id(), PageId::new(1));
    }

    #[test]
    fn test_reopen_continues_page_ids() {
        let dir = tempdir().unwrap();
        let cache = cache(32);
        let set_key = SetKey::new(1, 1, 1);
        {
            let set = user_set(&cache, &dir);
            set.add_page().unwrap();
            set.add_page().unwrap();
            set.flush_dirty_pages();
            FlushConsumer::new(Arc::clone(&cache), 0).flush_pending();
        }

        let file: PdbFile = PartitionedFile::open(set_key, 0, dir.path().join("meta"), IoMode::Buffered)
            .unwrap()
            .into();
        let cache = self::cache(32);
        let set = UserSet::new(cache, file, "test", LocalityOptions::default()).unwrap();
        assert_eq!(set.num_pages(), 2);
        assert_eq!(set.add_page().unwrap().page_id(), PageId::new(2));
    }

    #[test]
    fn test_dump_sequence_set() {
        let dir = tempdir().unwrap();
        let cache = cache(32);
        let set_key = SetKey::new(1, 1, 2);
        let file: PdbFile = SequenceFile::open(set_key, 0, dir.path().join("seq"), PAGE_SIZE)
            .unwrap()
            .into();
        let set = UserSet::new(Arc::clone(&cache), file, "seq", LocalityOptions::default()).unwrap();

        let slot = set.get_new_bytes(16, false).unwrap();
        slot.write(b"sequence-record!").unwrap();
        set.unpin_buffer_page();
        set.flush_dirty_pages();
        FlushConsumer::new(Arc::clone(&cache), 0).flush_pending();

        let bytes = set.dump().unwrap();
        assert_eq!(bytes.len(), PAGE_SIZE);
        assert_eq!(&bytes[slot.offset()..slot.offset() + 16], b"sequence-record!");
        assert!(!set.is_pinned());
    }

    #[test]
    fn test_clear_drops_pages_and_file() {
        let dir = tempdir().unwrap();
        let cache = cache(32);
        let set = user_set(&cache, &dir);
        let page = set.add_page().unwrap();

        set.clear().unwrap();
        assert!(page.is_released());
        assert_eq!(cache.size(), 0);
        assert_eq!(set.num_dirty_pages(), 0);
        assert!(set.file().is_cleared());
    }

    #[test]
    fn test_pin_unpin_moves_buckets() {
        let dir = tempdir().unwrap();
        let cache = cache(32);
        let set = user_set(&cache, &dir);

        set.pin(ReplacementPolicy::Lru, OperationType::Write);
        assert!(cache.priority_buckets().level_of(set.locality()).is_some());
        set.unpin();
        assert!(set.locality().is_lifetime_ended());
    }
}
