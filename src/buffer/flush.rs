//! Flush pipeline - dirty pages travel from the cache to their set's file.
//!
//! ```text
//!   evict_page / flush_page_without_eviction
//!                  │
//!                  ▼
//!        ┌───────────────────┐
//!        │    FlushQueue     │  (MPMC channel)
//!        └───────────────────┘
//!           │      │      │
//!           ▼      ▼      ▼
//!     FlushConsumer(partition 0..N)
//!           │
//!           ▼
//!   FlushTarget::file().append_page → FlushTarget::page_flushed
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, warn};

use crate::buffer::PageCache;
use crate::common::{PageId, PageIndex, PartitionId};
use crate::storage::page::PageHandle;
use crate::storage::PdbFile;
use crate::worker::BackgroundWorkerHandle;

/// The owner of flushed pages: something with a file and a dirty-page map.
pub trait FlushTarget: Send + Sync {
    /// File the pages are appended to.
    fn file(&self) -> &PdbFile;

    /// Called after `page_id` was appended at `location`.
    ///
    /// Implementations persist the file's metadata when `persist_meta` is
    /// set, and update their dirty-page map, both under their dirty-map lock.
    fn page_flushed(&self, page_id: PageId, location: PageIndex, persist_meta: bool);
}

/// Queue of dirty pages waiting to be written.
pub struct FlushQueue {
    tx: Sender<PageHandle>,
    rx: Receiver<PageHandle>,
}

impl FlushQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, page: PageHandle) {
        // both ends live in self, so the channel is never disconnected
        let _ = self.tx.send(page);
    }

    pub fn try_pop(&self) -> Option<PageHandle> {
        match self.rx.try_recv() {
            Ok(page) => Some(page),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<PageHandle> {
        match self.rx.recv_timeout(timeout) {
            Ok(page) => Some(page),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Receiving end, for consumers that `select!` on it.
    pub(crate) fn receiver(&self) -> &Receiver<PageHandle> {
        &self.rx
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for FlushQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes queued pages into one data partition of their set's file.
pub struct FlushConsumer {
    cache: Arc<PageCache>,
    partition_id: PartitionId,
}

impl FlushConsumer {
    pub fn new(cache: Arc<PageCache>, partition_id: PartitionId) -> Self {
        Self {
            cache,
            partition_id,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Run the consumer on its own thread until the handle shuts it down.
    ///
    /// Pages still queued at shutdown are flushed before the thread exits.
    pub fn start(self) -> BackgroundWorkerHandle {
        info!("starting flush consumer for partition {}", self.partition_id);
        let (tx, shutdown) = channel::unbounded::<()>();
        let handle = thread::spawn(move || self.run(shutdown));
        BackgroundWorkerHandle::new(handle, tx)
    }

    fn run(self, shutdown: Receiver<()>) {
        let queue = self.cache.flush_queue().receiver().clone();
        loop {
            crossbeam::select! {
                recv(queue) -> page => match page {
                    Ok(page) => self.flush(page),
                    Err(_) => break,
                },
                recv(shutdown) -> _ => {
                    // a message or a dropped handle both mean stop
                    let drained = self.flush_pending();
                    info!(
                        "stopping flush consumer for partition {} ({} pages drained)",
                        self.partition_id, drained
                    );
                    break;
                }
            }
        }
    }

    /// Flush everything currently queued. Returns the number of pages taken
    /// off the queue.
    pub fn flush_pending(&self) -> usize {
        let mut processed = 0;
        while let Some(page) = self.cache.flush_queue().try_pop() {
            self.flush(page);
            processed += 1;
        }
        processed
    }

    /// Write one page and settle its cache state.
    ///
    /// A page queued for eviction that nobody references any more is freed
    /// and uncached; any other page just becomes clean. A failed append
    /// leaves the page dirty and cached.
    pub fn flush(&self, page: PageHandle) {
        let key = page.key();
        let set_key = key.set_key();
        let target = self.cache.flush_target(set_key);

        let _flush = self.cache.flush_lock();
        if page.is_released() {
            return;
        }

        match target {
            Some(target) => {
                let file = target.file();
                let partition_id = self.partition_id % file.num_partitions().max(1) as PartitionId;
                let appended = page
                    .to_vec()
                    .and_then(|bytes| file.append_page(partition_id, key.page_id, &bytes));
                match appended {
                    Ok(seq) => {
                        let location = PageIndex::new(partition_id, seq);
                        page.set_location(Some(location));
                        target.page_flushed(key.page_id, location, !set_key.is_temporary());
                        self.cache.stats().record_flush();
                        debug!("flushed page {} to {}", key, location);
                    }
                    Err(e) => {
                        error!("failed to flush page {}: {}", key, e);
                        page.set_in_flush(false);
                        page.set_in_eviction(false);
                        return;
                    }
                }
            }
            None => {
                warn!("no set registered for {}, dropping its contents", key);
                self.cache.stats().record_drop();
            }
        }

        if !(page.is_in_eviction() && self.cache.free_page_if_unreferenced(&page)) {
            page.set_in_eviction(false);
            page.set_dirty(false);
            page.set_in_flush(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::StorageConfig;
    use crate::common::{CacheKey, SetKey};
    use crate::memory::SharedMemory;

    fn cache() -> Arc<PageCache> {
        let config = StorageConfig {
            page_size: 512,
            shm_size: 64 * 512,
            ..StorageConfig::default()
        };
        let shm = Arc::new(SharedMemory::new(config.shm_size).unwrap());
        Arc::new(PageCache::new(&config, shm).unwrap())
    }

    #[test]
    fn test_queue_order() {
        let cache = cache();
        let queue = FlushQueue::new();
        assert!(queue.is_empty());

        for i in 0..3 {
            let key = CacheKey::new(1, 1, 1, PageId::new(i));
            queue.push(cache.get_new_page(0, key, None).unwrap());
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop().unwrap().page_id(), PageId::new(0));
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(10)).unwrap().page_id(),
            PageId::new(1)
        );
    }

    #[test]
    fn test_flush_without_target_discards() {
        let cache = cache();
        let key = SetKey::new(1, 1, 1).page(PageId::new(0));
        let page = cache.get_new_page(0, key, None).unwrap();
        cache.dec_page_ref_count(key);

        assert!(cache.evict_page(key, true));
        assert!(cache.contains_page(key));

        let consumer = FlushConsumer::new(Arc::clone(&cache), 0);
        assert_eq!(consumer.flush_pending(), 1);
        assert!(!cache.contains_page(key));
        assert!(page.is_released());
        let snapshot = cache.stats().snapshot();
        assert_eq!(snapshot.pages_dropped, 1);
        assert_eq!(snapshot.pages_flushed, 0);
    }

    #[test]
    fn test_background_consumer_drains_on_shutdown() {
        let cache = cache();
        let key = SetKey::new(1, 1, 1).page(PageId::new(0));
        let page = cache.get_new_page(0, key, None).unwrap();
        cache.dec_page_ref_count(key);

        let handle = FlushConsumer::new(Arc::clone(&cache), 0).start();
        assert!(cache.evict_page(key, true));
        handle.shutdown().unwrap();
        handle.join().unwrap();

        assert!(cache.flush_queue().is_empty());
        assert!(page.is_released());
    }
}
