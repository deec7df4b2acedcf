//! Storage context - everything one storage engine instance owns.
//!
//! A [`StorageContext`] replaces process-wide singletons: it holds the
//! configuration, the shared-memory arena, the page cache, the flush
//! consumers and a worker pool for asynchronous eviction. Sets are created
//! through it so they all share one cache.
//!
//! # Directory Layout
//! ```text
//! root/
//!   {db}_{type}_{set}/        one partitioned user set
//!     meta
//!     data.0 .. data.{N-1}    N = num_flush_threads
//!   {db}_{type}_{set}.seq     one sequence user set
//!   {db}_{type}_{set}.scratch one file set
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::Mutex;

use crate::buffer::{FlushConsumer, PageCache};
use crate::common::config::StorageConfig;
use crate::common::{Error, PartitionId, Result, SetKey};
use crate::memory::SharedMemory;
use crate::set::{FileSet, LocalityOptions, UserSet};
use crate::storage::{PartitionedFile, PdbFile, SequenceFile};
use crate::worker::{BackgroundWorkerHandle, WorkerPool};

/// Threads running asynchronous eviction passes.
const EVICTION_WORKERS: usize = 1;

/// Owns the cache and its background threads.
///
/// # Example
/// ```no_run
/// use setstore::{LocalityOptions, SetKey, StorageConfig, StorageContext};
///
/// let context = StorageContext::new(StorageConfig::default(), "/tmp/setstore").unwrap();
/// let set = context
///     .create_user_set(SetKey::new(1, 1, 1), "numbers", LocalityOptions::default())
///     .unwrap();
/// let slot = set.get_new_bytes(8, false).unwrap();
/// slot.write(&42u64.to_le_bytes()).unwrap();
/// context.shutdown().unwrap();
/// ```
pub struct StorageContext {
    config: StorageConfig,
    root: PathBuf,
    cache: Arc<PageCache>,
    workers: Mutex<Option<WorkerPool>>,
    consumers: Mutex<Vec<BackgroundWorkerHandle>>,
}

impl StorageContext {
    /// Validate `config`, map the arena and start the background threads.
    ///
    /// # Errors
    /// `Error::InvalidConfig` for bad settings, `Error::Io` if `root`
    /// cannot be created.
    pub fn new(config: StorageConfig, root: impl AsRef<Path>) -> Result<Self> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let shm = Arc::new(SharedMemory::new(config.shm_size)?);
        let cache = Arc::new(PageCache::new(&config, shm)?);
        let workers = WorkerPool::new(EVICTION_WORKERS, "setstore-evict")?;
        let consumers = (0..config.num_flush_threads)
            .map(|i| FlushConsumer::new(Arc::clone(&cache), i as PartitionId).start())
            .collect();

        info!(
            "storage context at {} with {} flush consumers",
            root.display(),
            config.num_flush_threads
        );
        Ok(Self {
            config,
            root,
            cache,
            workers: Mutex::new(Some(workers)),
            consumers: Mutex::new(consumers),
        })
    }

    // ========================================================================
    // Sets
    // ========================================================================

    /// Create a partitioned user set, replacing any existing one with the
    /// same key, and start a job over it with `options`' policy.
    pub fn create_user_set(
        &self,
        set_key: SetKey,
        name: &str,
        options: LocalityOptions,
    ) -> Result<Arc<UserSet>> {
        let dir = self.set_dir(set_key);
        fs::create_dir_all(&dir)?;
        let data_paths = (0..self.config.num_flush_threads)
            .map(|i| dir.join(format!("data.{}", i)))
            .collect();
        let file = PartitionedFile::create(
            set_key,
            self.config.node_id,
            dir.join("meta"),
            data_paths,
            self.config.page_size,
            self.config.io_mode,
        )?;
        self.wire_user_set(file.into(), name, options)
    }

    /// Reopen a partitioned user set from its metadata.
    ///
    /// # Errors
    /// `Error::CorruptedMetadata` if the meta partition cannot be parsed.
    pub fn open_user_set(
        &self,
        set_key: SetKey,
        name: &str,
        options: LocalityOptions,
    ) -> Result<Arc<UserSet>> {
        let meta_path = self.set_dir(set_key).join("meta");
        let file = PartitionedFile::open(set_key, self.config.node_id, meta_path, self.config.io_mode)?;
        if file.page_size() != self.config.page_size {
            return Err(Error::InvalidConfig(format!(
                "set {} uses pages of {} bytes, the cache {}",
                set_key,
                file.page_size(),
                self.config.page_size
            )));
        }
        self.wire_user_set(file.into(), name, options)
    }

    /// Open (or create) a user set stored as a sequence file.
    pub fn open_sequence_set(
        &self,
        set_key: SetKey,
        name: &str,
        options: LocalityOptions,
    ) -> Result<Arc<UserSet>> {
        let path = self.root.join(format!("{}.seq", Self::set_name(set_key)));
        let file = SequenceFile::open(set_key, self.config.node_id, path, self.config.page_size)?;
        self.wire_user_set(file.into(), name, options)
    }

    fn wire_user_set(&self, file: PdbFile, name: &str, options: LocalityOptions) -> Result<Arc<UserSet>> {
        let set = UserSet::new(Arc::clone(&self.cache), file, name, options)?;
        set.pin(options.policy, options.operation);
        Ok(set)
    }

    /// Create a scratch file set.
    pub fn create_file_set(&self, set_key: SetKey) -> Result<FileSet> {
        let path = self.root.join(format!("{}.scratch", Self::set_name(set_key)));
        FileSet::create(Arc::clone(&self.cache), set_key, path)
    }

    fn set_dir(&self, set_key: SetKey) -> PathBuf {
        self.root.join(Self::set_name(set_key))
    }

    fn set_name(set_key: SetKey) -> String {
        format!("{}_{}_{}", set_key.db_id, set_key.type_id, set_key.set_id)
    }

    // ========================================================================
    // Background work
    // ========================================================================

    /// Run one eviction pass on the worker pool.
    ///
    /// The job only holds a weak reference; a cache dropped before the job
    /// runs is not kept alive by it.
    pub fn run_eviction(&self) -> Result<()> {
        let cache = Arc::downgrade(&self.cache);
        let workers = self.workers.lock();
        let pool = workers
            .as_ref()
            .ok_or_else(|| Error::Worker("storage context is shut down".to_string()))?;
        pool.execute(move || {
            if let Some(cache) = cache.upgrade() {
                cache.evict();
            }
        })
    }

    /// Write every dirty page back, stop the flush consumers and join all
    /// background threads. Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        let consumers: Vec<_> = std::mem::take(&mut *self.consumers.lock());
        let pool = self.workers.lock().take();
        if consumers.is_empty() && pool.is_none() {
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(mut pool) = pool {
            if let Err(e) = pool.shutdown() {
                result = Err(e);
            }
        }

        let queued = self.cache.unpin_and_evict_all_dirty_pages();
        info!("shutting down, {} dirty pages queued", queued);
        for consumer in consumers {
            if let Err(e) = consumer.shutdown().and_then(|()| consumer.join()) {
                warn!("{}", e);
                result = Err(e);
            }
        }
        // whatever the consumers missed
        let leftover = FlushConsumer::new(Arc::clone(&self.cache), 0).flush_pending();
        if leftover > 0 {
            info!("flushed {} pages after the consumers stopped", leftover);
        }
        info!("storage context stopped: {}", self.cache.stats().snapshot());
        result
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn shared_memory(&self) -> &Arc<SharedMemory> {
        self.cache.shared_memory()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for StorageContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("failed to shut down storage context: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PageId;
    use tempfile::tempdir;

    fn config() -> StorageConfig {
        StorageConfig {
            page_size: 512,
            shm_size: 64 * 512,
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            page_size: 100,
            ..config()
        };
        assert!(matches!(
            StorageContext::new(config, dir.path()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_shutdown_persists_dirty_pages() {
        let dir = tempdir().unwrap();
        let set_key = SetKey::new(1, 1, 1);
        {
            let context = StorageContext::new(config(), dir.path()).unwrap();
            let set = context
                .create_user_set(set_key, "numbers", LocalityOptions::default())
                .unwrap();
            for _ in 0..3 {
                set.add_page().unwrap();
            }
            context.shutdown().unwrap();
            assert_eq!(set.file().num_flushed_pages(), 3);
            context.shutdown().unwrap();
        }

        let context = StorageContext::new(config(), dir.path()).unwrap();
        let set = context
            .open_user_set(set_key, "numbers", LocalityOptions::default())
            .unwrap();
        assert_eq!(set.last_flushed_page_id(), PageId::new(2));
        assert_eq!(set.num_pages(), 3);
    }

    #[test]
    fn test_run_eviction_after_shutdown_fails() {
        let dir = tempdir().unwrap();
        let context = StorageContext::new(config(), dir.path()).unwrap();
        context.run_eviction().unwrap();
        context.shutdown().unwrap();
        assert!(matches!(context.run_eviction(), Err(Error::Worker(_))));
    }

    #[test]
    fn test_open_missing_set_fails() {
        let dir = tempdir().unwrap();
        let context = StorageContext::new(config(), dir.path()).unwrap();
        assert!(context
            .open_user_set(SetKey::new(5, 5, 5), "missing", LocalityOptions::default())
            .is_err());
    }
}
