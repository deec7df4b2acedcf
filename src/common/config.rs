//! Configuration for the storage engine.

use crate::common::{Error, NodeId, Result};

/// Default size of a page in bytes (4KB).
///
/// Matches the OS page size on most systems and keeps pages sector-aligned
/// for direct I/O.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Alignment of every buffer handed out by the shared-memory arena.
///
/// `O_DIRECT` requires buffers, offsets and lengths aligned to the logical
/// sector size; 512 covers every device we run on.
pub const SHM_ALIGNMENT: usize = 512;

/// Default size of the shared-memory arena (64MB).
pub const DEFAULT_SHM_SIZE: usize = 64 * 1024 * 1024;

/// Number of max-size pages always left free below the eviction target.
pub const EVICTION_HEADROOM_PAGES: usize = 6;

/// Sentinel for "no id", shared by page ids and the latest-page field of
/// file metadata.
pub const INVALID_ID: u32 = u32::MAX;

/// Which eviction driver the page cache runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Global priority queue over all evictable pages, most recent first.
    #[default]
    UnifiedMru,
    /// Global priority queue over all evictable pages, least recent first.
    UnifiedLru,
    /// Six priority buckets of locality sets, each picking its own victims.
    UnifiedIntelligent,
}

/// How a file talks to its partitions. Fixed for the file's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Buffered through the OS page cache.
    #[default]
    Buffered,
    /// `O_DIRECT` where the platform supports it.
    Direct,
}

/// Settings for one storage context.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Node this storage engine runs on; stamped into every page header.
    pub node_id: NodeId,
    /// Size of a regular page in bytes.
    pub page_size: usize,
    /// Size of the shared-memory arena in bytes.
    pub shm_size: usize,
    /// Fraction of the arena at which the cache starts warning.
    pub warn_threshold: f64,
    /// Fraction of the arena eviction brings the cache back under.
    pub evict_stop_threshold: f64,
    pub strategy: CacheStrategy,
    pub io_mode: IoMode,
    /// Number of flush consumers draining the flush queue.
    pub num_flush_threads: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            page_size: DEFAULT_PAGE_SIZE,
            shm_size: DEFAULT_SHM_SIZE,
            warn_threshold: 0.9,
            evict_stop_threshold: 0.9,
            strategy: CacheStrategy::default(),
            io_mode: IoMode::default(),
            num_flush_threads: 2,
        }
    }
}

impl StorageConfig {
    /// Check the settings before anything is allocated.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` describing the first bad setting.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size % SHM_ALIGNMENT != 0 {
            return Err(Error::InvalidConfig(format!(
                "page size {} is not a non-zero multiple of {}",
                self.page_size, SHM_ALIGNMENT
            )));
        }
        if self.shm_size < self.page_size * (EVICTION_HEADROOM_PAGES + 2) {
            return Err(Error::InvalidConfig(format!(
                "shared memory of {} bytes cannot hold {} pages of {} bytes",
                self.shm_size,
                EVICTION_HEADROOM_PAGES + 2,
                self.page_size
            )));
        }
        for (name, value) in [
            ("warn_threshold", self.warn_threshold),
            ("evict_stop_threshold", self.evict_stop_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::InvalidConfig(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.num_flush_threads == 0 {
            return Err(Error::InvalidConfig(
                "at least one flush thread is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Page-count watermarks derived from this configuration.
    pub fn sizing(&self) -> CacheSizing {
        CacheSizing::new(
            self.shm_size,
            self.page_size,
            self.warn_threshold,
            self.evict_stop_threshold,
        )
    }
}

/// Cache watermarks, counted in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSizing {
    /// Pages the arena can hold.
    pub max_pages: usize,
    /// Page count at which the cache logs a warning.
    pub warn_size: usize,
    /// Page count eviction drives the cache under.
    pub evict_stop_size: usize,
}

impl CacheSizing {
    pub fn new(shm_size: usize, page_size: usize, warn: f64, evict_stop: f64) -> Self {
        let max_pages = if page_size == 0 { 0 } else { shm_size / page_size };
        let warn_size = (max_pages as f64 * warn) as usize;
        let mut evict_stop_size = (max_pages as f64 * evict_stop) as usize;
        if evict_stop_size + EVICTION_HEADROOM_PAGES > max_pages {
            evict_stop_size = max_pages.saturating_sub(EVICTION_HEADROOM_PAGES).max(1);
        }
        Self {
            max_pages,
            warn_size,
            evict_stop_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_sector_aligned() {
        assert!(DEFAULT_PAGE_SIZE.is_power_of_two());
        assert_eq!(DEFAULT_PAGE_SIZE % SHM_ALIGNMENT, 0);
    }

    #[test]
    fn test_default_config_is_valid() {
        StorageConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unaligned_page_size() {
        let config = StorageConfig {
            page_size: 1000,
            ..StorageConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_tiny_arena() {
        let config = StorageConfig {
            shm_size: 4 * DEFAULT_PAGE_SIZE,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let config = StorageConfig {
            evict_stop_threshold: 1.5,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());

        let config = StorageConfig {
            warn_threshold: 0.0,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sizing_defaults() {
        let sizing = CacheSizing::new(1000 * 4096, 4096, 0.9, 0.9);
        assert_eq!(sizing.max_pages, 1000);
        assert_eq!(sizing.warn_size, 900);
        assert_eq!(sizing.evict_stop_size, 900);
    }

    #[test]
    fn test_sizing_keeps_headroom() {
        // 0.9 * 20 = 18 leaves only 2 free pages
        let sizing = CacheSizing::new(20 * 4096, 4096, 0.9, 0.9);
        assert_eq!(sizing.max_pages, 20);
        assert_eq!(sizing.evict_stop_size, 14);

        let sizing = CacheSizing::new(4 * 4096, 4096, 0.9, 0.9);
        assert_eq!(sizing.evict_stop_size, 1);
    }
}
