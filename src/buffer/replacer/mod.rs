//! Eviction strategies (replacers).
//!
//! One [`EvictionStrategy`] is chosen when the cache is built:
//! - [`GlobalAccessOrder`] - Orders every evictable page by access sequence (MRU or LRU)
//! - [`PriorityLocalitySets`] - Walks locality sets in priority order and lets
//!   each set pick its own victims
//!
//! Both run inside `PageCache::evict`, which already holds the eviction
//! mutex. A strategy takes the eviction write lock only while scanning and
//! releases it before handing victims to `PageCache::evict_page`.

mod global;
mod priority;

pub use global::GlobalAccessOrder;
pub use priority::{PriorityBuckets, PriorityLevel, PriorityLocalitySets};

use crate::buffer::PageCache;
use crate::common::config::CacheStrategy;

/// A policy for choosing and evicting victims.
pub trait EvictionStrategy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Run one eviction pass. Returns the number of pages evicted or handed
    /// to the flush pipeline.
    fn evict(&self, cache: &PageCache) -> usize;
}

/// Build the strategy for a configured [`CacheStrategy`].
pub fn for_strategy(strategy: CacheStrategy) -> Box<dyn EvictionStrategy> {
    match strategy {
        CacheStrategy::UnifiedMru => Box::new(GlobalAccessOrder::mru()),
        CacheStrategy::UnifiedLru => Box::new(GlobalAccessOrder::lru()),
        CacheStrategy::UnifiedIntelligent => Box::new(PriorityLocalitySets),
    }
}
