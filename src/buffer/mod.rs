//! Page cache management.
//!
//! The page cache is the in-memory layer between sets and their files. It
//! keeps pages of every set in one shared-memory arena and evicts them
//! under memory pressure.
//!
//! # Components
//! - [`PageCache`] - The main page cache
//! - [`LocalitySet`] - A group of pages sharing one eviction policy
//! - [`flush`] - Dirty page write-back (queue, consumers, targets)
//! - [`replacer`] - Eviction strategy implementations
//! - [`CacheStats`] - Performance statistics

pub mod flush;
pub mod locality_set;
mod page_cache;
pub mod replacer;
mod stats;

pub use flush::{FlushConsumer, FlushQueue, FlushTarget};
pub use locality_set::{
    DurabilityType, LocalitySet, LocalityType, OperationType, PersistenceType, ReplacementPolicy,
};
pub use page_cache::PageCache;
pub use stats::{CacheStats, StatsSnapshot};
