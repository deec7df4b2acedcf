//! setstore - A shared-memory page cache with partitioned set storage.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        StorageContext                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │                  Sets (set/)                             │   │
//! │  │     UserSet + FileSet + page iterators                   │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │                Page Cache (buffer/)                      │   │
//! │  │   ┌─────────────────────────────────────────────────┐   │   │
//! │  │   │  Eviction: unified MRU | unified LRU | priority  │   │   │
//! │  │   │        buckets of locality sets                  │   │   │
//! │  │   └─────────────────────────────────────────────────┘   │   │
//! │  │      PageCache + LocalitySet + flush pipeline            │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                 ↓                              ↓                │
//! │  ┌──────────────────────────┐  ┌──────────────────────────┐    │
//! │  │   Memory (memory/)       │  │   Storage (storage/)     │    │
//! │  │   SharedMemory arena     │  │   Page + PdbFile         │    │
//! │  └──────────────────────────┘  └──────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Shared primitives (ids, Error, config)
//! - [`memory`] - The shared-memory arena pages live in
//! - [`storage`] - Page layout and the partitioned/sequence file formats
//! - [`buffer`] - Page cache, locality sets, eviction and flushing
//! - [`set`] - User sets, file sets and page iterators
//! - [`context`] - One storage engine instance and its threads
//! - [`worker`] - Background thread plumbing
//!
//! # Quick Start
//! ```no_run
//! use setstore::{LocalityOptions, PageIterator, SetKey, StorageConfig, StorageContext};
//!
//! let context = StorageContext::new(StorageConfig::default(), "/tmp/setstore").unwrap();
//! let set = context
//!     .create_user_set(SetKey::new(1, 1, 1), "events", LocalityOptions::default())
//!     .unwrap();
//!
//! // Append a record
//! let slot = set.get_new_bytes(5, false).unwrap();
//! slot.write(b"hello").unwrap();
//! set.unpin_buffer_page();
//!
//! // Scan every page of the set
//! for mut pages in set.get_iterators() {
//!     while let Some(page) = pages.next() {
//!         context.cache().dec_page_ref_count(page.key());
//!     }
//! }
//! ```

pub mod buffer;
pub mod common;
pub mod context;
pub mod memory;
pub mod set;
pub mod storage;
pub mod worker;

// Re-export commonly used items at crate root for convenience
pub use common::config::{CacheStrategy, IoMode, StorageConfig, DEFAULT_PAGE_SIZE};
pub use common::{CacheKey, Error, PageId, PageIndex, Result, SetKey};

pub use buffer::{
    CacheStats, DurabilityType, LocalitySet, LocalityType, OperationType, PageCache,
    PersistenceType, ReplacementPolicy, StatsSnapshot,
};
pub use context::StorageContext;
pub use memory::SharedMemory;
pub use set::{FileSet, LocalityOptions, PageIterator, UserSet};
pub use storage::page::{Page, PageHandle, PageHeader};
pub use storage::{PartitionedFile, PdbFile, SequenceFile};
