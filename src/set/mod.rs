//! Sets - the logical collections of pages that clients read and write.
//!
//! - [`UserSet`] - A persistent set backed by a partitioned or sequence file
//! - [`FileSet`] - A flat scratch file of fixed-size pages
//! - [`iterator`] - Page iterators over cached, flushed and scratch pages

pub mod file_set;
pub mod iterator;
pub mod user_set;

pub use file_set::FileSet;
pub use iterator::{FileSetPageIterator, PageIterator, PartitionPageIterator, SetCachePageIterator};
pub use user_set::{DirtyPageEntry, LocalityOptions, RecordSlot, UserSet};
