//! Storage layer - cached pages and the files that persist them.
//!
//! - [`page`] - Page layout, bookkeeping and byte guards
//! - [`file`] - Partitioned and sequence file backends

pub mod file;
pub mod page;

pub use file::{FileType, PartitionedFile, PdbFile, SequenceFile};
pub use page::{Page, PageHandle, PageHeader};
