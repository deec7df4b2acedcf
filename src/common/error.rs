//! Error types for the storage engine.

use thiserror::Error;

use crate::common::{CacheKey, PartitionId};

/// Convenient Result type alias.
///
/// Instead of writing `Result<T, Error>` everywhere, we can write `Result<T>`.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors produced by the page cache, the file backends and the sets.
///
/// The cache boundary keeps the sentinel contract (`Option`/`bool`) for
/// contract violations; the file layer and constructors return these.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from a data or meta partition.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `get_new_page` was called for a key that is already cached.
    #[error("page {0} is already cached")]
    DuplicatePage(CacheKey),

    /// The key is not present in the cache.
    #[error("page {0} is not cached")]
    PageNotCached(CacheKey),

    /// The page's shared-memory buffer has already been freed.
    #[error("page {0} has released its buffer")]
    PageReleased(CacheKey),

    /// The shared-memory arena cannot satisfy the request even after eviction.
    #[error("shared memory exhausted: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    /// The metadata header is truncated or inconsistent.
    ///
    /// The header is the only record of page placement, so a file that hits
    /// this is never constructed.
    #[error("corrupted metadata: {0}")]
    CorruptedMetadata(String),

    /// The file has been cleared and no longer accepts I/O.
    #[error("file has been cleared")]
    FileCleared,

    /// No data partition with this id.
    #[error("invalid partition {0}")]
    InvalidPartition(PartitionId),

    /// The position lies past the end of the partition.
    #[error("page at partition {partition}, seq {seq} is out of range")]
    PageOutOfRange { partition: PartitionId, seq: u32 },

    /// A record does not fit into an empty page.
    #[error("record of {requested} bytes exceeds page capacity {capacity}")]
    RecordTooLarge { requested: usize, capacity: usize },

    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A background worker could not be stopped or joined.
    #[error("background worker: {0}")]
    Worker(String),
}
