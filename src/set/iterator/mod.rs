//! Page iterators.
//!
//! Every iterator is a two-state machine, `Ready` until its cursor reaches
//! its bound and `Exhausted` after. [`PageIterator::has_next`] only looks at
//! the cursor; [`PageIterator::next`] advances it and hands out a page that
//! is referenced in the cache. The caller releases it with
//! [`PageCache::dec_page_ref_count`](crate::buffer::PageCache::dec_page_ref_count).

mod file_set;
mod partition;
mod set_cache;

pub use file_set::FileSetPageIterator;
pub use partition::PartitionPageIterator;
pub use set_cache::SetCachePageIterator;

use crate::storage::page::PageHandle;

/// A cursor over pages.
pub trait PageIterator: Send {
    /// Whether the cursor has not reached its bound yet.
    fn has_next(&self) -> bool;

    /// Advance and return the next page, `None` once exhausted or if the
    /// page could not be produced.
    fn next(&mut self) -> Option<PageHandle>;
}
