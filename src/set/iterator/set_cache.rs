use std::sync::Arc;

use crate::common::{PageId, PageIndex};
use crate::set::iterator::PageIterator;
use crate::set::UserSet;
use crate::storage::page::PageHandle;

enum Step {
    /// The entry is gone; move on.
    Skip,
    /// Still cached; the lookup already happened under the locks.
    Cached(Option<PageHandle>),
    /// Written out since the iterator was built.
    Flushed(Option<PageIndex>),
}

/// Walks the dirty-page map of a set.
///
/// Each step looks the entry up under the cache's flush read lock and the
/// set's dirty-map lock, so a flush cannot move a page between the cache
/// and the file mid-step. A page that was flushed meanwhile is loaded back
/// from its partition and its entry dropped.
pub struct SetCachePageIterator {
    set: Arc<UserSet>,
    page_ids: Vec<PageId>,
    cursor: usize,
}

impl SetCachePageIterator {
    pub fn new(set: Arc<UserSet>, page_ids: Vec<PageId>) -> Self {
        Self {
            set,
            page_ids,
            cursor: 0,
        }
    }

    fn step(&self, page_id: PageId) -> Step {
        let cache = self.set.cache();
        let _flush = cache.flush_lock();
        let dirty = self.set.dirty_pages();
        match dirty.get(page_id) {
            None => Step::Skip,
            Some(entry) if entry.in_cache => Step::Cached(
                cache.get_cached_page(self.set.set_key().page(page_id), Some(self.set.locality())),
            ),
            Some(entry) => Step::Flushed(entry.location),
        }
    }
}

impl PageIterator for SetCachePageIterator {
    fn has_next(&self) -> bool {
        self.cursor < self.page_ids.len()
    }

    fn next(&mut self) -> Option<PageHandle> {
        while self.has_next() {
            let page_id = self.page_ids[self.cursor];
            self.cursor += 1;
            match self.step(page_id) {
                Step::Skip => continue,
                Step::Cached(page) => return page,
                Step::Flushed(location) => {
                    let page = self.set.get_page(location, page_id);
                    self.set.dirty_pages().remove(page_id);
                    return page;
                }
            }
        }
        None
    }
}
