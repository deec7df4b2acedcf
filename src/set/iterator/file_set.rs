use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use log::error;

use crate::buffer::PageCache;
use crate::common::{NodeId, PageId, SetKey};
use crate::set::iterator::PageIterator;
use crate::storage::page::PageHandle;

/// Reads a [`FileSet`](crate::set::FileSet) front to back, caching each page
/// as it goes.
pub struct FileSetPageIterator {
    cache: Arc<PageCache>,
    reader: BufReader<File>,
    set_key: SetKey,
    node_id: NodeId,
    page_size: usize,
    num_pages: u32,
    cursor: u32,
}

impl FileSetPageIterator {
    pub(crate) fn new(
        cache: Arc<PageCache>,
        reader: BufReader<File>,
        set_key: SetKey,
        node_id: NodeId,
        page_size: usize,
        num_pages: u32,
    ) -> Self {
        Self {
            cache,
            reader,
            set_key,
            node_id,
            page_size,
            num_pages,
            cursor: 0,
        }
    }
}

impl PageIterator for FileSetPageIterator {
    fn has_next(&self) -> bool {
        self.cursor < self.num_pages
    }

    fn next(&mut self) -> Option<PageHandle> {
        if !self.has_next() {
            return None;
        }
        let key = self.set_key.page(PageId::new(self.cursor));
        self.cursor += 1;
        match self.cache.build_and_cache_page_from_reader(
            &mut self.reader,
            self.page_size,
            self.node_id,
            key,
            None,
        ) {
            Ok(page) => Some(page),
            Err(e) => {
                // the reader position is unknown now
                error!("failed to read page {} of file set: {}", key, e);
                self.cursor = self.num_pages;
                None
            }
        }
    }
}
