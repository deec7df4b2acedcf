use std::sync::Arc;

use log::warn;

use crate::common::{PageIndex, PartitionId};
use crate::set::iterator::PageIterator;
use crate::set::UserSet;
use crate::storage::page::PageHandle;

/// Walks one data partition of a set's file in storage order.
///
/// The bound is the partition's page count when the iterator is built;
/// pages flushed later are not visited.
pub struct PartitionPageIterator {
    set: Arc<UserSet>,
    partition_id: PartitionId,
    num_pages: u32,
    cursor: u32,
}

impl PartitionPageIterator {
    pub fn new(set: Arc<UserSet>, partition_id: PartitionId) -> Self {
        let num_pages = set.file().partition_num_pages(partition_id).unwrap_or(0);
        Self {
            set,
            partition_id,
            num_pages,
            cursor: 0,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }
}

impl PageIterator for PartitionPageIterator {
    fn has_next(&self) -> bool {
        self.cursor < self.num_pages
    }

    fn next(&mut self) -> Option<PageHandle> {
        if !self.has_next() {
            return None;
        }
        let location = PageIndex::new(self.partition_id, self.cursor);
        self.cursor += 1;

        let file = self.set.file();
        let Some(page_id) = file.page_id_at(location) else {
            warn!("no page recorded at {} of set {}", location, self.set.set_key());
            return None;
        };
        self.set
            .cache()
            .get_page(file, Some(location), page_id, true, Some(self.set.locality()))
    }
}
