//! Identity types for cached and persisted pages.

use std::fmt;

use crate::common::PageId;

/// Identifies a node in the cluster.
pub type NodeId = u32;
/// Identifies a database.
pub type DatabaseId = u32;
/// Identifies the user type stored in a set.
pub type UserTypeId = u32;
/// Identifies a set within a database and type.
pub type SetId = u32;
/// Identifies a data partition of a partitioned file.
pub type PartitionId = u32;

/// Identity of a set: (database, type, set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetKey {
    pub db_id: DatabaseId,
    pub type_id: UserTypeId,
    pub set_id: SetId,
}

impl SetKey {
    pub fn new(db_id: DatabaseId, type_id: UserTypeId, set_id: SetId) -> Self {
        Self {
            db_id,
            type_id,
            set_id,
        }
    }

    /// Key of page `page_id` inside this set.
    #[inline]
    pub fn page(&self, page_id: PageId) -> CacheKey {
        CacheKey {
            db_id: self.db_id,
            type_id: self.type_id,
            set_id: self.set_id,
            page_id,
        }
    }

    /// Scratch sets whose pages are never worth writing back.
    ///
    /// Database 0 holds the intermediate data of jobs; type 1 and 2 there are
    /// shuffle and aggregation scratch space.
    #[inline]
    pub fn is_temporary(&self) -> bool {
        self.db_id == 0 && (self.type_id == 1 || self.type_id == 2)
    }
}

impl fmt::Display for SetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.db_id, self.type_id, self.set_id)
    }
}

/// The unique key of a page in the page cache.
///
/// At most one cached page exists per key at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub db_id: DatabaseId,
    pub type_id: UserTypeId,
    pub set_id: SetId,
    pub page_id: PageId,
}

impl CacheKey {
    pub fn new(db_id: DatabaseId, type_id: UserTypeId, set_id: SetId, page_id: PageId) -> Self {
        Self {
            db_id,
            type_id,
            set_id,
            page_id,
        }
    }

    /// The set this page belongs to.
    #[inline]
    pub fn set_key(&self) -> SetKey {
        SetKey::new(self.db_id, self.type_id, self.set_id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}:{}:{}, {})",
            self.db_id, self.type_id, self.set_id, self.page_id
        )
    }
}

/// On-disk coordinate of a flushed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageIndex {
    pub partition_id: PartitionId,
    pub seq_in_partition: u32,
}

impl PageIndex {
    pub fn new(partition_id: PartitionId, seq_in_partition: u32) -> Self {
        Self {
            partition_id,
            seq_in_partition,
        }
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.partition_id, self.seq_in_partition)
    }
}
