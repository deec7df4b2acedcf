//! Persistence backends for sets.
//!
//! - [`PartitionedFile`] - Pages spread over N data partitions + a meta partition
//! - [`SequenceFile`] - Legacy single file of `[page][page id]` records
//! - [`PdbFile`] - The closed set of backends the cache works with

mod handle;
mod meta;
mod partitioned;
mod sequence;

pub use handle::is_direct_unsupported;
pub use meta::{FileType, PartitionMeta, PartitionedFileMetaData, META_VERSION};
pub use partitioned::PartitionedFile;
pub use sequence::SequenceFile;

pub(crate) use handle::PageFileHandle;

use crate::common::{NodeId, PageId, PageIndex, PartitionId, Result, SetKey};

/// A set's file: one of the two on-disk formats.
///
/// Matched exhaustively wherever the formats differ (page loading,
/// placement lookups, metadata).
pub enum PdbFile {
    Partitioned(PartitionedFile),
    Sequence(SequenceFile),
}

impl PdbFile {
    pub fn file_type(&self) -> FileType {
        match self {
            PdbFile::Partitioned(_) => FileType::Partitioned,
            PdbFile::Sequence(_) => FileType::Sequence,
        }
    }

    pub fn set_key(&self) -> SetKey {
        match self {
            PdbFile::Partitioned(f) => f.set_key(),
            PdbFile::Sequence(f) => f.set_key(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        match self {
            PdbFile::Partitioned(f) => f.node_id(),
            PdbFile::Sequence(f) => f.node_id(),
        }
    }

    pub fn open_all(&self) -> Result<()> {
        match self {
            PdbFile::Partitioned(f) => f.open_all(),
            PdbFile::Sequence(f) => f.open_all(),
        }
    }

    pub fn close_all(&self) {
        match self {
            PdbFile::Partitioned(f) => f.close_all(),
            PdbFile::Sequence(f) => f.close_all(),
        }
    }

    pub fn clear(&self) -> Result<()> {
        match self {
            PdbFile::Partitioned(f) => f.clear(),
            PdbFile::Sequence(f) => f.clear(),
        }
    }

    /// Append a page; returns its sequence number in the partition.
    ///
    /// A sequence file has a single partition and ignores `partition_id`.
    pub fn append_page(&self, partition_id: PartitionId, page_id: PageId, bytes: &[u8]) -> Result<u32> {
        match self {
            PdbFile::Partitioned(f) => f.append_page(partition_id, page_id, bytes),
            PdbFile::Sequence(f) => f.append_page(page_id, bytes),
        }
    }

    /// Read the page at `(partition_id, seq)`.
    ///
    /// A sequence file stores page `n` at position `n`, so `seq` is the page
    /// id there.
    pub fn load_page(&self, partition_id: PartitionId, seq: u32, buf: &mut [u8]) -> Result<usize> {
        match self {
            PdbFile::Partitioned(f) => f.load_page(partition_id, seq, buf),
            PdbFile::Sequence(f) => f.load_page(PageId::new(seq), buf),
        }
    }

    /// Like [`PdbFile::load_page`], for in-order scans of one partition.
    pub fn load_page_sequential(&self, partition_id: PartitionId, seq: u32, buf: &mut [u8]) -> Result<usize> {
        match self {
            PdbFile::Partitioned(f) => f.load_page_sequential(partition_id, seq, buf),
            PdbFile::Sequence(f) => f.load_page(PageId::new(seq), buf),
        }
    }

    pub fn write_meta(&self) -> Result<()> {
        match self {
            PdbFile::Partitioned(f) => f.write_meta(),
            // the header never changes after creation
            PdbFile::Sequence(_) => Ok(()),
        }
    }

    pub fn update_meta(&self) -> Result<()> {
        match self {
            PdbFile::Partitioned(f) => f.update_meta(),
            PdbFile::Sequence(_) => Ok(()),
        }
    }

    pub fn get_and_set_num_flushed_pages(&self) -> Result<u32> {
        match self {
            PdbFile::Partitioned(f) => f.get_and_set_num_flushed_pages(),
            PdbFile::Sequence(f) => f.get_and_set_num_flushed_pages(),
        }
    }

    pub fn num_flushed_pages(&self) -> u32 {
        match self {
            PdbFile::Partitioned(f) => f.num_flushed_pages(),
            PdbFile::Sequence(f) => f.num_flushed_pages(),
        }
    }

    /// Highest page id on disk, `PageId::INVALID` if none.
    pub fn latest_page_id(&self) -> PageId {
        match self {
            PdbFile::Partitioned(f) => f.latest_page_id(),
            PdbFile::Sequence(f) => f.last_flushed_page_id(),
        }
    }

    /// Id of the last flushed page, `PageId::INVALID` if none.
    pub fn last_flushed_page_id(&self) -> PageId {
        self.latest_page_id()
    }

    pub fn page_size(&self) -> usize {
        match self {
            PdbFile::Partitioned(f) => f.page_size(),
            PdbFile::Sequence(f) => f.page_size(),
        }
    }

    pub fn page_size_in_meta(&self) -> Result<usize> {
        match self {
            PdbFile::Partitioned(f) => f.page_size_in_meta(),
            PdbFile::Sequence(f) => f.page_size_in_meta(),
        }
    }

    pub fn num_partitions(&self) -> usize {
        match self {
            PdbFile::Partitioned(f) => f.num_partitions(),
            PdbFile::Sequence(_) => 1,
        }
    }

    /// Pages stored in one partition, `None` for an unknown partition.
    pub fn partition_num_pages(&self, partition_id: PartitionId) -> Option<u32> {
        match self {
            PdbFile::Partitioned(f) => f.partition_num_pages(partition_id),
            PdbFile::Sequence(f) => (partition_id == 0).then(|| f.num_flushed_pages()),
        }
    }

    /// On-disk coordinate of a flushed page.
    pub fn page_index(&self, page_id: PageId) -> Option<PageIndex> {
        match self {
            PdbFile::Partitioned(f) => f.page_index(page_id),
            PdbFile::Sequence(f) => {
                let last = f.last_flushed_page_id();
                (last.is_valid() && page_id <= last).then(|| PageIndex::new(0, page_id.0))
            }
        }
    }

    /// Page stored at a coordinate.
    pub fn page_id_at(&self, index: PageIndex) -> Option<PageId> {
        match self {
            PdbFile::Partitioned(f) => f.page_id_at(index),
            PdbFile::Sequence(f) => {
                let last = f.last_flushed_page_id();
                let page_id = PageId::new(index.seq_in_partition);
                (index.partition_id == 0 && last.is_valid() && page_id <= last).then_some(page_id)
            }
        }
    }

    pub fn is_cleared(&self) -> bool {
        match self {
            PdbFile::Partitioned(f) => f.is_cleared(),
            PdbFile::Sequence(f) => f.is_cleared(),
        }
    }
}

impl From<PartitionedFile> for PdbFile {
    fn from(file: PartitionedFile) -> Self {
        PdbFile::Partitioned(file)
    }
}

impl From<SequenceFile> for PdbFile {
    fn from(file: SequenceFile) -> Self {
        PdbFile::Sequence(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::IoMode;
    use tempfile::tempdir;

    #[test]
    fn test_sequence_file_placement() {
        let dir = tempdir().unwrap();
        let file: PdbFile = SequenceFile::open(SetKey::new(1, 1, 1), 0, dir.path().join("seq"), 512)
            .unwrap()
            .into();
        file.append_page(9, PageId::new(0), &[1u8; 512]).unwrap();
        file.append_page(9, PageId::new(1), &[2u8; 512]).unwrap();

        assert_eq!(file.file_type(), FileType::Sequence);
        assert_eq!(file.num_partitions(), 1);
        assert_eq!(file.partition_num_pages(0), Some(2));
        assert_eq!(file.page_index(PageId::new(1)), Some(PageIndex::new(0, 1)));
        assert_eq!(file.page_index(PageId::new(2)), None);
        assert_eq!(file.page_id_at(PageIndex::new(0, 1)), Some(PageId::new(1)));

        let mut buf = [0u8; 512];
        file.load_page(0, 1, &mut buf).unwrap();
        assert_eq!(buf[0], 2);
        file.write_meta().unwrap();
    }

    #[test]
    fn test_partitioned_file_dispatch() {
        let dir = tempdir().unwrap();
        let file: PdbFile = PartitionedFile::create(
            SetKey::new(1, 1, 1),
            0,
            dir.path().join("meta"),
            vec![dir.path().join("d0"), dir.path().join("d1")],
            512,
            IoMode::Buffered,
        )
        .unwrap()
        .into();

        assert_eq!(file.file_type(), FileType::Partitioned);
        assert_eq!(file.append_page(1, PageId::new(3), &[0u8; 512]).unwrap(), 0);
        assert_eq!(file.latest_page_id(), PageId::new(3));
        assert_eq!(file.page_index(PageId::new(3)), Some(PageIndex::new(1, 0)));
        assert_eq!(file.page_size_in_meta().unwrap(), 512);
    }
}
