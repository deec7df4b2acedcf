//! Metadata of a partitioned file and its binary header.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::common::config::INVALID_ID;
use crate::common::{Error, PageId, PageIndex, PartitionId, Result};

/// Current version of the meta header.
pub const META_VERSION: u16 = 1;

/// Tag identifying the on-disk format of a file.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Partitioned = 0,
    Sequence = 1,
}

impl FileType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(FileType::Partitioned),
            1 => Some(FileType::Sequence),
            _ => None,
        }
    }
}

/// On-disk value of `latestPageId` before any page was flushed.
pub const NO_LATEST_PAGE: u32 = INVALID_ID;

/// Size of the leading `metaSize` field.
pub const META_SIZE_FIELD: usize = 8;

/// Smallest partition record: id, page count, path length and a lone NUL.
const MIN_PARTITION_RECORD: usize = 4 + 4 + 8 + 1;

/// One `(pageId, partitionId, seq)` entry.
const PAGE_INDEX_RECORD: usize = 12;

/// Byte offsets of the fixed fields, counted from the start of the meta
/// partition.
pub const OFFSET_FILE_TYPE: u64 = 8;
pub const OFFSET_VERSION: u64 = 12;
pub const OFFSET_PAGE_SIZE: u64 = 14;
pub const OFFSET_NUM_FLUSHED_PAGES: u64 = 22;
pub const OFFSET_LATEST_PAGE_ID: u64 = 26;

/// One data partition as recorded in the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMeta {
    pub partition_id: PartitionId,
    pub num_pages: u32,
    pub path: PathBuf,
}

/// In-memory copy of a partitioned file's header.
///
/// # Layout (little-endian, packed)
/// ```text
/// [u64 metaSize]                     bytes that follow this field
/// [u32 fileType]
/// [u16 version]
/// [u64 pageSize]
/// [u32 numFlushedPages]
/// [u32 latestPageId]                 0xFFFFFFFF = none
/// [u32 numPartitions]
///   per partition:  [u32 partitionId][u32 numPages][u64 pathLen][path..., NUL]
///   per page:       [u32 pageId][u32 partitionId][u32 seqInPartition]
/// ```
///
/// Pages are written in page-id order so the same metadata always encodes
/// to the same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionedFileMetaData {
    page_size: usize,
    version: u16,
    num_flushed_pages: u32,
    latest_page_id: PageId,
    partitions: Vec<PartitionMeta>,
    page_indexes: BTreeMap<PageId, PageIndex>,
    page_ids: HashMap<PageIndex, PageId>,
}

impl PartitionedFileMetaData {
    /// Metadata of an empty file whose partitions live at `paths`, in
    /// partition-id order.
    pub fn new(page_size: usize, paths: &[PathBuf]) -> Self {
        let partitions = paths
            .iter()
            .enumerate()
            .map(|(i, path)| PartitionMeta {
                partition_id: i as PartitionId,
                num_pages: 0,
                path: path.clone(),
            })
            .collect();
        Self {
            page_size,
            version: META_VERSION,
            num_flushed_pages: 0,
            latest_page_id: PageId::INVALID,
            partitions,
            page_indexes: BTreeMap::new(),
            page_ids: HashMap::new(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn num_flushed_pages(&self) -> u32 {
        self.num_flushed_pages
    }

    /// Highest page id flushed so far, `PageId::INVALID` if none.
    pub fn latest_page_id(&self) -> PageId {
        self.latest_page_id
    }

    pub fn partitions(&self) -> &[PartitionMeta] {
        &self.partitions
    }

    pub fn partition(&self, partition_id: PartitionId) -> Option<&PartitionMeta> {
        self.partitions.get(partition_id as usize)
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// On-disk coordinate of a flushed page.
    pub fn page_index(&self, page_id: PageId) -> Option<PageIndex> {
        self.page_indexes.get(&page_id).copied()
    }

    /// Page stored at a coordinate.
    pub fn page_id_at(&self, index: PageIndex) -> Option<PageId> {
        self.page_ids.get(&index).copied()
    }

    /// All flushed pages in page-id order.
    pub fn page_indexes(&self) -> impl Iterator<Item = (PageId, PageIndex)> + '_ {
        self.page_indexes.iter().map(|(&id, &index)| (id, index))
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Record a page appended to `partition_id`; returns its sequence number.
    pub fn record_append(&mut self, partition_id: PartitionId, page_id: PageId) -> Result<u32> {
        let partition = self
            .partitions
            .get_mut(partition_id as usize)
            .ok_or(Error::InvalidPartition(partition_id))?;
        let seq = partition.num_pages;
        partition.num_pages += 1;

        let index = PageIndex::new(partition_id, seq);
        if let Some(old) = self.page_indexes.insert(page_id, index) {
            self.page_ids.remove(&old);
        } else {
            self.num_flushed_pages += 1;
        }
        self.page_ids.insert(index, page_id);

        if !self.latest_page_id.is_valid() || page_id > self.latest_page_id {
            self.latest_page_id = page_id;
        }
        Ok(seq)
    }

    pub(crate) fn overwrite_num_flushed_pages(&mut self, num_flushed_pages: u32) {
        self.num_flushed_pages = num_flushed_pages;
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Number of header bytes following the `metaSize` field.
    pub fn meta_size(&self) -> usize {
        let fixed = 4 + 2 + 8 + 4 + 4 + 4;
        let partitions: usize = self
            .partitions
            .iter()
            .map(|p| 4 + 4 + 8 + path_bytes(&p.path).len() + 1)
            .sum();
        fixed + partitions + self.page_indexes.len() * PAGE_INDEX_RECORD
    }

    /// Serialize the whole header, `metaSize` field included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let meta_size = self.meta_size();
        let mut buffer = Vec::with_capacity(META_SIZE_FIELD + meta_size);

        buffer.write_u64::<LittleEndian>(meta_size as u64)?;
        buffer.write_u32::<LittleEndian>(FileType::Partitioned as u32)?;
        buffer.write_u16::<LittleEndian>(self.version)?;
        buffer.write_u64::<LittleEndian>(self.page_size as u64)?;
        buffer.write_u32::<LittleEndian>(self.page_indexes.len() as u32)?;
        buffer.write_u32::<LittleEndian>(self.latest_page_id.0)?;
        buffer.write_u32::<LittleEndian>(self.partitions.len() as u32)?;

        for partition in &self.partitions {
            let path = path_bytes(&partition.path);
            buffer.write_u32::<LittleEndian>(partition.partition_id)?;
            buffer.write_u32::<LittleEndian>(partition.num_pages)?;
            buffer.write_u64::<LittleEndian>(path.len() as u64 + 1)?;
            buffer.write_all(&path)?;
            buffer.write_u8(0)?;
        }

        for (page_id, index) in &self.page_indexes {
            buffer.write_u32::<LittleEndian>(page_id.0)?;
            buffer.write_u32::<LittleEndian>(index.partition_id)?;
            buffer.write_u32::<LittleEndian>(index.seq_in_partition)?;
        }

        debug_assert_eq!(buffer.len(), META_SIZE_FIELD + meta_size);
        Ok(buffer)
    }

    /// Rebuild metadata from a meta partition.
    ///
    /// # Errors
    /// `Error::CorruptedMetadata` on any short read or inconsistent field.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let meta_size = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| corrupted("meta size", e))?;
        // grow with the bytes actually present, never with the recorded size
        let mut body = Vec::new();
        reader
            .take(meta_size)
            .read_to_end(&mut body)
            .map_err(|e| corrupted("meta body", e))?;
        if body.len() as u64 != meta_size {
            return Err(Error::CorruptedMetadata(format!(
                "meta body holds {} of {} bytes",
                body.len(),
                meta_size
            )));
        }
        Self::decode_body(&body)
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(body);

        let file_type = cursor.read_u32::<LittleEndian>().map_err(|e| corrupted("file type", e))?;
        if FileType::from_u32(file_type) != Some(FileType::Partitioned) {
            return Err(Error::CorruptedMetadata(format!(
                "unexpected file type {}",
                file_type
            )));
        }
        let version = cursor.read_u16::<LittleEndian>().map_err(|e| corrupted("version", e))?;
        let page_size = cursor.read_u64::<LittleEndian>().map_err(|e| corrupted("page size", e))? as usize;
        let num_flushed_pages = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| corrupted("flushed page count", e))?;
        let latest_page_id = PageId::new(
            cursor
                .read_u32::<LittleEndian>()
                .map_err(|e| corrupted("latest page id", e))?,
        );
        let num_partitions = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| corrupted("partition count", e))?;
        let remaining = body.len().saturating_sub(cursor.position() as usize);
        let max_records = num_partitions as usize * MIN_PARTITION_RECORD + num_flushed_pages as usize * PAGE_INDEX_RECORD;
        if max_records > remaining {
            return Err(Error::CorruptedMetadata(format!(
                "{} partitions and {} pages cannot fit in {} bytes",
                num_partitions, num_flushed_pages, remaining
            )));
        }

        let mut partitions = Vec::with_capacity(num_partitions as usize);
        for i in 0..num_partitions {
            let partition_id = cursor.read_u32::<LittleEndian>().map_err(|e| corrupted("partition id", e))?;
            if partition_id != i {
                return Err(Error::CorruptedMetadata(format!(
                    "partition {} recorded at position {}",
                    partition_id, i
                )));
            }
            let num_pages = cursor.read_u32::<LittleEndian>().map_err(|e| corrupted("partition pages", e))?;
            let path_len = cursor.read_u64::<LittleEndian>().map_err(|e| corrupted("path length", e))? as usize;
            if path_len == 0 || path_len > body.len() {
                return Err(Error::CorruptedMetadata(format!(
                    "bad path length {} for partition {}",
                    path_len, partition_id
                )));
            }
            let mut path = vec![0u8; path_len];
            cursor.read_exact(&mut path).map_err(|e| corrupted("partition path", e))?;
            if path.pop() != Some(0) {
                return Err(Error::CorruptedMetadata(format!(
                    "path of partition {} is not NUL-terminated",
                    partition_id
                )));
            }
            let path = String::from_utf8(path)
                .map_err(|_| Error::CorruptedMetadata(format!("path of partition {} is not UTF-8", partition_id)))?;
            partitions.push(PartitionMeta {
                partition_id,
                num_pages,
                path: PathBuf::from(path),
            });
        }

        let mut page_indexes = BTreeMap::new();
        let mut page_ids = HashMap::new();
        for _ in 0..num_flushed_pages {
            let page_id = PageId::new(cursor.read_u32::<LittleEndian>().map_err(|e| corrupted("page id", e))?);
            let partition_id = cursor.read_u32::<LittleEndian>().map_err(|e| corrupted("page partition", e))?;
            let seq = cursor.read_u32::<LittleEndian>().map_err(|e| corrupted("page seq", e))?;
            let in_range = partitions
                .get(partition_id as usize)
                .is_some_and(|p| seq < p.num_pages);
            if !in_range {
                return Err(Error::CorruptedMetadata(format!(
                    "{} placed at {}#{} outside its partition",
                    page_id, partition_id, seq
                )));
            }
            let index = PageIndex::new(partition_id, seq);
            page_indexes.insert(page_id, index);
            page_ids.insert(index, page_id);
        }

        Ok(Self {
            page_size,
            version,
            num_flushed_pages,
            latest_page_id,
            partitions,
            page_indexes,
            page_ids,
        })
    }
}

fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

fn corrupted(field: &str, err: std::io::Error) -> Error {
    Error::CorruptedMetadata(format!("short read of {}: {}", field, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PartitionedFileMetaData {
        let paths = vec![PathBuf::from("/data/p0"), PathBuf::from("/data/p1")];
        let mut meta = PartitionedFileMetaData::new(4096, &paths);
        meta.record_append(0, PageId::new(10)).unwrap();
        meta.record_append(1, PageId::new(11)).unwrap();
        meta.record_append(0, PageId::new(12)).unwrap();
        meta
    }

    #[test]
    fn test_record_append() {
        let meta = sample();
        assert_eq!(meta.num_flushed_pages(), 3);
        assert_eq!(meta.latest_page_id(), PageId::new(12));
        assert_eq!(meta.partition(0).unwrap().num_pages, 2);
        assert_eq!(meta.partition(1).unwrap().num_pages, 1);
        assert_eq!(meta.page_index(PageId::new(12)), Some(PageIndex::new(0, 1)));
        assert_eq!(meta.page_id_at(PageIndex::new(1, 0)), Some(PageId::new(11)));
    }

    #[test]
    fn test_record_append_invalid_partition() {
        let mut meta = sample();
        assert!(matches!(
            meta.record_append(5, PageId::new(1)),
            Err(Error::InvalidPartition(5))
        ));
    }

    #[test]
    fn test_encode_layout() {
        let meta = sample();
        let bytes = meta.encode().unwrap();

        assert_eq!(bytes.len(), META_SIZE_FIELD + meta.meta_size());
        let meta_size = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        assert_eq!(meta_size as usize, meta.meta_size());

        let at = |offset: u64| u32::from_le_bytes(bytes[offset as usize..offset as usize + 4].try_into().unwrap());
        assert_eq!(at(OFFSET_FILE_TYPE), FileType::Partitioned as u32);
        assert_eq!(at(OFFSET_NUM_FLUSHED_PAGES), 3);
        assert_eq!(at(OFFSET_LATEST_PAGE_ID), 12);
        let page_size = u64::from_le_bytes(
            bytes[OFFSET_PAGE_SIZE as usize..OFFSET_PAGE_SIZE as usize + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(page_size, 4096);
    }

    #[test]
    fn test_decode_roundtrip() {
        let meta = sample();
        let bytes = meta.encode().unwrap();
        let decoded = PartitionedFileMetaData::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_empty_meta_has_no_latest_page() {
        let meta = PartitionedFileMetaData::new(4096, &[PathBuf::from("p0")]);
        let bytes = meta.encode().unwrap();
        let latest = OFFSET_LATEST_PAGE_ID as usize;
        assert_eq!(
            u32::from_le_bytes(bytes[latest..latest + 4].try_into().unwrap()),
            NO_LATEST_PAGE
        );
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = sample().encode().unwrap();
        for cut in [0, 4, 8, 20, bytes.len() - 1] {
            let result = PartitionedFileMetaData::decode(&mut &bytes[..cut]);
            assert!(
                matches!(result, Err(Error::CorruptedMetadata(_))),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_decode_huge_sizes() {
        // metaSize far beyond the bytes present
        let mut bytes = u64::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 32]);
        assert!(matches!(
            PartitionedFileMetaData::decode(&mut bytes.as_slice()),
            Err(Error::CorruptedMetadata(_))
        ));

        // counts that cannot fit in the recorded body
        for offset in [OFFSET_NUM_FLUSHED_PAGES, OFFSET_NUM_FLUSHED_PAGES + 8] {
            let mut bytes = sample().encode().unwrap();
            let at = offset as usize;
            bytes[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
            assert!(matches!(
                PartitionedFileMetaData::decode(&mut bytes.as_slice()),
                Err(Error::CorruptedMetadata(_))
            ));
        }
    }

    #[test]
    fn test_decode_rejects_sequence_type() {
        let mut bytes = sample().encode().unwrap();
        bytes[OFFSET_FILE_TYPE as usize] = FileType::Sequence as u8;
        assert!(matches!(
            PartitionedFileMetaData::decode(&mut bytes.as_slice()),
            Err(Error::CorruptedMetadata(_))
        ));
    }

    #[test]
    fn test_file_type_from_u32() {
        assert_eq!(FileType::from_u32(0), Some(FileType::Partitioned));
        assert_eq!(FileType::from_u32(1), Some(FileType::Sequence));
        assert_eq!(FileType::from_u32(7), None);
    }
}
