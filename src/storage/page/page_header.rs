//! Page header layout.
//!
//! Every cached page starts with a [`PageHeader`] naming the page and
//! counting the records appended after it.

use byteorder::{ByteOrder, LittleEndian};

use crate::common::{CacheKey, DatabaseId, NodeId, PageId, SetId, UserTypeId};

/// Size of the length prefix written in front of every variable-size record.
pub const RECORD_LEN_SIZE: usize = 8;

/// Metadata stored at the beginning of every page.
///
/// # Layout (24 bytes, little-endian)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     node_id
/// 4       4     db_id
/// 8       4     type_id
/// 12      4     set_id
/// 16      4     page_id
/// 20      4     num_objects
/// ```
///
/// Records follow the header as `[u64 length][bytes]`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub node_id: NodeId,
    pub db_id: DatabaseId,
    pub type_id: UserTypeId,
    pub set_id: SetId,
    pub page_id: PageId,
    pub num_objects: u32,
}

impl PageHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 24;

    /// Offset of each field within the header.
    pub const OFFSET_NODE_ID: usize = 0;
    pub const OFFSET_DB_ID: usize = 4;
    pub const OFFSET_TYPE_ID: usize = 8;
    pub const OFFSET_SET_ID: usize = 12;
    pub const OFFSET_PAGE_ID: usize = 16;
    pub const OFFSET_NUM_OBJECTS: usize = 20;

    /// Header of an empty page with the given identity.
    pub fn new(node_id: NodeId, key: CacheKey) -> Self {
        Self {
            node_id,
            db_id: key.db_id,
            type_id: key.type_id,
            set_id: key.set_id,
            page_id: key.page_id,
            num_objects: 0,
        }
    }

    /// Read a header from the beginning of a byte slice.
    ///
    /// # Panics
    /// Panics if `data.len() < PageHeader::SIZE`.
    pub fn from_bytes(data: &[u8]) -> Self {
        assert!(data.len() >= Self::SIZE, "buffer too small for PageHeader");

        Self {
            node_id: LittleEndian::read_u32(&data[Self::OFFSET_NODE_ID..]),
            db_id: LittleEndian::read_u32(&data[Self::OFFSET_DB_ID..]),
            type_id: LittleEndian::read_u32(&data[Self::OFFSET_TYPE_ID..]),
            set_id: LittleEndian::read_u32(&data[Self::OFFSET_SET_ID..]),
            page_id: PageId::new(LittleEndian::read_u32(&data[Self::OFFSET_PAGE_ID..])),
            num_objects: LittleEndian::read_u32(&data[Self::OFFSET_NUM_OBJECTS..]),
        }
    }

    /// Write this header to the beginning of a byte slice.
    ///
    /// # Panics
    /// Panics if `data.len() < PageHeader::SIZE`.
    pub fn write_to(&self, data: &mut [u8]) {
        assert!(data.len() >= Self::SIZE, "buffer too small for PageHeader");

        LittleEndian::write_u32(&mut data[Self::OFFSET_NODE_ID..], self.node_id);
        LittleEndian::write_u32(&mut data[Self::OFFSET_DB_ID..], self.db_id);
        LittleEndian::write_u32(&mut data[Self::OFFSET_TYPE_ID..], self.type_id);
        LittleEndian::write_u32(&mut data[Self::OFFSET_SET_ID..], self.set_id);
        LittleEndian::write_u32(&mut data[Self::OFFSET_PAGE_ID..], self.page_id.0);
        LittleEndian::write_u32(&mut data[Self::OFFSET_NUM_OBJECTS..], self.num_objects);
    }

    /// Read only the page id of a raw page.
    #[inline]
    pub fn read_page_id(data: &[u8]) -> PageId {
        PageId::new(LittleEndian::read_u32(&data[Self::OFFSET_PAGE_ID..]))
    }

    /// Overwrite only the record count of a raw page.
    #[inline]
    pub fn write_num_objects(data: &mut [u8], num_objects: u32) {
        LittleEndian::write_u32(&mut data[Self::OFFSET_NUM_OBJECTS..], num_objects);
    }

    /// The cache key this header names.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.db_id, self.type_id, self.set_id, self.page_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_header_new() {
        let key = CacheKey::new(1, 2, 3, PageId::new(7));
        let header = PageHeader::new(9, key);
        assert_eq!(header.node_id, 9);
        assert_eq!(header.cache_key(), key);
        assert_eq!(header.num_objects, 0);
    }

    #[test]
    fn test_page_header_default() {
        let header = PageHeader::default();
        assert_eq!(header.page_id, PageId::INVALID);
        assert_eq!(header.num_objects, 0);
    }

    #[test]
    fn test_page_header_roundtrip() {
        let header = PageHeader {
            node_id: 4,
            db_id: 1,
            type_id: 2,
            set_id: 3,
            page_id: PageId::new(0xDEAD),
            num_objects: 17,
        };

        let mut buf = [0u8; 64];
        header.write_to(&mut buf);
        assert_eq!(PageHeader::from_bytes(&buf), header);
    }

    #[test]
    fn test_page_header_byte_layout() {
        let header = PageHeader {
            node_id: 0x01,
            db_id: 0x02,
            type_id: 0x03,
            set_id: 0x04,
            page_id: PageId::new(0x0506),
            num_objects: 0x07,
        };

        let mut buf = [0u8; PageHeader::SIZE];
        header.write_to(&mut buf);

        assert_eq!(buf[0], 0x01);
        assert_eq!(buf[4], 0x02);
        assert_eq!(buf[8], 0x03);
        assert_eq!(buf[12], 0x04);
        assert_eq!(&buf[16..20], &[0x06, 0x05, 0x00, 0x00]);
        assert_eq!(buf[20], 0x07);
        assert_eq!(PageHeader::read_page_id(&buf), PageId::new(0x0506));
    }

    #[test]
    fn test_write_num_objects() {
        let mut buf = [0u8; PageHeader::SIZE];
        PageHeader::write_num_objects(&mut buf, 3);
        assert_eq!(PageHeader::from_bytes(&buf).num_objects, 3);
    }

    #[test]
    #[should_panic(expected = "buffer too small")]
    fn test_from_short_buffer() {
        PageHeader::from_bytes(&[0u8; 10]);
    }
}
