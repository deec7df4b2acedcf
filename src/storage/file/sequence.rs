//! Sequence file - the legacy single-file backend.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use log::info;
use parking_lot::Mutex;

use crate::common::{Error, NodeId, PageId, Result, SetKey};

use super::meta::FileType;

/// `[u32 fileType][u64 pageSize]`
pub const SEQUENCE_META_SIZE: u64 = 12;

/// Size of the page id trailing every record.
const PAGE_ID_SIZE: u64 = 4;

struct SequenceState {
    file: Option<File>,
    num_flushed_pages: u32,
    last_flushed_page_id: PageId,
    cleared: bool,
}

/// A set stored as one file of `[raw page][u32 page id]` records.
///
/// # File Layout
/// ```text
/// ┌──────────────────┬──────────────────┬──────────────────┬─────┐
/// │ type | page_size │ page 0 | id 0    │ page 1 | id 1    │ ... │
/// └──────────────────┴──────────────────┴──────────────────┴─────┘
/// ```
/// Pages are appended in page-id order, so page `n` is record `n`. The
/// flushed-page count is recovered from the id in the last record.
pub struct SequenceFile {
    set_key: SetKey,
    node_id: NodeId,
    path: PathBuf,
    page_size: usize,
    state: Mutex<SequenceState>,
}

impl SequenceFile {
    /// Open `path`, writing a fresh header if the file is new or empty.
    pub fn open(set_key: SetKey, node_id: NodeId, path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let page_size = if file.metadata()?.len() == 0 {
            let mut header = [0u8; SEQUENCE_META_SIZE as usize];
            LittleEndian::write_u32(&mut header[0..4], FileType::Sequence as u32);
            LittleEndian::write_u64(&mut header[4..12], page_size as u64);
            file.write_all_at(&header, 0)?;
            page_size
        } else {
            read_page_size(&file)?
        };

        let seq_file = Self {
            set_key,
            node_id,
            path,
            page_size,
            state: Mutex::new(SequenceState {
                file: Some(file),
                num_flushed_pages: 0,
                last_flushed_page_id: PageId::INVALID,
                cleared: false,
            }),
        };
        let flushed = seq_file.get_and_set_num_flushed_pages()?;
        info!(
            "opened sequence file for set {} with {} pages",
            set_key, flushed
        );
        Ok(seq_file)
    }

    fn ensure_open(&self, state: &mut SequenceState) -> Result<()> {
        if state.cleared {
            return Err(Error::FileCleared);
        }
        if state.file.is_none() {
            state.file = Some(OpenOptions::new().read(true).write(true).open(&self.path)?);
        }
        Ok(())
    }

    pub fn open_all(&self) -> Result<()> {
        self.ensure_open(&mut self.state.lock())
    }

    pub fn close_all(&self) {
        self.state.lock().file = None;
    }

    /// Close and delete the file.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.file = None;
        state.cleared = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.state.lock().cleared
    }

    /// Byte offset of record `page_id`.
    #[inline]
    fn seek_page(&self, page_id: PageId) -> u64 {
        SEQUENCE_META_SIZE + page_id.0 as u64 * (self.page_size as u64 + PAGE_ID_SIZE)
    }

    /// Append a record; returns its position in the file.
    pub fn append_page(&self, page_id: PageId, bytes: &[u8]) -> Result<u32> {
        if bytes.len() > self.page_size {
            return Err(Error::RecordTooLarge {
                requested: bytes.len(),
                capacity: self.page_size,
            });
        }
        let mut state = self.state.lock();
        self.ensure_open(&mut state)?;
        let file = open_file(&state)?;

        let end = file.metadata()?.len().max(SEQUENCE_META_SIZE);
        let mut record = vec![0u8; self.page_size + PAGE_ID_SIZE as usize];
        record[..bytes.len()].copy_from_slice(bytes);
        LittleEndian::write_u32(&mut record[self.page_size..], page_id.0);
        file.write_all_at(&record, end)?;

        let position = state.num_flushed_pages;
        state.num_flushed_pages += 1;
        state.last_flushed_page_id = page_id;
        Ok(position)
    }

    /// Read the first `buf.len()` bytes of page `page_id`.
    pub fn load_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        self.ensure_open(&mut state)?;
        if !state.last_flushed_page_id.is_valid() || page_id > state.last_flushed_page_id {
            return Err(Error::PageOutOfRange {
                partition: 0,
                seq: page_id.0,
            });
        }
        let len = buf.len().min(self.page_size);
        open_file(&state)?.read_exact_at(&mut buf[..len], self.seek_page(page_id))?;
        Ok(len)
    }

    /// Recover the flushed-page count from the id trailing the last record.
    pub fn get_and_set_num_flushed_pages(&self) -> Result<u32> {
        let mut state = self.state.lock();
        self.ensure_open(&mut state)?;
        let file = open_file(&state)?;

        let size = file.metadata()?.len();
        let (num_flushed, last) = if size <= SEQUENCE_META_SIZE {
            (0, PageId::INVALID)
        } else {
            let mut buf = [0u8; PAGE_ID_SIZE as usize];
            file.read_exact_at(&mut buf, size - PAGE_ID_SIZE)
                .map_err(|e| Error::CorruptedMetadata(format!("short read of last page id: {}", e)))?;
            let last = PageId::new(LittleEndian::read_u32(&buf));
            (last.0.wrapping_add(1), last)
        };
        state.num_flushed_pages = num_flushed;
        state.last_flushed_page_id = last;
        Ok(num_flushed)
    }

    /// Page size as recorded in the header.
    pub fn page_size_in_meta(&self) -> Result<usize> {
        let mut state = self.state.lock();
        self.ensure_open(&mut state)?;
        read_page_size(open_file(&state)?)
    }

    pub fn set_key(&self) -> SetKey {
        self.set_key
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_flushed_pages(&self) -> u32 {
        self.state.lock().num_flushed_pages
    }

    /// Id of the last appended page, `PageId::INVALID` if none.
    pub fn last_flushed_page_id(&self) -> PageId {
        self.state.lock().last_flushed_page_id
    }
}

fn open_file(state: &SequenceState) -> Result<&File> {
    state.file.as_ref().ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            "sequence file is closed",
        ))
    })
}

fn read_page_size(file: &File) -> Result<usize> {
    let mut header = [0u8; SEQUENCE_META_SIZE as usize];
    file.read_exact_at(&mut header, 0)
        .map_err(|e| Error::CorruptedMetadata(format!("short sequence file header: {}", e)))?;
    let file_type = LittleEndian::read_u32(&header[0..4]);
    if FileType::from_u32(file_type) != Some(FileType::Sequence) {
        return Err(Error::CorruptedMetadata(format!(
            "unexpected file type {}",
            file_type
        )));
    }
    Ok(LittleEndian::read_u64(&header[4..12]) as usize)
}
