//! File Set - a flat scratch file of fixed-size pages.
//!
//! Used for intermediate data that is written once and scanned once, such
//! as spilled partitions. Pages never live in the cache while they are
//! written; the iterator brings them in one at a time.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use crate::buffer::PageCache;
use crate::common::{Error, NodeId, Result, SetKey};
use crate::set::iterator::FileSetPageIterator;

struct FileSetState {
    file: Option<File>,
    num_pages: u32,
}

/// An append-only file of `page_size` blocks.
///
/// # File Layout
/// ```text
/// ┌──────────┬──────────┬──────────┬─────┐
/// │ page 0   │ page 1   │ page 2   │ ... │
/// └──────────┴──────────┴──────────┴─────┘
/// ```
/// No header; page `n` starts at `n * page_size`.
pub struct FileSet {
    set_key: SetKey,
    node_id: NodeId,
    path: PathBuf,
    page_size: usize,
    cache: Arc<PageCache>,
    state: Mutex<FileSetState>,
}

impl FileSet {
    /// Create (or truncate) the scratch file at `path`.
    pub fn create(cache: Arc<PageCache>, set_key: SetKey, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        info!("created file set {} at {}", set_key, path.display());
        Ok(Self {
            set_key,
            node_id: cache.node_id(),
            path,
            page_size: cache.page_size(),
            cache,
            state: Mutex::new(FileSetState {
                file: Some(file),
                num_pages: 0,
            }),
        })
    }

    /// Append one page, zero-padded to the page size. Returns its index.
    pub fn append_page(&self, bytes: &[u8]) -> Result<u32> {
        if bytes.len() > self.page_size {
            return Err(Error::RecordTooLarge {
                requested: bytes.len(),
                capacity: self.page_size,
            });
        }
        let mut state = self.state.lock();
        let index = state.num_pages;
        let file = state.file.as_ref().ok_or(Error::FileCleared)?;

        let mut block = vec![0u8; self.page_size];
        block[..bytes.len()].copy_from_slice(bytes);
        file.write_all_at(&block, index as u64 * self.page_size as u64)?;
        state.num_pages += 1;
        debug!("appended page {} to file set {}", index, self.set_key);
        Ok(index)
    }

    pub fn num_pages(&self) -> u32 {
        self.state.lock().num_pages
    }

    /// Scan every page written so far, in order.
    pub fn iterator(&self) -> Result<FileSetPageIterator> {
        let state = self.state.lock();
        if state.file.is_none() {
            return Err(Error::FileCleared);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(FileSetPageIterator::new(
            Arc::clone(&self.cache),
            reader,
            self.set_key,
            self.node_id,
            self.page_size,
            state.num_pages,
        ))
    }

    /// Close and delete the file.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.file = None;
        state.num_pages = 0;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.state.lock().file.is_none()
    }

    pub fn set_key(&self) -> SetKey {
        self.set_key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}
