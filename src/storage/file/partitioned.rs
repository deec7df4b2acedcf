//! Partitioned file - a set's pages spread over several data partitions.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};

use crate::common::config::IoMode;
use crate::common::{Error, NodeId, PageId, PageIndex, PartitionId, Result, SetKey};

use super::handle::PageFileHandle;
use super::meta::{PartitionedFileMetaData, OFFSET_NUM_FLUSHED_PAGES, OFFSET_PAGE_SIZE};

/// Open descriptors of a partitioned file. Guarded by the file mutex.
struct FileState {
    meta_file: Option<File>,
    partitions: Vec<PageFileHandle>,
    cleared: bool,
}

/// A set's storage: N data partitions plus one metadata partition.
///
/// # File Layout
/// ```text
/// meta partition:   [metaSize][header ...]          (see PartitionedFileMetaData)
/// data partition i: ┌────────┬────────┬─────┐
///                   │ seq 0  │ seq 1  │ ... │       fixed page_size blocks
///                   └────────┴────────┴─────┘
/// ```
/// The page at `(partition, seq)` lives at byte `seq × page_size` of that
/// partition.
///
/// # Thread Safety
/// - `state` is the file mutex: it serializes appends, loads, metadata
///   rewrites and `clear`
/// - `meta` is read without the file mutex by lookups (`page_index`, ...)
///
/// # I/O Mode
/// Buffered or direct, chosen at construction and fixed for the file's
/// lifetime.
pub struct PartitionedFile {
    set_key: SetKey,
    node_id: NodeId,
    meta_path: PathBuf,
    io_mode: IoMode,
    state: Mutex<FileState>,
    meta: RwLock<PartitionedFileMetaData>,
}

impl PartitionedFile {
    /// Create a new, empty file and persist its metadata.
    ///
    /// Existing files at these paths are truncated.
    pub fn create(
        set_key: SetKey,
        node_id: NodeId,
        meta_path: impl AsRef<Path>,
        data_paths: Vec<PathBuf>,
        page_size: usize,
        io_mode: IoMode,
    ) -> Result<Self> {
        if data_paths.is_empty() {
            return Err(Error::InvalidConfig(
                "a partitioned file needs at least one data partition".to_string(),
            ));
        }
        let meta_path = meta_path.as_ref().to_path_buf();
        let meta = PartitionedFileMetaData::new(page_size, &data_paths);

        let meta_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&meta_path)?;
        let partitions = data_paths
            .iter()
            .map(|path| PageFileHandle::open(path, io_mode, page_size, true, true))
            .collect::<Result<Vec<_>>>()?;

        let file = Self {
            set_key,
            node_id,
            meta_path,
            io_mode,
            state: Mutex::new(FileState {
                meta_file: Some(meta_file),
                partitions,
                cleared: false,
            }),
            meta: RwLock::new(meta),
        };
        file.write_meta()?;

        info!(
            "created partitioned file for set {} with {} partitions at {}",
            set_key,
            data_paths.len(),
            file.meta_path.display()
        );
        Ok(file)
    }

    /// Open an existing file, rebuilding its metadata from the meta
    /// partition.
    ///
    /// # Errors
    /// `Error::CorruptedMetadata` if the header is truncated or
    /// inconsistent; no file object is built in that case.
    pub fn open(
        set_key: SetKey,
        node_id: NodeId,
        meta_path: impl AsRef<Path>,
        io_mode: IoMode,
    ) -> Result<Self> {
        let meta_path = meta_path.as_ref().to_path_buf();
        let meta_file = OpenOptions::new().read(true).write(true).open(&meta_path)?;
        let meta = Self::build_meta_data_from_meta_partition(&meta_file)?;

        let partitions = meta
            .partitions()
            .iter()
            .map(|p| PageFileHandle::open(&p.path, io_mode, meta.page_size(), false, false))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "opened partitioned file for set {}: {} pages in {} partitions",
            set_key,
            meta.num_flushed_pages(),
            meta.num_partitions()
        );
        Ok(Self {
            set_key,
            node_id,
            meta_path,
            io_mode,
            state: Mutex::new(FileState {
                meta_file: Some(meta_file),
                partitions,
                cleared: false,
            }),
            meta: RwLock::new(meta),
        })
    }

    /// Open the file if its meta partition exists, create it otherwise.
    pub fn open_or_create(
        set_key: SetKey,
        node_id: NodeId,
        meta_path: impl AsRef<Path>,
        data_paths: Vec<PathBuf>,
        page_size: usize,
        io_mode: IoMode,
    ) -> Result<Self> {
        if meta_path.as_ref().exists() {
            Self::open(set_key, node_id, meta_path, io_mode)
        } else {
            Self::create(set_key, node_id, meta_path, data_paths, page_size, io_mode)
        }
    }

    fn build_meta_data_from_meta_partition(meta_file: &File) -> Result<PartitionedFileMetaData> {
        let mut reader = BufReader::new(meta_file);
        reader.seek(SeekFrom::Start(0))?;
        PartitionedFileMetaData::decode(&mut reader).map_err(|e| {
            error!("failed to rebuild metadata: {}", e);
            e
        })
    }

    // ========================================================================
    // Open / close / clear
    // ========================================================================

    /// Reopen any descriptors closed by [`PartitionedFile::close_all`].
    pub fn open_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_open(&mut state)
    }

    fn ensure_open(&self, state: &mut FileState) -> Result<()> {
        if state.cleared {
            return Err(Error::FileCleared);
        }
        if state.meta_file.is_none() {
            state.meta_file = Some(OpenOptions::new().read(true).write(true).open(&self.meta_path)?);
        }
        if state.partitions.is_empty() {
            let meta = self.meta.read();
            state.partitions = meta
                .partitions()
                .iter()
                .map(|p| PageFileHandle::open(&p.path, self.io_mode, meta.page_size(), true, false))
                .collect::<Result<Vec<_>>>()?;
        }
        Ok(())
    }

    /// Close every descriptor. Later I/O reopens them.
    pub fn close_all(&self) {
        let mut state = self.state.lock();
        state.meta_file = None;
        state.partitions.clear();
    }

    /// Close and delete every partition. The file accepts no I/O afterwards.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.meta_file = None;
        state.partitions.clear();
        state.cleared = true;

        let paths: Vec<PathBuf> = self
            .meta
            .read()
            .partitions()
            .iter()
            .map(|p| p.path.clone())
            .chain(std::iter::once(self.meta_path.clone()))
            .collect();
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!("cleared partitioned file of set {}", self.set_key);
        Ok(())
    }

    pub fn is_cleared(&self) -> bool {
        self.state.lock().cleared
    }

    // ========================================================================
    // Pages
    // ========================================================================

    /// Append a page to `partition_id`; returns its sequence number there.
    ///
    /// The write, the flushed-page counters and the page-id mapping are
    /// updated together under the file mutex.
    pub fn append_page(&self, partition_id: PartitionId, page_id: PageId, bytes: &[u8]) -> Result<u32> {
        let mut state = self.state.lock();
        self.ensure_open(&mut state)?;

        let mut meta = self.meta.write();
        let seq = meta
            .partition(partition_id)
            .ok_or(Error::InvalidPartition(partition_id))?
            .num_pages;
        let partition = state
            .partitions
            .get_mut(partition_id as usize)
            .ok_or(Error::InvalidPartition(partition_id))?;
        partition.write_page(seq as u64, bytes)?;

        let recorded = meta.record_append(partition_id, page_id)?;
        debug_assert_eq!(recorded, seq);
        debug!(
            "appended {} of set {} at {}",
            page_id,
            self.set_key,
            PageIndex::new(partition_id, seq)
        );
        Ok(seq)
    }

    /// Read the page at `(partition_id, seq)` into `buf`; returns bytes read.
    pub fn load_page(&self, partition_id: PartitionId, seq: u32, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        self.ensure_open(&mut state)?;
        self.check_in_range(partition_id, seq)?;

        let partition = state
            .partitions
            .get_mut(partition_id as usize)
            .ok_or(Error::InvalidPartition(partition_id))?;
        partition.read_page(seq as u64, buf)
    }

    /// Read the page following the last one loaded from `partition_id`.
    pub fn load_page_from_cur_pos(&self, partition_id: PartitionId, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        self.ensure_open(&mut state)?;

        let partition = state
            .partitions
            .get_mut(partition_id as usize)
            .ok_or(Error::InvalidPartition(partition_id))?;
        self.check_in_range(partition_id, partition.cursor_slot() as u32)?;
        partition.read_next_page(buf)
    }

    /// Read page `seq` of a partition that is being scanned in order.
    ///
    /// Continues from the cursor when it already sits on `seq`, seeks
    /// otherwise.
    pub fn load_page_sequential(&self, partition_id: PartitionId, seq: u32, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        self.ensure_open(&mut state)?;
        self.check_in_range(partition_id, seq)?;

        let partition = state
            .partitions
            .get_mut(partition_id as usize)
            .ok_or(Error::InvalidPartition(partition_id))?;
        if partition.cursor_slot() == seq as u64 {
            partition.read_next_page(buf)
        } else {
            partition.read_page(seq as u64, buf)
        }
    }

    fn check_in_range(&self, partition_id: PartitionId, seq: u32) -> Result<()> {
        let meta = self.meta.read();
        let partition = meta
            .partition(partition_id)
            .ok_or(Error::InvalidPartition(partition_id))?;
        if seq >= partition.num_pages {
            return Err(Error::PageOutOfRange {
                partition: partition_id,
                seq,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Rewrite the whole meta partition from the in-memory metadata.
    pub fn write_meta(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_open(&mut state)?;

        let bytes = self.meta.read().encode()?;
        let meta_file = open_meta(&state)?;
        meta_file.write_all_at(&bytes, 0)?;
        meta_file.set_len(bytes.len() as u64)?;
        meta_file.sync_data()?;
        for partition in &state.partitions {
            partition.sync()?;
        }
        Ok(())
    }

    /// Persist metadata after appends.
    ///
    /// Always a full rewrite: patching the header in place cannot grow the
    /// partition table and the page map together.
    pub fn update_meta(&self) -> Result<()> {
        self.write_meta()
    }

    /// Re-read the flushed-page count from the meta partition and adopt it.
    ///
    /// # Errors
    /// `Error::CorruptedMetadata` if the header is too short to hold it.
    pub fn get_and_set_num_flushed_pages(&self) -> Result<u32> {
        let mut state = self.state.lock();
        self.ensure_open(&mut state)?;

        let mut buf = [0u8; 4];
        open_meta(&state)?
            .read_exact_at(&mut buf, OFFSET_NUM_FLUSHED_PAGES)
            .map_err(|e| Error::CorruptedMetadata(format!("short read of flushed page count: {}", e)))?;
        let num_flushed_pages = u32::from_le_bytes(buf);
        self.meta.write().overwrite_num_flushed_pages(num_flushed_pages);
        Ok(num_flushed_pages)
    }

    /// Page size as recorded on disk.
    pub fn page_size_in_meta(&self) -> Result<usize> {
        let mut state = self.state.lock();
        self.ensure_open(&mut state)?;

        let mut buf = [0u8; 8];
        open_meta(&state)?
            .read_exact_at(&mut buf, OFFSET_PAGE_SIZE)
            .map_err(|e| Error::CorruptedMetadata(format!("short read of page size: {}", e)))?;
        Ok(u64::from_le_bytes(buf) as usize)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn set_key(&self) -> SetKey {
        self.set_key
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn io_mode(&self) -> IoMode {
        self.io_mode
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub fn page_size(&self) -> usize {
        self.meta.read().page_size()
    }

    pub fn num_flushed_pages(&self) -> u32 {
        self.meta.read().num_flushed_pages()
    }

    /// Highest page id flushed so far, `PageId::INVALID` if none.
    pub fn latest_page_id(&self) -> PageId {
        self.meta.read().latest_page_id()
    }

    pub fn num_partitions(&self) -> usize {
        self.meta.read().num_partitions()
    }

    /// Pages stored in one partition, `None` for an unknown partition.
    pub fn partition_num_pages(&self, partition_id: PartitionId) -> Option<u32> {
        self.meta.read().partition(partition_id).map(|p| p.num_pages)
    }

    pub fn page_index(&self, page_id: PageId) -> Option<PageIndex> {
        self.meta.read().page_index(page_id)
    }

    pub fn page_id_at(&self, index: PageIndex) -> Option<PageId> {
        self.meta.read().page_id_at(index)
    }

    /// Copy of the in-memory metadata.
    pub fn metadata(&self) -> PartitionedFileMetaData {
        self.meta.read().clone()
    }
}

fn open_meta(state: &FileState) -> Result<&File> {
    state.meta_file.as_ref().ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            "meta partition is closed",
        ))
    })
}
