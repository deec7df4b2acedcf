//! Open handle on one data file, in buffered or direct mode.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::common::config::{IoMode, SHM_ALIGNMENT};
use crate::common::{Error, Result};
use crate::memory::AlignedBuffer;

/// A data file addressed in whole pages.
///
/// All transfers are positional (`pread`/`pwrite`), so the handle keeps its
/// own cursor for sequential scans. In direct mode every transfer goes
/// through a sector-aligned bounce buffer, which lets callers pass any
/// slice.
pub(crate) struct PageFileHandle {
    file: File,
    mode: IoMode,
    page_size: usize,
    bounce: Option<AlignedBuffer>,
    cursor: u64,
}

impl PageFileHandle {
    /// Open `path`, creating it if `create` is set. `truncate` empties it.
    pub(crate) fn open(
        path: &Path,
        mode: IoMode,
        page_size: usize,
        create: bool,
        truncate: bool,
    ) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(create).truncate(truncate);

        let mode = apply_mode(&mut options, mode);
        let file = options.open(path)?;
        let bounce = match mode {
            IoMode::Direct => Some(AlignedBuffer::new(page_size, SHM_ALIGNMENT)?),
            IoMode::Buffered => None,
        };

        Ok(Self {
            file,
            mode,
            page_size,
            bounce,
            cursor: 0,
        })
    }

    pub(crate) fn mode(&self) -> IoMode {
        self.mode
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Write one page at page slot `slot`. Short pages are zero-padded.
    pub(crate) fn write_page(&mut self, slot: u64, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.page_size {
            return Err(Error::RecordTooLarge {
                requested: bytes.len(),
                capacity: self.page_size,
            });
        }
        let offset = slot * self.page_size as u64;
        match self.bounce.as_mut() {
            Some(bounce) => {
                bounce[..bytes.len()].copy_from_slice(bytes);
                bounce[bytes.len()..].fill(0);
                self.file.write_all_at(bounce, offset)?;
            }
            None if bytes.len() == self.page_size => {
                self.file.write_all_at(bytes, offset)?;
            }
            None => {
                let mut padded = vec![0u8; self.page_size];
                padded[..bytes.len()].copy_from_slice(bytes);
                self.file.write_all_at(&padded, offset)?;
            }
        }
        Ok(())
    }

    /// Read the first `buf.len()` bytes of page slot `slot`.
    pub(crate) fn read_page(&mut self, slot: u64, buf: &mut [u8]) -> Result<usize> {
        self.cursor = slot * self.page_size as u64;
        self.read_from_cursor(buf)
    }

    /// Read the page under the cursor and advance it by one page.
    pub(crate) fn read_next_page(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_from_cursor(buf)
    }

    /// Page slot the cursor points at.
    pub(crate) fn cursor_slot(&self) -> u64 {
        self.cursor / self.page_size as u64
    }

    fn read_from_cursor(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len().min(self.page_size);
        let offset = self.cursor;
        match self.bounce.as_mut() {
            Some(bounce) => {
                self.file.read_exact_at(bounce, offset)?;
                buf[..len].copy_from_slice(&bounce[..len]);
            }
            None => self.file.read_exact_at(&mut buf[..len], offset)?,
        }
        self.cursor = offset + self.page_size as u64;
        Ok(len)
    }

    /// Whole pages currently in the file.
    pub(crate) fn num_pages(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len() / self.page_size as u64)
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn apply_mode(options: &mut OpenOptions, mode: IoMode) -> IoMode {
    use std::os::unix::fs::OpenOptionsExt;

    if mode == IoMode::Direct {
        options.custom_flags(libc::O_DIRECT);
    }
    mode
}

#[cfg(not(target_os = "linux"))]
fn apply_mode(_options: &mut OpenOptions, mode: IoMode) -> IoMode {
    if mode == IoMode::Direct {
        log::warn!("direct I/O is not supported on this platform, using buffered I/O");
    }
    IoMode::Buffered
}

/// Whether a failed open was the filesystem refusing `O_DIRECT`.
pub fn is_direct_unsupported(err: &Error) -> bool {
    match err {
        Error::Io(e) => {
            e.raw_os_error() == Some(libc::EINVAL) || e.kind() == io::ErrorKind::InvalidInput
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let mut handle = PageFileHandle::open(&path, IoMode::Buffered, 512, true, true).unwrap();

        handle.write_page(0, &[1u8; 512]).unwrap();
        handle.write_page(1, &[2u8; 100]).unwrap();
        assert_eq!(handle.num_pages().unwrap(), 2);

        let mut buf = [0u8; 512];
        assert_eq!(handle.read_page(1, &mut buf).unwrap(), 512);
        assert_eq!(buf[99], 2);
        assert_eq!(buf[100], 0);
    }

    #[test]
    fn test_sequential_reads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let mut handle = PageFileHandle::open(&path, IoMode::Buffered, 512, true, true).unwrap();
        for i in 0..3u8 {
            handle.write_page(i as u64, &[i; 512]).unwrap();
        }

        let mut buf = [0u8; 512];
        handle.read_page(0, &mut buf).unwrap();
        assert_eq!(handle.cursor_slot(), 1);
        handle.read_next_page(&mut buf).unwrap();
        assert_eq!(buf[0], 1);
        handle.read_next_page(&mut buf).unwrap();
        assert_eq!(buf[0], 2);
        assert!(handle.read_next_page(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_write_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let mut handle = PageFileHandle::open(&path, IoMode::Buffered, 512, true, true).unwrap();
        assert!(matches!(
            handle.write_page(0, &[0u8; 513]),
            Err(Error::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn test_direct_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let mut handle = match PageFileHandle::open(&path, IoMode::Direct, 4096, true, true) {
            Ok(handle) => handle,
            // tmpfs and some overlay filesystems refuse O_DIRECT
            Err(e) if is_direct_unsupported(&e) => return,
            Err(e) => panic!("open failed: {}", e),
        };

        handle.write_page(0, &[9u8; 300]).unwrap();
        let mut buf = vec![0u8; 300];
        assert_eq!(handle.read_page(0, &mut buf).unwrap(), 300);
        assert!(buf.iter().all(|&b| b == 9));
    }
}
