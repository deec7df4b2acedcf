//! RAII guards for page byte access.
//!
//! These guards provide safe access to a page's shared-memory bytes:
//! - [`PageReadGuard`] - Shared read access (multiple allowed)
//! - [`PageWriteGuard`] - Exclusive write access (marks dirty on drop)
//!
//! Both hold the page's buffer lock, so the cache cannot free the block
//! while a guard is alive.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::memory::{SharedMemory, ShmBlock};

/// Guard for read-only access to a page's bytes.
///
/// # Example
/// ```ignore
/// let guard = page.read()?;
/// let header = PageHeader::from_bytes(&guard);
/// ```
pub struct PageReadGuard<'a> {
    shm: &'a SharedMemory,
    block: ShmBlock,
    /// Keeps the block from being freed.
    _lock: RwLockReadGuard<'a, Option<ShmBlock>>,
}

impl<'a> PageReadGuard<'a> {
    pub(crate) fn new(
        shm: &'a SharedMemory,
        block: ShmBlock,
        lock: RwLockReadGuard<'a, Option<ShmBlock>>,
    ) -> Self {
        Self {
            shm,
            block,
            _lock: lock,
        }
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        // SAFETY: the read lock keeps the block live and excludes writers.
        unsafe { self.shm.bytes(&self.block) }
    }
}

/// Guard for exclusive access to a page's bytes.
///
/// Only one `PageWriteGuard` can exist for a page at a time.
///
/// # Example
/// ```ignore
/// let mut guard = page.write()?;
/// guard[offset..offset + record.len()].copy_from_slice(record);
/// // guard drops here, page marked dirty
/// ```
pub struct PageWriteGuard<'a> {
    shm: &'a SharedMemory,
    block: ShmBlock,
    /// Set on drop; `None` for writes that must not dirty the page.
    dirty: Option<&'a AtomicBool>,
    _lock: RwLockWriteGuard<'a, Option<ShmBlock>>,
}

impl<'a> PageWriteGuard<'a> {
    pub(crate) fn new(
        shm: &'a SharedMemory,
        block: ShmBlock,
        lock: RwLockWriteGuard<'a, Option<ShmBlock>>,
        dirty: Option<&'a AtomicBool>,
    ) -> Self {
        Self {
            shm,
            block,
            dirty,
            _lock: lock,
        }
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        // SAFETY: the write lock keeps the block live and exclusive.
        unsafe { self.shm.bytes(&self.block) }
    }
}

impl DerefMut for PageWriteGuard<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` rules out aliasing through this guard.
        unsafe { self.shm.bytes_mut(&self.block) }
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        if let Some(dirty) = self.dirty {
            dirty.store(true, Ordering::Release);
        }
    }
}
