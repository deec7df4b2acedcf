//! Shared-memory arena.
//!
//! One contiguous, page-aligned region carved into aligned blocks by a
//! first-fit allocator. Freed blocks are coalesced with their neighbours so
//! long-running workloads do not fragment the region into unusable slivers.

use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::slice;

use log::{debug, info};
use parking_lot::Mutex;

use crate::common::{Error, Result};

/// Alignment of the region itself.
const REGION_ALIGNMENT: usize = 4096;

/// A block handed out by [`SharedMemory::malloc_align`].
///
/// `offset` is the aligned start inside the arena; the block actually owns
/// `align_offset` padding bytes in front of it, which go back to the free
/// list together with the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmBlock {
    pub offset: usize,
    pub len: usize,
    pub align_offset: usize,
}

impl ShmBlock {
    #[inline]
    fn raw_start(&self) -> usize {
        self.offset - self.align_offset
    }

    #[inline]
    fn raw_len(&self) -> usize {
        self.len + self.align_offset
    }
}

/// Free extents keyed by start offset. Never holds two adjacent extents.
struct FreeList {
    extents: BTreeMap<usize, usize>,
    used: usize,
}

/// The arena every cached page lives in.
///
/// # Thread Safety
/// The free list is behind a `Mutex`. Block contents are not synchronized
/// here: whoever owns a [`ShmBlock`] guards access to its bytes (pages do so
/// with their own `RwLock`).
pub struct SharedMemory {
    base: NonNull<u8>,
    layout: Layout,
    free: Mutex<FreeList>,
}

// The region is plain bytes owned by this struct; concurrent access to a
// block's bytes is serialized by the block's owner.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Reserve a zeroed region of `size` bytes.
    ///
    /// # Errors
    /// `Error::InvalidConfig` for a zero size, `Error::OutOfMemory` if the
    /// system allocator refuses the region.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidConfig(
                "shared memory size must be > 0".to_string(),
            ));
        }
        let layout = Layout::from_size_align(size, REGION_ALIGNMENT)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(Error::OutOfMemory { requested: size })?;

        let mut extents = BTreeMap::new();
        extents.insert(0, size);
        info!("reserved {} bytes of shared memory", size);

        Ok(Self {
            base,
            layout,
            free: Mutex::new(FreeList { extents, used: 0 }),
        })
    }

    /// Total bytes in the region.
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes not currently handed out (including fragmentation).
    pub fn available(&self) -> usize {
        self.capacity() - self.free.lock().used
    }

    /// Allocate `size` bytes whose start is aligned to `alignment`.
    ///
    /// Returns `None` when no free extent can hold the block; the caller is
    /// expected to evict and retry.
    pub fn malloc_align(&self, size: usize, alignment: usize) -> Option<ShmBlock> {
        if size == 0 || !alignment.is_power_of_two() {
            return None;
        }
        let mut free = self.free.lock();

        let (start, len, pad) = free.extents.iter().find_map(|(&start, &len)| {
            let aligned = (start + alignment - 1) & !(alignment - 1);
            let pad = aligned - start;
            (pad + size <= len).then_some((start, len, pad))
        })?;

        free.extents.remove(&start);
        let taken = pad + size;
        if taken < len {
            free.extents.insert(start + taken, len - taken);
        }
        free.used += taken;

        Some(ShmBlock {
            offset: start + pad,
            len: size,
            align_offset: pad,
        })
    }

    /// Return a block to the arena.
    pub fn free(&self, block: ShmBlock) {
        let mut free = self.free.lock();
        let mut start = block.raw_start();
        let mut len = block.raw_len();
        free.used -= len;

        // merge with the extent right after
        if let Some(next_len) = free.extents.remove(&(start + len)) {
            len += next_len;
        }
        // merge with the extent right before
        let prev = free
            .extents
            .range(..start)
            .next_back()
            .map(|(&s, &l)| (s, l));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len == start {
                free.extents.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        free.extents.insert(start, len);
        debug!("freed {} bytes at offset {}", block.raw_len(), block.raw_start());
    }

    /// Offset of a block from the start of the arena.
    #[inline]
    pub fn compute_offset(&self, block: &ShmBlock) -> usize {
        block.offset
    }

    /// View the bytes of a block.
    ///
    /// # Safety
    /// `block` must be live (not freed) and no `&mut` view of it may exist.
    pub(crate) unsafe fn bytes(&self, block: &ShmBlock) -> &[u8] {
        debug_assert!(block.offset + block.len <= self.capacity());
        slice::from_raw_parts(self.base.as_ptr().add(block.offset), block.len)
    }

    /// Mutably view the bytes of a block.
    ///
    /// # Safety
    /// `block` must be live and the caller must hold exclusive access to it.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, block: &ShmBlock) -> &mut [u8] {
        debug_assert!(block.offset + block.len <= self.capacity());
        slice::from_raw_parts_mut(self.base.as_ptr().add(block.offset), block.len)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}
