//! Page identifier type.

use std::fmt;

/// Identifies a page within one set.
///
/// Page ids are handed out by a set's monotonic sequence and are stable for
/// the life of the page: the file metadata maps each flushed id to its
/// on-disk [`PageIndex`](crate::common::PageIndex).
///
/// # Example
/// ```
/// use setstore::PageId;
///
/// let page_id = PageId::new(42);
/// assert!(page_id.is_valid());
/// assert_eq!(page_id.0, 42);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u32);

impl PageId {
    /// Invalid/sentinel page ID.
    ///
    /// Used to represent "no page" or uninitialized state.
    pub const INVALID: PageId = PageId(u32::MAX);

    /// Create a new PageId.
    #[inline]
    pub fn new(id: u32) -> Self {
        PageId(id)
    }

    /// Check if this page ID is valid (not the sentinel value).
    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// The id following this one in a set's sequence.
    #[inline]
    pub fn next(&self) -> PageId {
        PageId(self.0.wrapping_add(1))
    }
}

impl Default for PageId {
    fn default() -> Self {
        PageId::INVALID
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "Page(INVALID)")
        } else {
            write!(f, "Page({})", self.0)
        }
    }
}
