//! Cached pages and their on-buffer layout.
//!
//! This module contains:
//! - [`Page`] - A shared-memory block plus cache bookkeeping
//! - [`PageHeader`] - Identity and record count at the start of every page
//! - [`PageReadGuard`] / [`PageWriteGuard`] - RAII guards for byte access

#[allow(clippy::module_inception)]
mod page;
mod page_guard;
mod page_header;

pub use page::{Page, PageHandle};
pub use page_guard::{PageReadGuard, PageWriteGuard};
pub use page_header::{PageHeader, RECORD_LEN_SIZE};
