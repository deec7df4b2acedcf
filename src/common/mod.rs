//! Common types and utilities shared across the storage engine.
//!
//! This module contains fundamental primitives used throughout the codebase:
//! - Configuration ([`StorageConfig`](config::StorageConfig))
//! - Error types
//! - Identifiers (PageId, CacheKey, PageIndex)

pub mod config;
pub mod error;
mod ids;
mod page_id;

pub use error::{Error, Result};
pub use ids::{CacheKey, DatabaseId, NodeId, PageIndex, PartitionId, SetId, SetKey, UserTypeId};
pub use page_id::PageId;
