//! Memory the storage engine manages itself.
//!
//! - [`SharedMemory`] - The arena every cached page lives in
//! - [`ShmBlock`] - One allocation inside the arena
//! - [`AlignedBuffer`] - Sector-aligned scratch space for direct I/O

mod aligned;
mod shared_memory;

pub use aligned::AlignedBuffer;
pub use shared_memory::{SharedMemory, ShmBlock};
