//! Shared-memory primitives for the servolink client.
//!
//! The backend publishes all of its bulk state through named, file-backed
//! shared-memory regions that the client maps strictly read-only. Two
//! building blocks live here:
//!
//! - [`ShmView`]: a read-only mapping of a named region.
//! - [`seqlock`]: the revision-counter snapshot protocol used to copy data
//!   out of a region the backend may be rewriting concurrently.

pub mod mmap;
pub mod seqlock;

pub use mmap::{ShmView, ShmViewError};
pub use seqlock::{read_block_snapshot, BlockHeader, Snapshot, BLOCK_HEADER_SIZE};
