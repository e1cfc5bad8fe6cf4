//! Paged file store and buffer manager for Quarry.
//!
//! This crate provides:
//! - Positional block I/O on segment files
//! - A bounded buffer pool with shared/exclusive page latching
//! - Two-queue replacement (FIFO admission, LRU for hot pages)
//! - Lazy write-back of dirty frames

pub mod file;
pub mod frame;
pub mod pool;

pub use file::{FileMode, PagedFile};
pub use frame::{BufferFrame, FrameState};
pub use pool::{BufferManager, PageGuard};
