//! Error types for Quarry.

use thiserror::Error;

/// Result type alias using QuarryError.
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Errors that can occur in Quarry operations.
#[derive(Debug, Error)]
pub enum QuarryError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File is opened read-only")]
    ReadOnlyFile,

    // Buffer manager errors
    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page size {0} is too small to be useful")]
    InvalidPageSize(usize),

    // Record store errors
    #[error("Record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("Schema corrupted: {0}")]
    SchemaCorrupted(String),

    // Transaction errors
    #[error("Deadlock detected")]
    DeadlockDetected,
}
