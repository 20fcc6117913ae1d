//! Error types for chunk table operations

use thiserror::Error;

/// Result type alias for chunk table operations
pub type Result<T> = std::result::Result<T, ChunkTableError>;

/// Errors that can occur while building, querying or repairing a chunk table
#[derive(Error, Debug)]
pub enum ChunkTableError {
    /// Table entry bytes fail structural decode
    #[error("Malformed table entry: {0}")]
    MalformedEntry(String),

    /// Section descriptor or table header fails structural decode
    #[error("Malformed section: {0}")]
    MalformedSection(String),

    /// Value does not fit the on-disk field it is encoded into
    #[error("Value out of range: {0}")]
    ValueOutOfRange(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error in context '{0}': {1}")]
    IoContext(String, #[source] std::io::Error),

    #[error("Chunk {0} not found in chunk table")]
    ChunkIndexNotFound(u64),

    #[error("Offset {offset} is beyond media size {media_size}")]
    OffsetOutOfBounds { offset: u64, media_size: u64 },

    /// Data should exist but its segment file is missing or unreadable
    #[error("Chunk unavailable, segment file {segment} missing or unreadable: {reason}")]
    ChunkUnavailable { segment: usize, reason: String },

    #[error("Offset {offset} is not aligned to chunk size {chunk_size}")]
    Misaligned { offset: u64, chunk_size: u32 },

    #[error("Invalid checksum error range: start {start_sector}, {number_of_sectors} sectors")]
    InvalidRange { start_sector: u64, number_of_sectors: u64 },

    #[error("Checksum error at sector {start_sector} precedes previous range end {previous_end}")]
    OutOfOrder { start_sector: u64, previous_end: u64 },

    #[error("Index {index} out of range (have {count})")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl ChunkTableError {
    /// Wrap an I/O error with the operation that produced it
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ChunkTableError::IoContext(context.into(), source)
    }

    /// True for conditions a caller may recover from (e.g. by remounting a volume)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChunkTableError::ChunkUnavailable { .. })
    }
}
