// Common utilities shared by the chunk table and the segment file layer

pub mod binary;
pub mod io_pool;
pub mod segments;

// Re-exports for convenience
pub use binary::{adler32, u16_at, u32_at, u64_at};
pub use io_pool::FileIoPool;
pub use segments::{discover_ewf_segments, segment_extension};
