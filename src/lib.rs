//! Chunk table for Expert Witness Format (E01/Ex01) forensic images
//!
//! An EWF image stores media data as fixed-size chunks spread over one or
//! more segment files. The chunk table answers "where does chunk N live,
//! how big is it on disk, is it compressed", building that answer lazily
//! from the table sections of each segment and repairing tainted v1 tables
//! from the stored chunks themselves.
//!
//! ```no_run
//! use ewf_chunk_table::{ChunkTableConfig, ImageHandle};
//!
//! # fn main() -> ewf_chunk_table::Result<()> {
//! let image = ImageHandle::open("evidence.E01", ChunkTableConfig::default())?;
//! let mut sector = [0u8; 512];
//! image.read_at(0, &mut sector)?;
//!
//! let result = image.verify()?;
//! for range in &result.checksum_errors {
//!     println!("bad sectors {}..+{}", range.start_sector, range.number_of_sectors);
//! }
//! # Ok(())
//! # }
//! ```

pub mod chunk_table;
pub mod common;
pub mod config;
pub mod error;
pub mod ewf;
pub mod logging;

pub use chunk_table::{
    ChecksumError, ChunkDescriptor, ChunkFlags, ChunkTable, FormatVersion, MediaValues, OffsetResolver,
    SegmentSource, TableState,
};
pub use config::ChunkTableConfig;
pub use error::{ChunkTableError, Result};
pub use ewf::{ImageHandle, SegmentFiles, VerifyResult};
