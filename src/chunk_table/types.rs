//! Types shared between the chunk table and its collaborators

use serde::{Deserialize, Serialize};

use crate::error::{ChunkTableError, Result};

use super::codec::FormatVersion;

/// Per-image constants the chunk table is built with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoValues {
    /// Bytes per uncompressed chunk
    pub chunk_size: u32,
    pub format_version: FormatVersion,
}

/// Media geometry recorded by the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaValues {
    pub media_size: u64,
    pub bytes_per_sector: u32,
    pub sectors_per_chunk: u32,
    pub number_of_chunks: u64,
}

impl MediaValues {
    /// Derive chunk count from media size
    pub fn new(media_size: u64, bytes_per_sector: u32, sectors_per_chunk: u32) -> Result<Self> {
        let mut media = Self {
            media_size,
            bytes_per_sector,
            sectors_per_chunk,
            number_of_chunks: 0,
        };
        let chunk_size = media.chunk_size()? as u64;
        media.number_of_chunks = media_size.div_ceil(chunk_size);
        Ok(media)
    }

    pub fn chunk_size(&self) -> Result<u32> {
        self.bytes_per_sector
            .checked_mul(self.sectors_per_chunk)
            .filter(|&size| size > 0)
            .ok_or_else(|| {
                ChunkTableError::ValueOutOfRange(format!(
                    "chunk size {} x {} invalid",
                    self.sectors_per_chunk, self.bytes_per_sector
                ))
            })
    }

    pub fn number_of_sectors(&self) -> u64 {
        match self.bytes_per_sector {
            0 => 0,
            bps => self.media_size.div_ceil(bps as u64),
        }
    }
}

/// A table section as located by the segment file layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSection {
    /// Segment number (0-based position in the segment file list)
    pub segment_file_id: usize,
    pub pool_entry: usize,
    pub format_version: FormatVersion,
    /// First chunk covered; v1 tables do not record it
    pub first_chunk: Option<u64>,
    pub number_of_entries: u32,
    /// File offset of the first entry
    pub entries_offset: u64,
    /// Base the v1 relative offsets are added to
    pub base_offset: i64,
    /// End of the chunk data area the entries point into
    pub chunks_data_end: i64,
    /// Entry checksum mismatch or other inconsistency seen when the section was read
    pub tainted: bool,
}

impl TableSection {
    pub fn entries_size(&self) -> usize {
        self.number_of_entries as usize * self.format_version.entry_size()
    }
}

/// Read-only access to the segment files of one image
///
/// Implementations are shared between read sessions and must tolerate
/// concurrent calls.
pub trait SegmentSource: Send + Sync {
    fn number_of_segments(&self) -> usize;

    /// Table sections of one segment file, in file order
    fn table_sections(&self, segment_file_id: usize) -> Result<Vec<TableSection>>;

    /// Raw bytes from a segment file
    fn read_at(&self, pool_entry: usize, offset: u64, length: usize) -> Result<Vec<u8>>;
}
