//! Offset resolver
//!
//! Sits between the chunk table and the segment files: turns a media
//! offset into a chunk descriptor, and keeps "the table has no entry" apart
//! from "the segment holding the entry is missing".

use tracing::trace;

use crate::error::{ChunkTableError, Result};

use super::descriptor::ChunkDescriptor;
use super::types::{MediaValues, SegmentSource};
use super::ChunkTable;

/// A descriptor together with where the requested offset falls inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedChunk {
    pub chunk_index: u64,
    pub descriptor: ChunkDescriptor,
    pub intra_chunk_offset: u32,
}

pub struct OffsetResolver<'a> {
    table: &'a ChunkTable,
    segments: &'a dyn SegmentSource,
    media: &'a MediaValues,
}

impl<'a> OffsetResolver<'a> {
    pub fn new(table: &'a ChunkTable, segments: &'a dyn SegmentSource, media: &'a MediaValues) -> Self {
        Self { table, segments, media }
    }

    pub fn chunk_index_for_offset(&self, offset: u64) -> u64 {
        offset / self.table.chunk_size() as u64
    }

    /// Whether a chunk exists at `offset`; does not fill descriptors
    pub fn chunk_exists_for_offset(&self, offset: u64) -> Result<bool> {
        if offset >= self.media.media_size {
            return Ok(false);
        }
        self.table.exists(self.chunk_index_for_offset(offset), self.segments)
    }

    pub fn get_chunk_data_by_offset(&self, offset: u64) -> Result<ResolvedChunk> {
        self.check_bounds(offset)?;
        let chunk_size = self.table.chunk_size() as u64;
        let chunk_index = self.chunk_index_for_offset(offset);

        let mut descriptor = match self.table.get(chunk_index, self.segments) {
            Ok(descriptor) => descriptor,
            Err(ChunkTableError::ChunkIndexNotFound(_)) => {
                // Inside the media but no table covers it: a segment is missing
                return Err(ChunkTableError::ChunkUnavailable {
                    segment: self.segments.number_of_segments(),
                    reason: format!("no table entry for chunk {}", chunk_index),
                });
            }
            Err(e) => return Err(e),
        };

        if !descriptor.is_set() {
            return Err(ChunkTableError::MalformedEntry(format!(
                "chunk {} has no stored data offset",
                chunk_index
            )));
        }

        let chunk_start = chunk_index * chunk_size;
        let remaining = self.media.media_size - chunk_start;
        if remaining < descriptor.uncompressed_size {
            descriptor.uncompressed_size = remaining;
        }

        trace!(offset, chunk_index, descriptor_offset = descriptor.offset, "Resolved offset");
        Ok(ResolvedChunk {
            chunk_index,
            descriptor,
            intra_chunk_offset: (offset - chunk_start) as u32,
        })
    }

    /// Install a descriptor for the chunk containing `offset`
    ///
    /// With `require_aligned`, `offset` must be the first byte of the chunk.
    pub fn set_chunk_data_by_offset(
        &self,
        offset: u64,
        descriptor: ChunkDescriptor,
        require_aligned: bool,
    ) -> Result<u64> {
        self.check_bounds(offset)?;
        let chunk_size = self.table.chunk_size();
        if require_aligned && offset % chunk_size as u64 != 0 {
            return Err(ChunkTableError::Misaligned { offset, chunk_size });
        }

        let chunk_index = self.chunk_index_for_offset(offset);
        self.table.set(chunk_index, descriptor);
        Ok(chunk_index)
    }

    /// Record a chunk's sectors (clamped to the media) as failing their checksum
    ///
    /// Returns false when the range was already recorded.
    pub fn record_checksum_failure(&self, chunk_index: u64) -> Result<bool> {
        let sectors_per_chunk = self.media.sectors_per_chunk as u64;
        let start_sector = chunk_index.saturating_mul(sectors_per_chunk);
        let total_sectors = self.media.number_of_sectors();
        if start_sector >= total_sectors {
            return Err(ChunkTableError::OffsetOutOfBounds {
                offset: chunk_index.saturating_mul(self.table.chunk_size() as u64),
                media_size: self.media.media_size,
            });
        }

        let number_of_sectors = sectors_per_chunk.min(total_sectors - start_sector);
        self.table.record_checksum_error(start_sector, number_of_sectors)
    }

    fn check_bounds(&self, offset: u64) -> Result<()> {
        if offset >= self.media.media_size {
            return Err(ChunkTableError::OffsetOutOfBounds {
                offset,
                media_size: self.media.media_size,
            });
        }
        Ok(())
    }
}
