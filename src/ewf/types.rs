//! Type definitions for EWF segment file structures

use serde::Serialize;

use crate::chunk_table::FormatVersion;

// =============================================================================
// Core Constants
// =============================================================================

pub(crate) const EWF_SIGNATURE: &[u8; 8] = b"EVF\x09\x0d\x0a\xff\x00";
pub(crate) const LVF_SIGNATURE: &[u8; 8] = b"LVF\x09\x0d\x0a\xff\x00";
pub(crate) const EWF2_SIGNATURE: &[u8; 8] = b"EVF2\x0d\x0a\x81\x00";
pub(crate) const LVF2_SIGNATURE: &[u8; 8] = b"LVF2\x0d\x0a\x81\x00";

pub(crate) const V1_FILE_HEADER_SIZE: u64 = 13;
pub(crate) const V2_FILE_HEADER_SIZE: u64 = 32;

pub(crate) const V1_DESCRIPTOR_SIZE: u64 = 76;
pub(crate) const V2_DESCRIPTOR_SIZE: u64 = 64;

pub(crate) const V1_TABLE_HEADER_SIZE: u64 = 24;
pub(crate) const V2_TABLE_HEADER_SIZE: u64 = 32;
/// Adler-32 after the entries, plus padding in v2
pub(crate) const V1_TABLE_FOOTER_SIZE: u64 = 4;
pub(crate) const V2_TABLE_FOOTER_SIZE: u64 = 16;

/// Bytes of the v1 volume section we decode
pub(crate) const VOLUME_DATA_SIZE: usize = 24;

/// Guard against section chains that loop
pub(crate) const MAX_SECTIONS: u32 = 10000;

// v2 section type numbers
pub(crate) const V2_SECTION_SECTOR_DATA: u32 = 0x03;
pub(crate) const V2_SECTION_SECTOR_TABLE: u32 = 0x04;
pub(crate) const V2_SECTION_NEXT: u32 = 0x0d;
pub(crate) const V2_SECTION_DONE: u32 = 0x0f;

// =============================================================================
// File Header
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub format_version: FormatVersion,
    /// True for logical evidence files (L01/Lx01)
    pub logical: bool,
    /// 1-based segment number
    pub segment_number: u32,
}

impl FileHeader {
    pub fn size(&self) -> u64 {
        match self.format_version {
            FormatVersion::V1 => V1_FILE_HEADER_SIZE,
            FormatVersion::V2 => V2_FILE_HEADER_SIZE,
        }
    }
}

// =============================================================================
// Section Descriptors
// =============================================================================

/// v1 section descriptor; sections are chained forward through `next_offset`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct V1SectionDescriptor {
    pub section_type: String,
    pub next_offset: u64,
    /// Includes the descriptor itself
    pub size: u64,
}

/// v2 section descriptor; it follows the section data and chains backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct V2SectionDescriptor {
    pub section_type: u32,
    #[allow(dead_code)]
    pub data_flags: u32,
    /// Offset of the previous section's descriptor, 0 for the first section
    pub previous_offset: u64,
    pub data_size: u64,
    #[allow(dead_code)]
    pub padding_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeSection {
    pub chunk_count: u32,
    pub sectors_per_chunk: u32,
    pub bytes_per_sector: u32,
    pub sector_count: u64,
}

// =============================================================================
// Public API Types
// =============================================================================

/// Sector range reported by verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChecksumErrorRange {
    pub start_sector: u64,
    pub number_of_sectors: u64,
    /// Byte offset of the range in the media
    pub offset: u64,
    /// Length of the range in bytes
    pub length: u64,
}

/// Outcome of verifying every chunk of an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyResult {
    pub chunks_verified: u64,
    /// Chunk indices whose stored checksum did not match, ascending
    pub failed_chunks: Vec<u64>,
    pub checksum_errors: Vec<ChecksumErrorRange>,
}

impl VerifyResult {
    pub fn is_ok(&self) -> bool {
        self.failed_chunks.is_empty()
    }
}
