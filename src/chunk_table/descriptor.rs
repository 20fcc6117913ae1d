//! In-memory chunk descriptor

use bitflags::bitflags;

bitflags! {
    /// Chunk flags
    ///
    /// The low 16 bits mirror the v2 on-disk `chunk_data_flags` field; the
    /// high bits describe how the descriptor was obtained and never reach disk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChunkFlags: u32 {
        const COMPRESSED = 0x0000_0001;
        const HAS_CHECKSUM = 0x0000_0002;
        /// The offset field holds an 8-byte fill pattern instead of an offset
        const PATTERN_FILL = 0x0000_0004;
        const PATCHED = 0x0000_0008;
        /// Checksum failed when the chunk was written
        const CHECKSUM_FAILED = 0x0000_0010;

        /// Read from a tainted table and not yet compared against the chunk data
        const PROVISIONAL = 0x0001_0000;
        /// Measured from the chunk data because the table disagreed
        const CORRECTED = 0x0002_0000;
        const CHECKSUM_VALIDATED = 0x0004_0000;
    }
}

impl ChunkFlags {
    /// Bits representable in a v2 table entry
    pub const ON_DISK_V2: ChunkFlags = ChunkFlags::COMPRESSED
        .union(ChunkFlags::HAS_CHECKSUM)
        .union(ChunkFlags::PATTERN_FILL)
        .union(ChunkFlags::PATCHED)
        .union(ChunkFlags::CHECKSUM_FAILED);

    /// Bits representable in a v1 table entry
    pub const ON_DISK_V1: ChunkFlags = ChunkFlags::COMPRESSED;

    /// Flags with the in-memory bits stripped
    pub fn on_disk(self) -> ChunkFlags {
        self & ChunkFlags::ON_DISK_V2
    }
}

/// Location and shape of one chunk's stored data
///
/// `offset` is relative to the start of the segment file owning the chunk.
/// Negative offsets are the "unset" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Segment number (0-based position in the segment file list)
    pub segment_file_id: usize,
    /// File pool entry holding the segment file
    pub pool_entry: usize,
    pub offset: i64,
    pub stored_size: u64,
    pub uncompressed_size: u64,
    pub flags: ChunkFlags,
}

impl ChunkDescriptor {
    pub const UNSET_OFFSET: i64 = -1;

    pub fn is_compressed(&self) -> bool {
        self.flags.contains(ChunkFlags::COMPRESSED)
    }

    pub fn is_patched(&self) -> bool {
        self.flags.contains(ChunkFlags::PATCHED)
    }

    pub fn is_provisional(&self) -> bool {
        self.flags.contains(ChunkFlags::PROVISIONAL)
    }

    pub fn is_corrected(&self) -> bool {
        self.flags.contains(ChunkFlags::CORRECTED)
    }

    pub fn checksum_validated(&self) -> bool {
        self.flags.contains(ChunkFlags::CHECKSUM_VALIDATED)
    }

    pub fn uses_pattern_fill(&self) -> bool {
        self.flags.contains(ChunkFlags::PATTERN_FILL)
    }

    pub fn is_set(&self) -> bool {
        self.offset >= 0 || self.uses_pattern_fill()
    }

    /// End of the stored byte range, exclusive
    pub fn end_offset(&self) -> i64 {
        self.offset.saturating_add(self.stored_size.min(i64::MAX as u64) as i64)
    }

    /// True when both descriptors claim bytes of the same segment file
    pub fn overlaps(&self, other: &ChunkDescriptor) -> bool {
        if self.pool_entry != other.pool_entry || self.uses_pattern_fill() || other.uses_pattern_fill()
        {
            return false;
        }
        self.offset < other.end_offset() && other.offset < self.end_offset()
    }
}
