//! Table entry codec for the two on-disk table layouts
//!
//! ```text
//! v1 entry (4 bytes, little-endian u32)
//! ┌─┬──────────────────────────────────────┐
//! │C│ offset relative to table base (31b)  │   C = compressed
//! └─┴──────────────────────────────────────┘
//!
//! v2 entry (16 bytes)
//! ┌──────────────────────┬──────────────┬──────────────┐
//! │ chunk data offset u64│ data size u32│ flags u32    │
//! └──────────────────────┴──────────────┴──────────────┘
//! ```
//!
//! v1 entries do not carry a size; it is inferred from the next entry (or
//! the end of the chunk data area) by the reconstruction engine.

use crate::common::binary::{put_u32, put_u64, u32_at, u64_at};
use crate::error::{ChunkTableError, Result};

use super::descriptor::ChunkFlags;

pub const V1_ENTRY_SIZE: usize = 4;
pub const V2_ENTRY_SIZE: usize = 16;
pub const V1_OFFSET_MASK: u32 = 0x7FFF_FFFF;
pub const V1_COMPRESSED_BIT: u32 = 0x8000_0000;

/// Format version of an image's tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatVersion {
    V1,
    V2,
}

impl FormatVersion {
    pub fn entry_size(self) -> usize {
        match self {
            FormatVersion::V1 => V1_ENTRY_SIZE,
            FormatVersion::V2 => V2_ENTRY_SIZE,
        }
    }
}

/// One decoded table entry
///
/// `offset` is absolute within the segment file (or, with
/// [`ChunkFlags::PATTERN_FILL`], the raw 8-byte pattern).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub offset: i64,
    /// Stored size; `None` for v1 entries
    pub size: Option<u64>,
    pub flags: ChunkFlags,
}

// =============================================================================
// v1
// =============================================================================

pub fn decode_v1(raw: &[u8], base_offset: i64) -> Result<TableEntry> {
    if raw.len() != V1_ENTRY_SIZE {
        return Err(ChunkTableError::MalformedEntry(format!(
            "v1 entry must be {} bytes, got {}",
            V1_ENTRY_SIZE,
            raw.len()
        )));
    }
    if base_offset < 0 {
        return Err(ChunkTableError::MalformedEntry(format!(
            "negative table base offset {}",
            base_offset
        )));
    }

    let value = u32_at(raw, 0).map_err(|e| ChunkTableError::MalformedEntry(e.to_string()))?;
    let relative = (value & V1_OFFSET_MASK) as i64;
    let offset = base_offset.checked_add(relative).ok_or_else(|| {
        ChunkTableError::MalformedEntry(format!(
            "offset {} + base {} overflows",
            relative, base_offset
        ))
    })?;

    let flags = if value & V1_COMPRESSED_BIT != 0 {
        ChunkFlags::COMPRESSED
    } else {
        ChunkFlags::empty()
    };

    Ok(TableEntry {
        offset,
        size: None,
        flags,
    })
}

pub fn encode_v1(entry: &TableEntry, base_offset: i64) -> Result<[u8; V1_ENTRY_SIZE]> {
    if entry.offset < 0 || base_offset < 0 {
        return Err(ChunkTableError::ValueOutOfRange(format!(
            "v1 entry offset {} / base {} unset",
            entry.offset, base_offset
        )));
    }
    let unsupported = entry.flags.on_disk() - ChunkFlags::ON_DISK_V1;
    if !unsupported.is_empty() {
        return Err(ChunkTableError::ValueOutOfRange(format!(
            "flags {:?} not representable in a v1 entry",
            unsupported
        )));
    }

    let relative = entry.offset - base_offset;
    if relative < 0 || relative > V1_OFFSET_MASK as i64 {
        return Err(ChunkTableError::ValueOutOfRange(format!(
            "offset {} relative to base {} does not fit 31 bits",
            entry.offset, base_offset
        )));
    }

    let mut value = relative as u32;
    if entry.flags.contains(ChunkFlags::COMPRESSED) {
        value |= V1_COMPRESSED_BIT;
    }
    Ok(value.to_le_bytes())
}

// =============================================================================
// v2
// =============================================================================

pub fn decode_v2(raw: &[u8]) -> Result<TableEntry> {
    if raw.len() != V2_ENTRY_SIZE {
        return Err(ChunkTableError::MalformedEntry(format!(
            "v2 entry must be {} bytes, got {}",
            V2_ENTRY_SIZE,
            raw.len()
        )));
    }
    let malformed = |e: ChunkTableError| ChunkTableError::MalformedEntry(e.to_string());
    let raw_offset = u64_at(raw, 0).map_err(malformed)?;
    let size = u32_at(raw, 8).map_err(malformed)?;
    let raw_flags = u32_at(raw, 12).map_err(malformed)?;

    let flags = ChunkFlags::from_bits(raw_flags)
        .filter(|f| ChunkFlags::ON_DISK_V2.contains(*f))
        .ok_or_else(|| {
            ChunkTableError::MalformedEntry(format!("unknown chunk flags {:#x}", raw_flags))
        })?;
    validate_v2_flags(flags).map_err(ChunkTableError::MalformedEntry)?;

    let offset = if flags.contains(ChunkFlags::PATTERN_FILL) {
        raw_offset as i64
    } else {
        i64::try_from(raw_offset).map_err(|_| {
            ChunkTableError::MalformedEntry(format!("chunk offset {:#x} exceeds 63 bits", raw_offset))
        })?
    };

    Ok(TableEntry {
        offset,
        size: Some(size as u64),
        flags,
    })
}

pub fn encode_v2(entry: &TableEntry) -> Result<[u8; V2_ENTRY_SIZE]> {
    let flags = entry.flags.on_disk();
    validate_v2_flags(flags).map_err(ChunkTableError::ValueOutOfRange)?;

    let size = entry
        .size
        .ok_or_else(|| ChunkTableError::ValueOutOfRange("v2 entry without size".to_string()))?;
    let size = u32::try_from(size).map_err(|_| {
        ChunkTableError::ValueOutOfRange(format!("chunk size {} does not fit 32 bits", size))
    })?;

    if entry.offset < 0 && !flags.contains(ChunkFlags::PATTERN_FILL) {
        return Err(ChunkTableError::ValueOutOfRange(format!(
            "v2 entry offset {} unset",
            entry.offset
        )));
    }

    let mut buf = Vec::with_capacity(V2_ENTRY_SIZE);
    put_u64(&mut buf, entry.offset as u64);
    put_u32(&mut buf, size);
    put_u32(&mut buf, flags.bits());

    let mut out = [0u8; V2_ENTRY_SIZE];
    out.copy_from_slice(&buf);
    Ok(out)
}

fn validate_v2_flags(flags: ChunkFlags) -> std::result::Result<(), String> {
    if flags.contains(ChunkFlags::PATCHED | ChunkFlags::COMPRESSED) {
        return Err("chunk cannot be both patched and compressed".to_string());
    }
    Ok(())
}

// =============================================================================
// Entry runs
// =============================================================================

/// Decode `count` consecutive entries of the given version
pub fn decode_entries(
    data: &[u8],
    count: usize,
    version: FormatVersion,
    base_offset: i64,
) -> Result<Vec<TableEntry>> {
    let entry_size = version.entry_size();
    let needed = count.checked_mul(entry_size).unwrap_or(usize::MAX);
    if data.len() < needed {
        return Err(ChunkTableError::MalformedEntry(format!(
            "{} entries need {} bytes, table holds {}",
            count,
            needed,
            data.len()
        )));
    }

    data[..needed]
        .chunks_exact(entry_size)
        .map(|raw| match version {
            FormatVersion::V1 => decode_v1(raw, base_offset),
            FormatVersion::V2 => decode_v2(raw),
        })
        .collect()
}
