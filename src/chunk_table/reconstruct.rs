//! Table reconstruction - turns table entry runs into chunk descriptors
//!
//! v1 tables only record where each chunk starts, so a chunk's stored size
//! is the distance to the next entry; the last entry of a table runs up to
//! the end of the chunk data area. When a v1 table is tainted its entries
//! are filled provisionally and then compared against the chunks
//! themselves, which are ground truth: a compressed chunk ends where its
//! zlib stream ends, an uncompressed one after `chunk_size` bytes and a
//! matching Adler-32.
//!
//! Per table section:
//!
//! ```text
//! Untrusted ──begin_verification──▶ Verifying ──complete──▶ Trusted
//!     ▲                                 │                  Corrected(n)
//!     └────────────abort (I/O error)────┘
//! ```

use tracing::{debug, trace, warn};

use crate::error::{ChunkTableError, Result};

use super::chunk_data::{max_stored_size, measure_v1_chunk};
use super::codec::{decode_entries, decode_v1, encode_v1, encode_v2, FormatVersion, TableEntry, V1_ENTRY_SIZE};
use super::descriptor::{ChunkDescriptor, ChunkFlags};
use super::types::{SegmentSource, TableSection};

// =============================================================================
// Table State
// =============================================================================

/// Trust state of one table section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// Tainted and not yet compared against the chunk data
    Untrusted,
    /// Chunk scan in progress
    Verifying,
    Trusted,
    /// Chunk scan replaced this many entries
    Corrected(u32),
}

impl TableState {
    pub fn initial(section: &TableSection) -> Self {
        if section.tainted && section.format_version == FormatVersion::V1 {
            TableState::Untrusted
        } else {
            TableState::Trusted
        }
    }

    /// Untrusted → Verifying; false when no scan is allowed
    pub fn begin_verification(&mut self) -> bool {
        if *self == TableState::Untrusted {
            *self = TableState::Verifying;
            true
        } else {
            false
        }
    }

    /// Verifying → Trusted | Corrected(n)
    pub fn complete(&mut self, outcome: &CorrectionOutcome) {
        if *self == TableState::Verifying {
            *self = match outcome.corrected {
                0 => TableState::Trusted,
                n => TableState::Corrected(n),
            };
        }
    }

    /// Verifying → Untrusted, so the scan is retried on next access
    pub fn abort(&mut self) {
        if *self == TableState::Verifying {
            *self = TableState::Untrusted;
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TableState::Trusted | TableState::Corrected(_))
    }
}

/// Result of comparing a tainted table against the chunk data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrectionOutcome {
    /// Entries replaced by values measured from the chunk data
    pub corrected: u32,
    /// Entries whose chunk could not be measured; declared values kept
    pub unverifiable: u32,
}

// =============================================================================
// Fill
// =============================================================================

enum Declared {
    Valid(ChunkDescriptor),
    Inconsistent(ChunkDescriptor, String),
    Undecodable(String),
}

fn descriptor(section: &TableSection, entry: &TableEntry, stored_size: u64, chunk_size: u32) -> ChunkDescriptor {
    ChunkDescriptor {
        segment_file_id: section.segment_file_id,
        pool_entry: section.pool_entry,
        offset: entry.offset,
        stored_size,
        uncompressed_size: chunk_size as u64,
        flags: entry.flags,
    }
}

fn unset_descriptor(section: &TableSection, chunk_size: u32) -> ChunkDescriptor {
    ChunkDescriptor {
        segment_file_id: section.segment_file_id,
        pool_entry: section.pool_entry,
        offset: ChunkDescriptor::UNSET_OFFSET,
        stored_size: 0,
        uncompressed_size: chunk_size as u64,
        flags: ChunkFlags::empty(),
    }
}

/// Decode a v1 run entry by entry, inferring sizes from the following entry
fn declare_v1(section: &TableSection, entries: &[u8], chunk_size: u32) -> Result<Vec<Declared>> {
    let count = section.number_of_entries as usize;
    let needed = count * V1_ENTRY_SIZE;
    if entries.len() < needed {
        return Err(ChunkTableError::MalformedEntry(format!(
            "{} v1 entries need {} bytes, table holds {}",
            count,
            needed,
            entries.len()
        )));
    }

    let decoded: Vec<Result<TableEntry>> = entries[..needed]
        .chunks_exact(V1_ENTRY_SIZE)
        .map(|raw| decode_v1(raw, section.base_offset))
        .collect();

    let mut declared = Vec::with_capacity(count);
    for (i, entry) in decoded.iter().enumerate() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                declared.push(Declared::Undecodable(e.to_string()));
                continue;
            }
        };

        let end = if i + 1 < count {
            decoded[i + 1].as_ref().ok().map(|next| next.offset)
        } else {
            Some(section.chunks_data_end)
        };

        let declared_entry = match end {
            None => Declared::Inconsistent(
                descriptor(section, entry, 0, chunk_size),
                "following entry undecodable".to_string(),
            ),
            Some(end) if end <= entry.offset => Declared::Inconsistent(
                descriptor(section, entry, 0, chunk_size),
                format!("next offset {} not after {}", end, entry.offset),
            ),
            Some(end) if end > section.chunks_data_end => Declared::Inconsistent(
                descriptor(section, entry, (end - entry.offset) as u64, chunk_size),
                format!("chunk ends at {} past data end {}", end, section.chunks_data_end),
            ),
            Some(end) => Declared::Valid(descriptor(section, entry, (end - entry.offset) as u64, chunk_size)),
        };
        declared.push(declared_entry);
    }
    Ok(declared)
}

/// Fill descriptors for a v1 table entry run
///
/// Tainted runs never fail on inconsistent entries; every descriptor is
/// marked provisional until [`correct_v1`] has compared it.
pub fn fill_v1(
    section: &TableSection,
    base_chunk: u64,
    entries: &[u8],
    chunk_size: u32,
    tainted: bool,
) -> Result<Vec<ChunkDescriptor>> {
    let declared = declare_v1(section, entries, chunk_size)?;
    let mut descriptors = Vec::with_capacity(declared.len());

    for (i, entry) in declared.into_iter().enumerate() {
        let chunk_index = base_chunk + i as u64;
        let mut d = match entry {
            Declared::Valid(d) => d,
            Declared::Inconsistent(d, reason) if tainted => {
                trace!(chunk_index, %reason, "Inconsistent entry in tainted table");
                d
            }
            Declared::Undecodable(reason) if tainted => {
                trace!(chunk_index, %reason, "Undecodable entry in tainted table");
                unset_descriptor(section, chunk_size)
            }
            Declared::Inconsistent(_, reason) | Declared::Undecodable(reason) => {
                return Err(ChunkTableError::MalformedEntry(format!(
                    "chunk {}: {}",
                    chunk_index, reason
                )));
            }
        };
        if tainted {
            d.flags |= ChunkFlags::PROVISIONAL;
        }
        descriptors.push(d);
    }

    debug!(
        segment = section.segment_file_id,
        base_chunk,
        entries = descriptors.len(),
        tainted,
        "Filled v1 table"
    );
    Ok(descriptors)
}

/// Fill descriptors for a v2 table entry run; sizes are explicit
pub fn fill_v2(
    section: &TableSection,
    base_chunk: u64,
    entries: &[u8],
    chunk_size: u32,
) -> Result<Vec<ChunkDescriptor>> {
    let decoded = decode_entries(
        entries,
        section.number_of_entries as usize,
        FormatVersion::V2,
        section.base_offset,
    )?;

    let descriptors: Vec<ChunkDescriptor> = decoded
        .iter()
        .map(|entry| descriptor(section, entry, entry.size.unwrap_or(0), chunk_size))
        .collect();

    debug!(
        segment = section.segment_file_id,
        base_chunk,
        entries = descriptors.len(),
        "Filled v2 table"
    );
    Ok(descriptors)
}

// =============================================================================
// Correct
// =============================================================================

/// Compare a tainted v1 run against the chunk data in the segment file
///
/// Walks the chunks from the first declared offset, measuring each one
/// from its own bytes (see [`measure_v1_chunk`]). Measured values always
/// win: mismatching descriptors are replaced in `descriptors` and flagged
/// [`ChunkFlags::CORRECTED`]. A chunk that cannot be measured keeps the
/// declared entry and the walk resumes at the next declared offset. I/O
/// errors propagate.
pub fn correct_v1(
    section: &TableSection,
    base_chunk: u64,
    entries: &[u8],
    chunk_size: u32,
    source: &dyn SegmentSource,
    descriptors: &mut [ChunkDescriptor],
) -> Result<CorrectionOutcome> {
    let declared = declare_v1(section, entries, chunk_size)?;
    if descriptors.len() != declared.len() {
        return Err(ChunkTableError::IndexOutOfRange {
            index: descriptors.len(),
            count: declared.len(),
        });
    }

    let mut outcome = CorrectionOutcome::default();
    let mut position: Option<i64> = None;

    for (i, entry) in declared.into_iter().enumerate() {
        let chunk_index = base_chunk + i as u64;
        let declared_descriptor = match entry {
            Declared::Valid(d) | Declared::Inconsistent(d, _) => Some(d),
            Declared::Undecodable(_) => None,
        };

        let start = position.or(declared_descriptor.map(|d| d.offset));
        let truth = match start {
            Some(start) => read_ground_truth(section, start, chunk_size, source)?,
            None => None,
        };

        let Some(truth) = truth else {
            outcome.unverifiable += 1;
            warn!(chunk_index, "Chunk data not measurable, keeping declared entry");
            let mut kept = declared_descriptor.unwrap_or_else(|| unset_descriptor(section, chunk_size));
            kept.flags -= ChunkFlags::PROVISIONAL;
            descriptors[i] = kept;
            position = None;
            continue;
        };

        position = Some(truth.end_offset());
        let matches = declared_descriptor.is_some_and(|d| {
            d.offset == truth.offset
                && d.stored_size == truth.stored_size
                && d.is_compressed() == truth.is_compressed()
        });

        if matches {
            let mut trusted = truth;
            trusted.flags -= ChunkFlags::CORRECTED;
            descriptors[i] = trusted;
        } else {
            outcome.corrected += 1;
            trace!(
                chunk_index,
                declared = ?declared_descriptor.map(|d| (d.offset, d.stored_size)),
                actual = ?(truth.offset, truth.stored_size),
                "Corrected table entry"
            );
            descriptors[i] = truth;
        }
    }

    if outcome.corrected > 0 || outcome.unverifiable > 0 {
        warn!(
            segment = section.segment_file_id,
            base_chunk,
            corrected = outcome.corrected,
            unverifiable = outcome.unverifiable,
            "Tainted table corrected from chunk data"
        );
    } else {
        debug!(segment = section.segment_file_id, base_chunk, "Tainted table verified intact");
    }
    Ok(outcome)
}

/// Measure the chunk stored at `start`, reading at most one chunk's worth
fn read_ground_truth(
    section: &TableSection,
    start: i64,
    chunk_size: u32,
    source: &dyn SegmentSource,
) -> Result<Option<ChunkDescriptor>> {
    if start < 0 || start >= section.chunks_data_end {
        return Ok(None);
    }

    let available = (section.chunks_data_end - start) as u64;
    let length = available.min(max_stored_size(chunk_size)) as usize;
    let window = source.read_at(section.pool_entry, start as u64, length)?;
    let Some((stored_size, compressed)) = measure_v1_chunk(&window, chunk_size) else {
        trace!(offset = start, length, "Chunk data not measurable");
        return Ok(None);
    };

    let mut flags = ChunkFlags::CORRECTED;
    if compressed {
        flags |= ChunkFlags::COMPRESSED;
    }
    Ok(Some(ChunkDescriptor {
        segment_file_id: section.segment_file_id,
        pool_entry: section.pool_entry,
        offset: start,
        stored_size,
        uncompressed_size: chunk_size as u64,
        flags,
    }))
}

// =============================================================================
// Generate
// =============================================================================

/// Encode descriptors back into on-disk table entries
pub fn generate_table_entries_data(
    descriptors: &[ChunkDescriptor],
    format_version: FormatVersion,
    base_offset: i64,
) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(descriptors.len() * format_version.entry_size());
    for d in descriptors {
        match format_version {
            FormatVersion::V1 => {
                let entry = TableEntry {
                    offset: d.offset,
                    size: None,
                    flags: d.flags & ChunkFlags::ON_DISK_V1,
                };
                data.extend_from_slice(&encode_v1(&entry, base_offset)?);
            }
            FormatVersion::V2 => {
                let entry = TableEntry {
                    offset: d.offset,
                    size: Some(d.stored_size),
                    flags: d.flags.on_disk(),
                };
                data.extend_from_slice(&encode_v2(&entry)?);
            }
        }
    }
    Ok(data)
}
