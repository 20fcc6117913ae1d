//! Section parsing and per-segment section walks
//!
//! v1 segments chain sections forward from the file header through each
//! descriptor's `next` offset. v2 segments store each descriptor after its
//! section data; the last descriptor sits at the very end of the file and
//! the chain is followed backwards through `previous` offsets.

use tracing::{debug, trace, warn};

use crate::chunk_table::{FormatVersion, TableSection};
use crate::common::binary::{adler32, bytes_to_string, u16_at, u32_at, u64_at};
use crate::common::FileIoPool;
use crate::error::{ChunkTableError, Result};

use super::types::*;

/// What a section walk found in one segment file
#[derive(Debug, Clone)]
pub(crate) struct SegmentLayout {
    pub header: FileHeader,
    pub tables: Vec<TableSection>,
    pub volume: Option<VolumeSection>,
}

// =============================================================================
// Parsing
// =============================================================================

pub(crate) fn parse_file_header(buf: &[u8]) -> Result<FileHeader> {
    let signature = buf
        .get(..8)
        .ok_or_else(|| ChunkTableError::MalformedSection("file header truncated".to_string()))?;

    let (format_version, logical) = if signature == EWF_SIGNATURE {
        (FormatVersion::V1, false)
    } else if signature == LVF_SIGNATURE {
        (FormatVersion::V1, true)
    } else if signature == EWF2_SIGNATURE {
        (FormatVersion::V2, false)
    } else if signature == LVF2_SIGNATURE {
        (FormatVersion::V2, true)
    } else {
        return Err(ChunkTableError::MalformedSection(format!(
            "not an EWF segment file (signature {:02x?})",
            signature
        )));
    };

    let segment_number = match format_version {
        FormatVersion::V1 => u16_at(buf, 9)? as u32,
        FormatVersion::V2 => u32_at(buf, 12)?,
    };

    Ok(FileHeader {
        format_version,
        logical,
        segment_number,
    })
}

fn check_descriptor_checksum(buf: &[u8], covered: usize) -> Result<()> {
    let stored = u32_at(buf, covered)?;
    let computed = adler32(&buf[..covered]);
    if stored != computed {
        return Err(ChunkTableError::MalformedSection(format!(
            "section descriptor checksum {:#010x}, computed {:#010x}",
            stored, computed
        )));
    }
    Ok(())
}

pub(crate) fn parse_v1_descriptor(buf: &[u8]) -> Result<V1SectionDescriptor> {
    check_descriptor_checksum(buf, 72)?;
    Ok(V1SectionDescriptor {
        section_type: bytes_to_string(&buf[..16]),
        next_offset: u64_at(buf, 16)?,
        size: u64_at(buf, 24)?,
    })
}

pub(crate) fn parse_v2_descriptor(buf: &[u8]) -> Result<V2SectionDescriptor> {
    check_descriptor_checksum(buf, 60)?;
    Ok(V2SectionDescriptor {
        section_type: u32_at(buf, 0)?,
        data_flags: u32_at(buf, 4)?,
        previous_offset: u64_at(buf, 8)?,
        data_size: u64_at(buf, 16)?,
        padding_size: u32_at(buf, 28)?,
    })
}

pub(crate) fn parse_volume(buf: &[u8]) -> Result<VolumeSection> {
    let _media_and_padding = u32_at(buf, 0)?;
    Ok(VolumeSection {
        chunk_count: u32_at(buf, 4)?,
        sectors_per_chunk: u32_at(buf, 8)?,
        bytes_per_sector: u32_at(buf, 12)?,
        sector_count: u64_at(buf, 16)?,
    })
}

/// (number_of_entries, base_offset)
fn parse_v1_table_header(buf: &[u8]) -> Result<(u32, u64)> {
    let stored = u32_at(buf, 20)?;
    if stored != adler32(&buf[..20]) {
        return Err(ChunkTableError::MalformedSection("table header checksum mismatch".to_string()));
    }
    Ok((u32_at(buf, 0)?, u64_at(buf, 8)?))
}

/// (first_chunk, number_of_entries)
fn parse_v2_table_header(buf: &[u8]) -> Result<(u64, u32)> {
    let stored = u32_at(buf, 16)?;
    if stored != adler32(&buf[..16]) {
        return Err(ChunkTableError::MalformedSection("table header checksum mismatch".to_string()));
    }
    Ok((u64_at(buf, 0)?, u32_at(buf, 8)?))
}

/// Entries followed by their Adler-32
fn entries_intact(data: &[u8], entries_size: usize) -> Result<bool> {
    Ok(u32_at(data, entries_size)? == adler32(&data[..entries_size]))
}

// =============================================================================
// Walking
// =============================================================================

/// Walk the sections of one segment file
pub(crate) fn walk_segment(pool: &mut FileIoPool, file_index: usize) -> Result<SegmentLayout> {
    let file_size = pool.file_size(file_index)?;
    let header_bytes = pool.read_at(file_index, 0, file_size.min(V2_FILE_HEADER_SIZE) as usize)?;
    let header = parse_file_header(&header_bytes)?;

    let layout = match header.format_version {
        FormatVersion::V1 => walk_v1(pool, file_index, header, file_size)?,
        FormatVersion::V2 => walk_v2(pool, file_index, header, file_size)?,
    };

    debug!(
        file_index,
        segment_number = header.segment_number,
        tables = layout.tables.len(),
        tainted = layout.tables.iter().filter(|t| t.tainted).count(),
        "Walked segment sections"
    );
    Ok(layout)
}

fn walk_v1(pool: &mut FileIoPool, file_index: usize, header: FileHeader, file_size: u64) -> Result<SegmentLayout> {
    let mut layout = SegmentLayout {
        header,
        tables: Vec::new(),
        volume: None,
    };
    let mut offset = V1_FILE_HEADER_SIZE;
    let mut sectors_end: Option<u64> = None;
    let mut section_count = 0;

    loop {
        if section_count >= MAX_SECTIONS {
            warn!(file_index, "Reached max sections limit");
            break;
        }
        section_count += 1;

        if offset + V1_DESCRIPTOR_SIZE > file_size {
            warn!(file_index, offset, file_size, "Section chain runs past end of segment");
            break;
        }

        let raw = pool.read_at(file_index, offset, V1_DESCRIPTOR_SIZE as usize)?;
        let descriptor = parse_v1_descriptor(&raw)?;
        let data_offset = offset + V1_DESCRIPTOR_SIZE;
        let section_end = offset.saturating_add(descriptor.size);

        trace!(
            file_index,
            offset,
            section = %descriptor.section_type,
            size = descriptor.size,
            "Section"
        );

        match descriptor.section_type.as_str() {
            "volume" | "disk" => {
                if layout.volume.is_none() {
                    let data = pool.read_at(file_index, data_offset, VOLUME_DATA_SIZE)?;
                    layout.volume = Some(parse_volume(&data)?);
                }
            }
            "sectors" => {
                sectors_end = Some(section_end);
            }
            "table" => {
                // Without a sectors section the chunks precede the table itself
                let chunks_data_end = sectors_end.unwrap_or(offset);
                let table = read_v1_table(pool, file_index, data_offset, section_end, chunks_data_end)?;
                layout.tables.push(table);
            }
            "table2" => {
                trace!("Skipping table2 section (mirror of table)");
            }
            "next" | "done" => break,
            _ => {}
        }

        if descriptor.next_offset <= offset {
            trace!(file_index, "Section chain ended");
            break;
        }
        offset = descriptor.next_offset;
    }

    Ok(layout)
}

fn read_v1_table(
    pool: &mut FileIoPool,
    file_index: usize,
    data_offset: u64,
    section_end: u64,
    chunks_data_end: u64,
) -> Result<TableSection> {
    let header = pool.read_at(file_index, data_offset, V1_TABLE_HEADER_SIZE as usize)?;
    let (number_of_entries, base_offset) = parse_v1_table_header(&header)?;

    let entries_offset = data_offset + V1_TABLE_HEADER_SIZE;
    let entries_size = number_of_entries as u64 * FormatVersion::V1.entry_size() as u64;
    if entries_offset + entries_size + V1_TABLE_FOOTER_SIZE > section_end {
        return Err(ChunkTableError::MalformedSection(format!(
            "{} table entries overrun section ending at {}",
            number_of_entries, section_end
        )));
    }

    let data = pool.read_at(file_index, entries_offset, (entries_size + V1_TABLE_FOOTER_SIZE) as usize)?;
    let tainted = !entries_intact(&data, entries_size as usize)?;
    if tainted {
        warn!(file_index, entries_offset, "Table entries checksum mismatch, table tainted");
    }

    let base_offset = i64::try_from(base_offset)
        .map_err(|_| ChunkTableError::MalformedSection(format!("table base offset {} too large", base_offset)))?;

    trace!(file_index, number_of_entries, base_offset, chunks_data_end, "v1 table");
    Ok(TableSection {
        segment_file_id: file_index,
        pool_entry: file_index,
        format_version: FormatVersion::V1,
        first_chunk: None,
        number_of_entries,
        entries_offset,
        base_offset,
        chunks_data_end: chunks_data_end as i64,
        tainted,
    })
}

fn walk_v2(pool: &mut FileIoPool, file_index: usize, header: FileHeader, file_size: u64) -> Result<SegmentLayout> {
    if file_size < V2_FILE_HEADER_SIZE + V2_DESCRIPTOR_SIZE {
        return Err(ChunkTableError::MalformedSection(format!(
            "segment of {} bytes has no room for a section",
            file_size
        )));
    }

    let mut tables = Vec::new();
    let mut offset = file_size - V2_DESCRIPTOR_SIZE;
    let mut section_count = 0;

    loop {
        if section_count >= MAX_SECTIONS {
            warn!(file_index, "Reached max sections limit");
            break;
        }
        section_count += 1;

        let raw = pool.read_at(file_index, offset, V2_DESCRIPTOR_SIZE as usize)?;
        let descriptor = parse_v2_descriptor(&raw)?;
        let data_offset = offset
            .checked_sub(descriptor.data_size)
            .filter(|&start| start >= V2_FILE_HEADER_SIZE)
            .ok_or_else(|| {
                ChunkTableError::MalformedSection(format!(
                    "section at {} claims {} data bytes",
                    offset, descriptor.data_size
                ))
            })?;

        trace!(
            file_index,
            offset,
            section_type = descriptor.section_type,
            data_size = descriptor.data_size,
            "Section"
        );

        match descriptor.section_type {
            V2_SECTION_SECTOR_TABLE => {
                tables.push(read_v2_table(pool, file_index, data_offset, offset)?);
            }
            V2_SECTION_SECTOR_DATA | V2_SECTION_NEXT | V2_SECTION_DONE => {}
            other => trace!(section_type = other, "Section not needed for chunk access"),
        }

        if descriptor.previous_offset == 0 {
            break;
        }
        if descriptor.previous_offset >= offset {
            return Err(ChunkTableError::MalformedSection(format!(
                "section at {} points forward to {}",
                offset, descriptor.previous_offset
            )));
        }
        offset = descriptor.previous_offset;
    }

    tables.reverse();
    Ok(SegmentLayout {
        header,
        tables,
        volume: None,
    })
}

fn read_v2_table(pool: &mut FileIoPool, file_index: usize, data_offset: u64, section_end: u64) -> Result<TableSection> {
    let header = pool.read_at(file_index, data_offset, V2_TABLE_HEADER_SIZE as usize)?;
    let (first_chunk, number_of_entries) = parse_v2_table_header(&header)?;
    if first_chunk.checked_add(number_of_entries as u64).is_none() {
        return Err(ChunkTableError::MalformedSection(format!(
            "table at chunk {} with {} entries overflows the chunk index",
            first_chunk, number_of_entries
        )));
    }

    let entries_offset = data_offset + V2_TABLE_HEADER_SIZE;
    let entries_size = number_of_entries as u64 * FormatVersion::V2.entry_size() as u64;
    if entries_offset + entries_size + V2_TABLE_FOOTER_SIZE > section_end {
        return Err(ChunkTableError::MalformedSection(format!(
            "{} table entries overrun section ending at {}",
            number_of_entries, section_end
        )));
    }

    let data = pool.read_at(file_index, entries_offset, (entries_size + 4) as usize)?;
    let tainted = !entries_intact(&data, entries_size as usize)?;
    if tainted {
        warn!(file_index, first_chunk, "Table entries checksum mismatch");
    }

    trace!(file_index, first_chunk, number_of_entries, "v2 table");
    Ok(TableSection {
        segment_file_id: file_index,
        pool_entry: file_index,
        format_version: FormatVersion::V2,
        first_chunk: Some(first_chunk),
        number_of_entries,
        entries_offset,
        base_offset: 0,
        chunks_data_end: data_offset as i64,
        tainted,
    })
}
