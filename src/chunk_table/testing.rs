//! In-memory segment source for chunk table tests

use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::chunk_table::codec::{encode_v1, encode_v2, FormatVersion, TableEntry};
use crate::common::binary::adler32;
use crate::chunk_table::descriptor::ChunkFlags;
use crate::chunk_table::types::{SegmentSource, TableSection};
use crate::error::{ChunkTableError, Result};

/// One segment file held in memory
pub struct MemorySegment {
    pub bytes: Vec<u8>,
    pub sections: Vec<TableSection>,
}

#[derive(Default)]
pub struct MemorySource {
    pub segments: Vec<MemorySegment>,
    pub missing: HashSet<usize>,
    /// Number of reads per (pool_entry, offset)
    pub reads: Mutex<Vec<(usize, u64)>>,
    pub section_loads: AtomicUsize,
}

impl MemorySource {
    pub fn reads_at(&self, pool_entry: usize, offset: u64) -> usize {
        let reads = self.reads.lock().unwrap();
        reads.iter().filter(|&&r| r == (pool_entry, offset)).count()
    }
}

impl SegmentSource for MemorySource {
    fn number_of_segments(&self) -> usize {
        self.segments.len()
    }

    fn table_sections(&self, segment_file_id: usize) -> Result<Vec<TableSection>> {
        self.section_loads.fetch_add(1, Ordering::SeqCst);
        if self.missing.contains(&segment_file_id) {
            return Err(ChunkTableError::ChunkUnavailable {
                segment: segment_file_id,
                reason: "not mounted".to_string(),
            });
        }
        Ok(self.segments[segment_file_id].sections.clone())
    }

    fn read_at(&self, pool_entry: usize, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.reads.lock().unwrap().push((pool_entry, offset));
        if self.missing.contains(&pool_entry) {
            return Err(ChunkTableError::ChunkUnavailable {
                segment: pool_entry,
                reason: "not mounted".to_string(),
            });
        }
        let bytes = &self.segments[pool_entry].bytes;
        let start = offset as usize;
        bytes
            .get(start..start + length)
            .map(|b| b.to_vec())
            .ok_or_else(|| {
                ChunkTableError::io(
                    format!("read {} at {}", length, offset),
                    std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
                )
            })
    }
}

/// Layout of a v1 segment built by [`v1_segment`]
pub struct V1Layout {
    pub base_offset: i64,
    /// Absolute chunk offsets as written
    pub chunk_offsets: Vec<i64>,
    /// Stored size of each chunk as written
    pub stored_sizes: Vec<u64>,
    pub entries_offset: u64,
    pub chunks_data_end: i64,
}

/// Contents of chunk `index`; compressible, distinct per chunk
pub fn chunk_contents(index: usize, chunk_size: u32) -> Vec<u8> {
    (0..chunk_size as usize)
        .map(|j| ((j / 64) as u8).wrapping_add((index as u8).wrapping_mul(17)))
        .collect()
}

/// Stored form of a chunk: a zlib stream, or the data and its Adler-32
pub fn stored_chunk(data: &[u8], compressed: bool) -> Vec<u8> {
    if compressed {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    } else {
        let mut stored = data.to_vec();
        stored.extend_from_slice(&adler32(data).to_le_bytes());
        stored
    }
}

/// Build a v1 segment with one stored chunk per `compressed` flag
///
/// Chunk data starts at `base_offset`; the entry table follows the chunk data.
pub fn v1_segment(
    segment_file_id: usize,
    base_offset: i64,
    chunk_size: u32,
    compressed: &[bool],
) -> (MemorySegment, V1Layout) {
    let mut bytes = vec![0u8; base_offset as usize];
    let mut chunk_offsets = Vec::new();
    let mut stored_sizes = Vec::new();
    for (i, &compressed) in compressed.iter().enumerate() {
        chunk_offsets.push(bytes.len() as i64);
        let stored = stored_chunk(&chunk_contents(i, chunk_size), compressed);
        stored_sizes.push(stored.len() as u64);
        bytes.extend(stored);
    }
    let chunks_data_end = bytes.len() as i64;

    let entries_offset = bytes.len() as u64;
    for (i, &offset) in chunk_offsets.iter().enumerate() {
        let flags = if compressed[i] {
            ChunkFlags::COMPRESSED
        } else {
            ChunkFlags::empty()
        };
        let entry = TableEntry { offset, size: None, flags };
        bytes.extend_from_slice(&encode_v1(&entry, base_offset).unwrap());
    }

    let section = TableSection {
        segment_file_id,
        pool_entry: segment_file_id,
        format_version: FormatVersion::V1,
        first_chunk: None,
        number_of_entries: compressed.len() as u32,
        entries_offset,
        base_offset,
        chunks_data_end,
        tainted: false,
    };

    (
        MemorySegment { bytes, sections: vec![section] },
        V1Layout { base_offset, chunk_offsets, stored_sizes, entries_offset, chunks_data_end },
    )
}

/// Overwrite the declared offset of one v1 entry, marking the table tainted
pub fn taint_v1_entry(segment: &mut MemorySegment, layout: &V1Layout, index: usize, offset: i64) {
    let entry = TableEntry { offset, size: None, flags: ChunkFlags::empty() };
    let raw = encode_v1(&entry, layout.base_offset).unwrap();
    let at = layout.entries_offset as usize + index * 4;
    segment.bytes[at..at + 4].copy_from_slice(&raw);
    segment.sections[0].tainted = true;
}

/// Build a v2 segment with `count` chunks of `stored_size` bytes each
pub fn v2_segment(segment_file_id: usize, first_chunk: u64, count: usize, stored_size: u64) -> MemorySegment {
    let data_start = 64usize;
    let mut bytes = vec![0u8; data_start];
    let mut entries = Vec::new();
    for i in 0..count {
        let entry = TableEntry {
            offset: bytes.len() as i64,
            size: Some(stored_size),
            flags: if i % 2 == 0 { ChunkFlags::COMPRESSED } else { ChunkFlags::HAS_CHECKSUM },
        };
        bytes.extend(std::iter::repeat(0xAB).take(stored_size as usize));
        entries.push(entry);
    }
    let chunks_data_end = bytes.len() as i64;
    let entries_offset = bytes.len() as u64;
    for entry in &entries {
        bytes.extend_from_slice(&encode_v2(entry).unwrap());
    }

    MemorySegment {
        bytes,
        sections: vec![TableSection {
            segment_file_id,
            pool_entry: segment_file_id,
            format_version: FormatVersion::V2,
            first_chunk: Some(first_chunk),
            number_of_entries: count as u32,
            entries_offset,
            base_offset: 0,
            chunks_data_end,
            tainted: false,
        }],
    }
}
