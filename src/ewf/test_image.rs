//! Writes small v1/v2 segment files for tests
//!
//! Chunks are 4096 bytes (8 sectors of 512). Even chunks are stored
//! zlib-compressed, odd chunks uncompressed with a trailing Adler-32.
//! Table entries point straight at the stored bytes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::chunk_table::{encode_v1, encode_v2, ChunkFlags, MediaValues, TableEntry};
use crate::common::binary::{adler32, put_u32, put_u64, string_to_array};
use crate::common::segment_extension;

use super::types::*;

pub const SECTORS_PER_CHUNK: u32 = 8;
pub const BYTES_PER_SECTOR: u32 = 512;
pub const CHUNK_SIZE: usize = (SECTORS_PER_CHUNK * BYTES_PER_SECTOR) as usize;

pub struct WrittenSegment {
    pub path: PathBuf,
    /// Absolute offsets of the chunks stored in this segment
    pub chunk_offsets: Vec<u64>,
    pub table_entries_offset: u64,
    pub base_offset: u64,
}

pub struct WrittenImage {
    pub segments: Vec<WrittenSegment>,
    pub media: MediaValues,
}

impl WrittenImage {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.segments.iter().map(|s| s.path.clone()).collect()
    }
}

/// Deterministic, partly compressible test data; length should be a multiple of 512
pub fn sample_data(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / 512) as u8).wrapping_mul(31) ^ (i % 7) as u8)
        .collect()
}

fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn with_checksum(data: &[u8]) -> Vec<u8> {
    let mut payload = data.to_vec();
    put_u32(&mut payload, adler32(data));
    payload
}

fn segment_path(dir: &Path, number: u32, v2: bool) -> PathBuf {
    dir.join(format!("image.{}", segment_extension('E', number, v2).unwrap()))
}

// =============================================================================
// v1
// =============================================================================

pub fn v1_descriptor(section_type: &str, next_offset: u64, size: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(V1_DESCRIPTOR_SIZE as usize);
    buf.extend_from_slice(&string_to_array::<16>(section_type));
    put_u64(&mut buf, next_offset);
    put_u64(&mut buf, size);
    buf.resize(72, 0);
    let checksum = adler32(&buf);
    put_u32(&mut buf, checksum);
    buf
}

fn push_v1_section(file: &mut Vec<u8>, section_type: &str, data: &[u8]) {
    let offset = file.len() as u64;
    let size = V1_DESCRIPTOR_SIZE + data.len() as u64;
    file.extend(v1_descriptor(section_type, offset + size, size));
    file.extend_from_slice(data);
}

pub fn write_v1_image(dir: &Path, data: &[u8], chunks_per_segment: usize) -> WrittenImage {
    let chunks: Vec<&[u8]> = data.chunks(CHUNK_SIZE).collect();
    let groups: Vec<&[&[u8]]> = chunks.chunks(chunks_per_segment).collect();
    let mut segments = Vec::new();

    for (i, group) in groups.iter().enumerate() {
        let number = i as u32 + 1;
        let mut file = EWF_SIGNATURE.to_vec();
        file.push(1);
        file.extend_from_slice(&(number as u16).to_le_bytes());
        file.extend_from_slice(&[0, 0]);

        if i == 0 {
            let mut volume = Vec::new();
            put_u32(&mut volume, 1);
            put_u32(&mut volume, chunks.len() as u32);
            put_u32(&mut volume, SECTORS_PER_CHUNK);
            put_u32(&mut volume, BYTES_PER_SECTOR);
            put_u64(&mut volume, data.len().div_ceil(BYTES_PER_SECTOR as usize) as u64);
            volume.resize(94, 0);
            push_v1_section(&mut file, "volume", &volume);
        }

        let base_offset = file.len() as u64 + V1_DESCRIPTOR_SIZE;
        let mut sectors = Vec::new();
        let mut chunk_offsets = Vec::new();
        let mut entries = Vec::new();
        for (j, chunk) in group.iter().enumerate() {
            let compressed = (i * chunks_per_segment + j) % 2 == 0;
            let payload = if compressed { compress(chunk) } else { with_checksum(chunk) };
            let offset = base_offset + sectors.len() as u64;
            chunk_offsets.push(offset);
            sectors.extend(payload);

            let flags = if compressed { ChunkFlags::COMPRESSED } else { ChunkFlags::empty() };
            let entry = TableEntry { offset: offset as i64, size: None, flags };
            entries.extend(encode_v1(&entry, base_offset as i64).unwrap());
        }
        push_v1_section(&mut file, "sectors", &sectors);

        let mut table = Vec::new();
        put_u32(&mut table, group.len() as u32);
        put_u32(&mut table, 0);
        put_u64(&mut table, base_offset);
        put_u32(&mut table, 0);
        let checksum = adler32(&table);
        put_u32(&mut table, checksum);
        table.extend_from_slice(&entries);
        put_u32(&mut table, adler32(&entries));

        let table_entries_offset = file.len() as u64 + V1_DESCRIPTOR_SIZE + V1_TABLE_HEADER_SIZE;
        push_v1_section(&mut file, "table", &table);
        push_v1_section(&mut file, "table2", &table);

        let offset = file.len() as u64;
        let last = i + 1 == groups.len();
        file.extend(v1_descriptor(if last { "done" } else { "next" }, offset, V1_DESCRIPTOR_SIZE));

        let path = segment_path(dir, number, false);
        fs::write(&path, &file).unwrap();
        segments.push(WrittenSegment {
            path,
            chunk_offsets,
            table_entries_offset,
            base_offset,
        });
    }

    WrittenImage {
        segments,
        media: MediaValues::new(data.len() as u64, BYTES_PER_SECTOR, SECTORS_PER_CHUNK).unwrap(),
    }
}

/// Overwrite one v1 entry without updating the table footer
pub fn rewrite_v1_entry(segment: &WrittenSegment, index: usize, relative_offset: u32) {
    let at = segment.table_entries_offset as usize + index * 4;
    let mut bytes = fs::read(&segment.path).unwrap();
    let compressed = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) & 0x8000_0000;
    bytes[at..at + 4].copy_from_slice(&(relative_offset | compressed).to_le_bytes());
    fs::write(&segment.path, bytes).unwrap();
}

// =============================================================================
// v2
// =============================================================================

fn v2_descriptor(section_type: u32, previous_offset: u64, data_size: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(V2_DESCRIPTOR_SIZE as usize);
    put_u32(&mut buf, section_type);
    put_u32(&mut buf, 0);
    put_u64(&mut buf, previous_offset);
    put_u64(&mut buf, data_size);
    put_u32(&mut buf, V2_DESCRIPTOR_SIZE as u32);
    put_u32(&mut buf, 0);
    buf.resize(60, 0);
    let checksum = adler32(&buf);
    put_u32(&mut buf, checksum);
    buf
}

/// Append section data and its trailing descriptor; returns the descriptor offset
fn push_v2_section(file: &mut Vec<u8>, section_type: u32, previous_offset: u64, data: &[u8]) -> u64 {
    file.extend_from_slice(data);
    let offset = file.len() as u64;
    file.extend(v2_descriptor(section_type, previous_offset, data.len() as u64));
    offset
}

pub fn write_v2_image(dir: &Path, data: &[u8], chunks_per_segment: usize) -> WrittenImage {
    let chunks: Vec<&[u8]> = data.chunks(CHUNK_SIZE).collect();
    let groups: Vec<&[&[u8]]> = chunks.chunks(chunks_per_segment).collect();
    let mut segments = Vec::new();

    for (i, group) in groups.iter().enumerate() {
        let number = i as u32 + 1;
        let mut file = EWF2_SIGNATURE.to_vec();
        file.extend_from_slice(&[2, 1]);
        file.extend_from_slice(&1u16.to_le_bytes());
        put_u32(&mut file, number);
        file.resize(V2_FILE_HEADER_SIZE as usize, 0);

        let first_chunk = (i * chunks_per_segment) as u64;
        let data_start = file.len() as u64;
        let mut sectors = Vec::new();
        let mut chunk_offsets = Vec::new();
        let mut entries = Vec::new();
        for (j, chunk) in group.iter().enumerate() {
            let compressed = (first_chunk as usize + j) % 2 == 0;
            let payload = if compressed { compress(chunk) } else { with_checksum(chunk) };
            let offset = data_start + sectors.len() as u64;
            chunk_offsets.push(offset);

            let flags = if compressed { ChunkFlags::COMPRESSED } else { ChunkFlags::HAS_CHECKSUM };
            let entry = TableEntry { offset: offset as i64, size: Some(payload.len() as u64), flags };
            entries.extend(encode_v2(&entry).unwrap());
            sectors.extend(payload);
        }
        let previous = push_v2_section(&mut file, V2_SECTION_SECTOR_DATA, 0, &sectors);

        let mut table = Vec::new();
        put_u64(&mut table, first_chunk);
        put_u32(&mut table, group.len() as u32);
        put_u32(&mut table, 0);
        let checksum = adler32(&table);
        put_u32(&mut table, checksum);
        table.resize(V2_TABLE_HEADER_SIZE as usize, 0);
        table.extend_from_slice(&entries);
        put_u32(&mut table, adler32(&entries));
        table.resize(table.len() + 12, 0);

        let table_entries_offset = file.len() as u64 + V2_TABLE_HEADER_SIZE;
        let previous = push_v2_section(&mut file, V2_SECTION_SECTOR_TABLE, previous, &table);

        let last = i + 1 == groups.len();
        let closing = if last { V2_SECTION_DONE } else { V2_SECTION_NEXT };
        push_v2_section(&mut file, closing, previous, &[]);

        let path = segment_path(dir, number, true);
        fs::write(&path, &file).unwrap();
        segments.push(WrittenSegment {
            path,
            chunk_offsets,
            table_entries_offset,
            base_offset: 0,
        });
    }

    WrittenImage {
        segments,
        media: MediaValues::new(data.len() as u64, BYTES_PER_SECTOR, SECTORS_PER_CHUNK).unwrap(),
    }
}

/// Flip every bit of one byte in a file
pub fn flip_byte(path: &Path, offset: u64) {
    let mut bytes = fs::read(path).unwrap();
    bytes[offset as usize] ^= 0xFF;
    fs::write(path, bytes).unwrap();
}
