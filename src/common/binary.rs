// Shared binary helpers for EWF structures
//
// Provides consistent little-endian decoding/encoding over byte slices and
// the Adler-32 checksum used by section descriptors, tables and chunks.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::error::{ChunkTableError, Result};

// =============================================================================
// Slice Read Functions
// =============================================================================

fn field<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    buf.get(offset..offset + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            ChunkTableError::MalformedSection(format!(
                "{}-byte field at {} exceeds buffer of {} bytes",
                N,
                offset,
                buf.len()
            ))
        })
}

/// Read u16 little-endian at offset within a buffer
pub fn u16_at(buf: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(field(buf, offset)?))
}

/// Read u32 little-endian at offset within a buffer
pub fn u32_at(buf: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(field(buf, offset)?))
}

/// Read u64 little-endian at offset within a buffer
pub fn u64_at(buf: &[u8], offset: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(field(buf, offset)?))
}

// =============================================================================
// Write Functions
// =============================================================================

/// Append u32 little-endian
pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append u64 little-endian
pub fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

// =============================================================================
// Read at Offset Functions (seek + read)
// =============================================================================

/// Read exact bytes at specific offset
pub fn read_bytes_at(file: &mut File, offset: u64, length: usize) -> std::io::Result<Vec<u8>> {
    if length == 0 {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; length];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Adler-32 as used throughout EWF (initial value 1)
#[inline]
pub fn adler32(data: &[u8]) -> u32 {
    adler2::adler32_slice(data)
}

/// Convert bytes to null-terminated string
pub fn bytes_to_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Copy string bytes into fixed-size array
pub fn string_to_array<const N: usize>(value: &str) -> [u8; N] {
    let mut buf = [0u8; N];
    let bytes = value.as_bytes();
    let len = bytes.len().min(N);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}
