//! Stored chunk data - zlib streams and Adler-32 trailers
//!
//! A table entry points straight at a chunk's stored bytes; there is no
//! per-chunk header. A compressed chunk is a zlib stream, an uncompressed
//! chunk is its data followed by the Adler-32 of that data (always in v1,
//! when the entry says so in v2).
//!
//! ```text
//! compressed:    ┌──────────────────────────────┐
//!                │ zlib stream (ends itself)    │
//!                └──────────────────────────────┘
//! uncompressed:  ┌──────────────────────┬───────┐
//!                │ chunk_size bytes     │adler32│
//!                └──────────────────────┴───────┘
//! ```
//!
//! Both forms are self-delimiting, which is what lets a tainted v1 table be
//! checked against the chunks themselves.

use flate2::{Decompress, FlushDecompress, Status};
use tracing::trace;

use crate::common::binary::{adler32, u32_at};

/// Size of the Adler-32 trailer of an uncompressed chunk
pub const CHUNK_CHECKSUM_SIZE: usize = 4;

/// Largest stored size accepted for one chunk
///
/// A zlib stream of incompressible data grows a little past the chunk
/// size; anything beyond twice the chunk size is not a chunk.
pub fn max_stored_size(chunk_size: u32) -> u64 {
    chunk_size as u64 * 2
}

/// A fully decoded zlib stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inflated {
    pub data: Vec<u8>,
    /// Bytes of input the stream occupied
    pub stored_size: u64,
}

/// Inflate one zlib stream, producing at most `max_output` bytes
///
/// Input after the end of the stream is ignored. Returns None when the
/// stream is corrupt, truncated or would inflate past `max_output`.
pub fn inflate(stored: &[u8], max_output: usize) -> Option<Inflated> {
    let mut decompress = Decompress::new(true);
    // One spare byte so an oversized stream shows up as overflow
    let mut data = Vec::with_capacity(max_output.saturating_add(1));

    match decompress.decompress_vec(stored, &mut data, FlushDecompress::Finish) {
        Ok(Status::StreamEnd) if data.len() <= max_output => Some(Inflated {
            data,
            stored_size: decompress.total_in(),
        }),
        Ok(status) => {
            trace!(?status, produced = data.len(), max_output, "Zlib stream incomplete or oversized");
            None
        }
        Err(e) => {
            trace!(error = %e, "Zlib stream corrupt");
            None
        }
    }
}

/// Split off and check the trailing Adler-32 of an uncompressed chunk
pub fn strip_checksum(stored: &[u8]) -> Option<&[u8]> {
    let data_len = stored.len().checked_sub(CHUNK_CHECKSUM_SIZE)?;
    let expected = u32_at(stored, data_len).ok()?;
    let data = &stored[..data_len];
    (adler32(data) == expected).then_some(data)
}

/// Measure the v1 chunk at the start of `window`: (stored size, compressed)
///
/// `window` runs from the chunk start to the end of the readable chunk
/// data. An uncompressed chunk is recognised by a matching Adler-32 after
/// `chunk_size` bytes, or at the end of the window for a short last chunk;
/// otherwise the window must open with a complete zlib stream.
pub fn measure_v1_chunk(window: &[u8], chunk_size: u32) -> Option<(u64, bool)> {
    let full = chunk_size as usize + CHUNK_CHECKSUM_SIZE;
    let candidate = &window[..window.len().min(full)];
    if candidate.len() > CHUNK_CHECKSUM_SIZE && strip_checksum(candidate).is_some() {
        return Some((candidate.len() as u64, false));
    }

    inflate(window, chunk_size as usize).map(|inflated| (inflated.stored_size, true))
}
