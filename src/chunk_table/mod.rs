//! Chunk table - maps chunk indices to where their data lives in the segment files
//!
//! Layers, bottom-up:
//! - `codec`: v1/v2 table entry encoding
//! - `chunk_data`: zlib streams and Adler-32 trailers of stored chunks
//! - `reconstruct`: filling descriptors from entry runs, correcting tainted v1 tables
//! - `store`: lazily filled, LRU-bounded descriptor cache
//! - `resolver`: media offset → chunk, coordinating the table with the segment files
//!
//! The table never reaches into segment files itself; every operation that
//! needs bytes borrows a [`SegmentSource`] for the duration of the call.

mod checksum_errors;
mod chunk_data;
mod codec;
mod descriptor;
mod reconstruct;
mod resolver;
mod store;
mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::ops::Range;
use std::sync::Mutex;

use crate::config::ChunkTableConfig;
use crate::error::{ChunkTableError, Result};

use store::lock;

pub use checksum_errors::{ChecksumError, ChecksumErrors};
pub use chunk_data::{inflate, max_stored_size, measure_v1_chunk, strip_checksum, Inflated, CHUNK_CHECKSUM_SIZE};
pub use codec::{
    decode_entries, decode_v1, decode_v2, encode_v1, encode_v2, FormatVersion, TableEntry,
    V1_COMPRESSED_BIT, V1_ENTRY_SIZE, V1_OFFSET_MASK, V2_ENTRY_SIZE,
};
pub use descriptor::{ChunkDescriptor, ChunkFlags};
pub use reconstruct::{correct_v1, fill_v1, fill_v2, generate_table_entries_data, CorrectionOutcome, TableState};
pub use resolver::{OffsetResolver, ResolvedChunk};
pub use store::DescriptorStore;
pub use types::{IoValues, MediaValues, SegmentSource, TableSection};

/// Chunk table state of one open image
pub struct ChunkTable {
    io: IoValues,
    store: DescriptorStore,
    checksum_errors: Mutex<ChecksumErrors>,
}

impl ChunkTable {
    pub fn new(io: IoValues, config: &ChunkTableConfig) -> Result<Self> {
        if io.chunk_size == 0 {
            return Err(ChunkTableError::ValueOutOfRange("chunk size must be non-zero".to_string()));
        }
        Ok(Self {
            io,
            store: DescriptorStore::new(io, config),
            checksum_errors: Mutex::new(ChecksumErrors::new()),
        })
    }

    pub fn io_values(&self) -> IoValues {
        self.io
    }

    pub fn chunk_size(&self) -> u32 {
        self.io.chunk_size
    }

    pub fn format_version(&self) -> FormatVersion {
        self.io.format_version
    }

    // -------------------------------------------------------------------------
    // Descriptors
    // -------------------------------------------------------------------------

    pub fn get(&self, chunk_index: u64, source: &dyn SegmentSource) -> Result<ChunkDescriptor> {
        self.store.get(chunk_index, source)
    }

    pub fn set(&self, chunk_index: u64, descriptor: ChunkDescriptor) {
        self.store.set(chunk_index, descriptor)
    }

    pub fn exists(&self, chunk_index: u64, source: &dyn SegmentSource) -> Result<bool> {
        self.store.exists(chunk_index, source)
    }

    pub fn table_state(&self, chunk_index: u64, source: &dyn SegmentSource) -> Result<TableState> {
        self.store.table_state(chunk_index, source)
    }

    pub fn generate_table_entries_data(
        &self,
        chunk_indices: Range<u64>,
        format_version: FormatVersion,
        base_offset: i64,
        source: &dyn SegmentSource,
    ) -> Result<Vec<u8>> {
        self.store
            .generate_table_entries_data(chunk_indices, format_version, base_offset, source)
    }

    pub fn last_chunk_filled(&self) -> Option<u64> {
        self.store.last_chunk_filled()
    }

    pub fn previous_last_chunk_filled(&self) -> Option<u64> {
        self.store.previous_last_chunk_filled()
    }

    pub fn last_chunk_compared(&self) -> Option<u64> {
        self.store.last_chunk_compared()
    }

    pub fn cached_descriptors(&self) -> usize {
        self.store.cached_descriptors()
    }

    // -------------------------------------------------------------------------
    // Checksum errors
    // -------------------------------------------------------------------------

    pub fn append_checksum_error(&self, start_sector: u64, number_of_sectors: u64) -> Result<()> {
        lock(&self.checksum_errors).append(start_sector, number_of_sectors)
    }

    /// Record a failed range in any order, merging with known ranges
    ///
    /// Returns false when the range was already covered.
    pub(crate) fn record_checksum_error(&self, start_sector: u64, number_of_sectors: u64) -> Result<bool> {
        lock(&self.checksum_errors).insert(start_sector, number_of_sectors)
    }

    pub fn number_of_checksum_errors(&self) -> usize {
        lock(&self.checksum_errors).count()
    }

    pub fn checksum_error(&self, index: usize) -> Result<ChecksumError> {
        lock(&self.checksum_errors).get(index)
    }

    /// Snapshot of all checksum error ranges
    pub fn checksum_errors(&self) -> ChecksumErrors {
        lock(&self.checksum_errors).clone()
    }
}

/// Independent copy for another read session
///
/// Shares installed descriptors, starts with an empty cache and a snapshot
/// of the checksum errors.
impl Clone for ChunkTable {
    fn clone(&self) -> Self {
        Self {
            io: self.io,
            store: self.store.clone_for_session(),
            checksum_errors: Mutex::new(self.checksum_errors()),
        }
    }
}

impl std::fmt::Debug for ChunkTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkTable")
            .field("io", &self.io)
            .field("last_chunk_filled", &self.last_chunk_filled())
            .field("checksum_errors", &self.number_of_checksum_errors())
            .finish()
    }
}
