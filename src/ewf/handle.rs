//! ImageHandle - chunk-level access to an EWF image (like libewf_handle)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, trace, warn};

use crate::chunk_table::{
    inflate, max_stored_size, strip_checksum, ChecksumError, ChunkDescriptor, ChunkFlags, ChunkTable,
    FormatVersion, IoValues, MediaValues, OffsetResolver, SegmentSource, TableState,
};
use crate::common::discover_ewf_segments;
use crate::config::ChunkTableConfig;
use crate::error::{ChunkTableError, Result};

use super::segment_files::SegmentFiles;
use super::types::{ChecksumErrorRange, VerifyResult};

/// Decoded chunk contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    pub data: Vec<u8>,
    /// False when the stored checksum did not match or the data did not decode
    pub valid: bool,
}

// =============================================================================
// Image Handle - Main Interface (like libewf_handle)
// =============================================================================

pub struct ImageHandle {
    segments: Arc<SegmentFiles>,
    media: MediaValues,
    table: ChunkTable,
    config: ChunkTableConfig,
}

impl ImageHandle {
    /// Open an image from its first segment file, discovering the rest
    ///
    /// Media geometry comes from the volume section, which only v1 images
    /// carry; use [`ImageHandle::open_with_media`] for v2.
    pub fn open(first_segment: impl AsRef<Path>, config: ChunkTableConfig) -> Result<Self> {
        let paths = discover_ewf_segments(first_segment.as_ref())?;
        let segments = SegmentFiles::open(paths, config.max_open_files)?;
        let media = segments.read_media_values()?;
        Self::from_parts(Arc::new(segments), media, config)
    }

    /// Open an image from explicit segment paths and known media geometry
    pub fn open_with_media(paths: Vec<PathBuf>, media: MediaValues, config: ChunkTableConfig) -> Result<Self> {
        let segments = SegmentFiles::open(paths, config.max_open_files)?;
        Self::from_parts(Arc::new(segments), media, config)
    }

    fn from_parts(segments: Arc<SegmentFiles>, media: MediaValues, config: ChunkTableConfig) -> Result<Self> {
        let io = IoValues {
            chunk_size: media.chunk_size()?,
            format_version: segments.format_version(),
        };
        let table = ChunkTable::new(io, &config)?;

        info!(
            media_size = media.media_size,
            chunks = media.number_of_chunks,
            chunk_size = io.chunk_size,
            format_version = ?io.format_version,
            "Opened EWF image"
        );

        Ok(Self {
            segments,
            media,
            table,
            config,
        })
    }

    pub fn media(&self) -> &MediaValues {
        &self.media
    }

    pub fn table(&self) -> &ChunkTable {
        &self.table
    }

    pub fn segments(&self) -> &SegmentFiles {
        &self.segments
    }

    pub fn format_version(&self) -> FormatVersion {
        self.table.format_version()
    }

    pub fn resolver(&self) -> OffsetResolver<'_> {
        OffsetResolver::new(&self.table, self.segments.as_ref(), &self.media)
    }

    /// Trust state of the table holding a chunk
    pub fn table_state(&self, chunk_index: u64) -> Result<TableState> {
        self.table.table_state(chunk_index, self.segments.as_ref())
    }

    // =========================================================================
    // Chunk Reading
    // =========================================================================

    /// Decode a chunk without touching the checksum error list
    pub fn load_chunk(&self, chunk_index: u64) -> Result<ChunkData> {
        let offset = chunk_index.saturating_mul(self.table.chunk_size() as u64);
        let resolved = self.resolver().get_chunk_data_by_offset(offset)?;
        let descriptor = resolved.descriptor;
        let expected = descriptor.uncompressed_size as usize;

        if descriptor.uses_pattern_fill() {
            let pattern = descriptor.offset.to_le_bytes();
            let data = pattern.iter().copied().cycle().take(expected).collect();
            return Ok(ChunkData { data, valid: true });
        }

        let chunk_size = self.table.chunk_size();
        let limit = max_stored_size(chunk_size);
        if descriptor.stored_size > limit {
            return Err(ChunkTableError::MalformedEntry(format!(
                "chunk {} stored size {} exceeds {}",
                chunk_index, descriptor.stored_size, limit
            )));
        }

        let stored = self
            .segments
            .read_at(descriptor.pool_entry, descriptor.offset as u64, descriptor.stored_size as usize)?;
        let decoded = if descriptor.is_compressed() {
            inflate(&stored, chunk_size as usize).map(|inflated| inflated.data)
        } else {
            verify_uncompressed(&stored, &descriptor, self.format_version())
        };

        let chunk = match decoded {
            Some(mut data) if data.len() >= expected => {
                data.truncate(expected);
                let valid = !descriptor.flags.contains(ChunkFlags::CHECKSUM_FAILED);
                ChunkData { data, valid }
            }
            Some(data) => {
                trace!(chunk_index, got = data.len(), expected, "Chunk shorter than expected");
                ChunkData { data: vec![0u8; expected], valid: false }
            }
            None => ChunkData { data: vec![0u8; expected], valid: false },
        };
        Ok(chunk)
    }

    /// Read a chunk, recording a checksum error when it fails verification
    pub fn read_chunk(&self, chunk_index: u64) -> Result<Vec<u8>> {
        let mut chunk = self.load_chunk(chunk_index)?;
        if !chunk.valid {
            warn!(chunk_index, "Chunk checksum mismatch");
            self.resolver().record_checksum_failure(chunk_index)?;
            if self.config.zero_on_checksum_error {
                chunk.data.fill(0);
            }
        }
        Ok(chunk.data)
    }

    /// Read media bytes at `offset`; returns the number of bytes read
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let chunk_size = self.table.chunk_size() as u64;
        let mut filled = 0usize;

        while filled < buf.len() {
            let position = offset + filled as u64;
            if position >= self.media.media_size {
                break;
            }
            let chunk_index = position / chunk_size;
            let within = (position % chunk_size) as usize;
            let data = self.read_chunk(chunk_index)?;
            if within >= data.len() {
                break;
            }

            let count = (data.len() - within).min(buf.len() - filled);
            buf[filled..filled + count].copy_from_slice(&data[within..within + count]);
            filled += count;
        }

        Ok(filled)
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Check every chunk against its stored checksum
    ///
    /// Decompression and checksumming run on the rayon pool, but reads go
    /// through the shared segment file pool one at a time, so an I/O bound
    /// verification gains little from the extra threads. Failures are
    /// recorded in ascending chunk order afterwards.
    pub fn verify(&self) -> Result<VerifyResult> {
        let chunk_count = self.media.number_of_chunks;
        debug!(chunk_count, "Verifying chunks");

        let outcomes = (0..chunk_count)
            .into_par_iter()
            .map(|chunk_index| Ok((chunk_index, self.load_chunk(chunk_index)?.valid)))
            .collect::<Result<Vec<(u64, bool)>>>()?;

        let failed_chunks: Vec<u64> = outcomes
            .into_iter()
            .filter(|&(_, valid)| !valid)
            .map(|(chunk_index, _)| chunk_index)
            .collect();

        let resolver = self.resolver();
        for &chunk_index in &failed_chunks {
            resolver.record_checksum_failure(chunk_index)?;
        }

        if failed_chunks.is_empty() {
            info!(chunk_count, "All chunks verified");
        } else {
            warn!(chunk_count, failed = failed_chunks.len(), "Chunks failed verification");
            if crate::logging::is_debug_enabled() {
                let errors = self.table.checksum_errors();
                debug!(ranges = errors.count(), sectors = errors.total_sectors(), "Checksum error ranges");
            }
        }

        Ok(VerifyResult {
            chunks_verified: chunk_count,
            failed_chunks,
            checksum_errors: self.checksum_error_ranges(),
        })
    }

    // =========================================================================
    // Checksum Errors
    // =========================================================================

    pub fn number_of_checksum_errors(&self) -> usize {
        self.table.number_of_checksum_errors()
    }

    pub fn checksum_error(&self, index: usize) -> Result<ChecksumError> {
        self.table.checksum_error(index)
    }

    /// Checksum errors with their byte ranges in the media
    pub fn checksum_error_ranges(&self) -> Vec<ChecksumErrorRange> {
        self.table
            .checksum_errors()
            .iter()
            .map(|error| {
                let (offset, length) = error.byte_range(self.media.bytes_per_sector);
                ChecksumErrorRange {
                    start_sector: error.start_sector,
                    number_of_sectors: error.number_of_sectors,
                    offset,
                    length,
                }
            })
            .collect()
    }

}

/// Independent read session over the same segment files
///
/// The clone shares the open files and installed descriptors; its cache
/// and checksum error list are its own.
impl Clone for ImageHandle {
    fn clone(&self) -> Self {
        Self {
            segments: Arc::clone(&self.segments),
            media: self.media,
            table: self.table.clone(),
            config: self.config.clone(),
        }
    }
}

/// Strip and check the trailing Adler-32 of an uncompressed chunk
fn verify_uncompressed(stored: &[u8], descriptor: &ChunkDescriptor, version: FormatVersion) -> Option<Vec<u8>> {
    let has_checksum = match version {
        FormatVersion::V1 => true,
        FormatVersion::V2 => descriptor.flags.contains(ChunkFlags::HAS_CHECKSUM),
    };
    if !has_checksum {
        return Some(stored.to_vec());
    }
    strip_checksum(stored).map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChunkTableError;
    use crate::ewf::test_image::{flip_byte, rewrite_v1_entry, sample_data, write_v1_image, write_v2_image, CHUNK_SIZE};
    use tempfile::TempDir;

    fn open_v1(dir: &TempDir, data: &[u8], per_segment: usize) -> (ImageHandle, crate::ewf::test_image::WrittenImage) {
        let image = write_v1_image(dir.path(), data, per_segment);
        let handle = ImageHandle::open(&image.segments[0].path, ChunkTableConfig::default()).unwrap();
        (handle, image)
    }

    #[test]
    fn test_read_all_chunks_v1() {
        let dir = TempDir::new().unwrap();
        let data = sample_data(5 * CHUNK_SIZE + 1024);
        let (handle, _) = open_v1(&dir, &data, 2);

        assert_eq!(handle.media().number_of_chunks, 6);
        for chunk_index in 0..6u64 {
            let start = chunk_index as usize * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(data.len());
            assert_eq!(handle.read_chunk(chunk_index).unwrap(), &data[start..end]);
        }
        assert_eq!(handle.number_of_checksum_errors(), 0);
    }

    #[test]
    fn test_read_at_spans_chunks_and_segments() {
        let dir = TempDir::new().unwrap();
        let data = sample_data(4 * CHUNK_SIZE);
        let (handle, _) = open_v1(&dir, &data, 2);

        let mut buf = vec![0u8; CHUNK_SIZE + 100];
        let offset = CHUNK_SIZE as u64 + 4000;
        assert_eq!(handle.read_at(offset, &mut buf).unwrap(), buf.len());
        assert_eq!(buf, &data[offset as usize..offset as usize + buf.len()]);

        let mut tail = vec![0u8; 512];
        let read = handle.read_at(data.len() as u64 - 100, &mut tail).unwrap();
        assert_eq!(read, 100);
        assert_eq!(handle.read_at(data.len() as u64, &mut tail).unwrap(), 0);
    }

    #[test]
    fn test_v2_image_with_supplied_media() {
        let dir = TempDir::new().unwrap();
        let data = sample_data(3 * CHUNK_SIZE);
        let image = write_v2_image(dir.path(), &data, 2);
        let handle = ImageHandle::open_with_media(image.paths(), image.media, ChunkTableConfig::default()).unwrap();

        let mut buf = vec![0u8; data.len()];
        assert_eq!(handle.read_at(0, &mut buf).unwrap(), data.len());
        assert_eq!(buf, data);
        assert!(handle.verify().unwrap().is_ok());
    }

    #[test]
    fn test_corrupt_chunk_recorded_and_zeroed() {
        let dir = TempDir::new().unwrap();
        let data = sample_data(4 * CHUNK_SIZE);
        let image = write_v1_image(dir.path(), &data, 4);
        // Chunk 1 is stored uncompressed; damage its payload
        flip_byte(&image.segments[0].path, image.segments[0].chunk_offsets[1] + 100);
        let handle = ImageHandle::open(&image.segments[0].path, ChunkTableConfig::default()).unwrap();

        let chunk = handle.read_chunk(1).unwrap();
        assert!(chunk.iter().all(|&b| b == 0));
        assert_eq!(handle.number_of_checksum_errors(), 1);
        assert_eq!(
            handle.checksum_error(0).unwrap(),
            ChecksumError { start_sector: 8, number_of_sectors: 8 }
        );

        // A second read does not duplicate the range
        handle.read_chunk(1).unwrap();
        assert_eq!(handle.number_of_checksum_errors(), 1);
    }

    #[test]
    fn test_corrupt_data_kept_when_configured() {
        let dir = TempDir::new().unwrap();
        let data = sample_data(2 * CHUNK_SIZE);
        let image = write_v1_image(dir.path(), &data, 2);
        flip_byte(&image.segments[0].path, image.segments[0].chunk_offsets[1] + 10);
        let config = ChunkTableConfig { zero_on_checksum_error: false, ..Default::default() };
        let handle = ImageHandle::open(&image.segments[0].path, config).unwrap();

        let chunk = handle.read_chunk(1).unwrap();
        assert_ne!(chunk, &data[CHUNK_SIZE..]);
        assert!(chunk.iter().any(|&b| b != 0));
        assert_eq!(handle.number_of_checksum_errors(), 1);
    }

    #[test]
    fn test_verify_reports_failures_in_order() {
        let dir = TempDir::new().unwrap();
        let data = sample_data(6 * CHUNK_SIZE);
        let image = write_v1_image(dir.path(), &data, 3);
        // Chunk 4 is compressed, chunk 1 uncompressed
        flip_byte(&image.segments[1].path, image.segments[1].chunk_offsets[1] + 20);
        flip_byte(&image.segments[0].path, image.segments[0].chunk_offsets[1] + 20);
        let handle = ImageHandle::open(&image.segments[0].path, ChunkTableConfig::default()).unwrap();

        let result = handle.verify().unwrap();
        assert_eq!(result.chunks_verified, 6);
        assert_eq!(result.failed_chunks, vec![1, 4]);
        assert_eq!(result.checksum_errors.len(), 2);
        assert_eq!(result.checksum_errors[1].start_sector, 32);
        assert_eq!(result.checksum_errors[1].offset, 4 * CHUNK_SIZE as u64);
        assert_eq!(result.checksum_errors[1].length, CHUNK_SIZE as u64);
    }

    #[test]
    fn test_failures_recorded_in_read_order() {
        let dir = TempDir::new().unwrap();
        let data = sample_data(4 * CHUNK_SIZE);
        let image = write_v1_image(dir.path(), &data, 4);
        // Chunks 1 and 3 are stored uncompressed
        flip_byte(&image.segments[0].path, image.segments[0].chunk_offsets[3] + 30);
        flip_byte(&image.segments[0].path, image.segments[0].chunk_offsets[1] + 30);
        let handle = ImageHandle::open(&image.segments[0].path, ChunkTableConfig::default()).unwrap();

        handle.read_chunk(3).unwrap();
        handle.read_chunk(1).unwrap();
        let ranges: Vec<(u64, u64)> = handle
            .checksum_error_ranges()
            .iter()
            .map(|r| (r.start_sector, r.number_of_sectors))
            .collect();
        assert_eq!(ranges, vec![(8, 8), (24, 8)]);

        // verify agrees with what the reads recorded
        let result = handle.verify().unwrap();
        assert_eq!(result.failed_chunks, vec![1, 3]);
        assert_eq!(result.checksum_errors.len(), 2);
        assert_eq!(handle.number_of_checksum_errors(), 2);
    }

    #[test]
    fn test_oversized_stored_size_rejected() {
        let dir = TempDir::new().unwrap();
        let data = sample_data(2 * CHUNK_SIZE);
        let image = write_v2_image(dir.path(), &data, 2);
        let segment = &image.segments[0];

        // Entry 0 claims a 2 GiB chunk; keep the entry checksum valid
        let entries_at = segment.table_entries_offset as usize;
        let mut bytes = std::fs::read(&segment.path).unwrap();
        bytes[entries_at + 8..entries_at + 12].copy_from_slice(&0x7FFF_FFFFu32.to_le_bytes());
        let checksum = crate::common::binary::adler32(&bytes[entries_at..entries_at + 32]);
        bytes[entries_at + 32..entries_at + 36].copy_from_slice(&checksum.to_le_bytes());
        std::fs::write(&segment.path, bytes).unwrap();

        let handle = ImageHandle::open_with_media(image.paths(), image.media, ChunkTableConfig::default()).unwrap();
        assert!(matches!(handle.load_chunk(0), Err(ChunkTableError::MalformedEntry(_))));
        assert!(handle.read_chunk(0).is_err());
        assert_eq!(handle.read_chunk(1).unwrap(), &data[CHUNK_SIZE..]);
    }

    #[test]
    fn test_v1_chunks_start_at_entry_offset() {
        let dir = TempDir::new().unwrap();
        let data = sample_data(2 * CHUNK_SIZE);
        let image = write_v1_image(dir.path(), &data, 2);
        let handle = ImageHandle::open(&image.segments[0].path, ChunkTableConfig::default()).unwrap();

        let compressed = handle.table().get(0, handle.segments()).unwrap();
        assert_eq!(compressed.offset as u64, image.segments[0].chunk_offsets[0]);
        assert!(compressed.is_compressed());

        // Uncompressed chunk 1 is the data and its Adler-32, nothing more
        let plain = handle.table().get(1, handle.segments()).unwrap();
        assert_eq!(plain.offset as u64, image.segments[0].chunk_offsets[1]);
        assert_eq!(plain.offset as u64, compressed.offset as u64 + compressed.stored_size);
        let bytes = std::fs::read(&image.segments[0].path).unwrap();
        let start = plain.offset as usize;
        assert_eq!(&bytes[start..start + CHUNK_SIZE], &data[CHUNK_SIZE..]);
        assert_eq!(handle.read_chunk(0).unwrap(), &data[..CHUNK_SIZE]);
    }

    #[test]
    fn test_tainted_table_corrected_on_open() {
        let dir = TempDir::new().unwrap();
        let data = sample_data(3 * CHUNK_SIZE);
        let image = write_v1_image(dir.path(), &data, 3);
        rewrite_v1_entry(&image.segments[0], 1, 12);
        let handle = ImageHandle::open(&image.segments[0].path, ChunkTableConfig::default()).unwrap();

        let mut buf = vec![0u8; data.len()];
        handle.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(handle.table_state(0).unwrap(), TableState::Corrected(2));
        assert_eq!(handle.number_of_checksum_errors(), 0);
    }

    #[test]
    fn test_missing_segment_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let data = sample_data(4 * CHUNK_SIZE);
        let image = write_v1_image(dir.path(), &data, 2);
        std::fs::remove_file(&image.segments[1].path).unwrap();
        let handle = ImageHandle::open(&image.segments[0].path, ChunkTableConfig::default()).unwrap();

        assert_eq!(handle.read_chunk(1).unwrap(), &data[CHUNK_SIZE..2 * CHUNK_SIZE]);
        let err = handle.read_chunk(2).unwrap_err();
        assert!(matches!(err, ChunkTableError::ChunkUnavailable { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_clone_independent_sessions() {
        let dir = TempDir::new().unwrap();
        let data = sample_data(2 * CHUNK_SIZE);
        let image = write_v1_image(dir.path(), &data, 2);
        flip_byte(&image.segments[0].path, image.segments[0].chunk_offsets[1] + 10);
        let handle = ImageHandle::open(&image.segments[0].path, ChunkTableConfig::default()).unwrap();

        let session = handle.clone();
        session.read_chunk(1).unwrap();
        assert_eq!(session.number_of_checksum_errors(), 1);
        assert_eq!(handle.number_of_checksum_errors(), 0);
        assert_eq!(session.read_chunk(0).unwrap(), handle.read_chunk(0).unwrap());
    }

    #[test]
    fn test_open_rejects_v2_without_media() {
        let dir = TempDir::new().unwrap();
        let image = write_v2_image(dir.path(), &sample_data(CHUNK_SIZE), 1);
        assert!(ImageHandle::open(&image.segments[0].path, ChunkTableConfig::default()).is_err());
    }
}
