//! File-backed segment source (like libewf_segment_table)

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::chunk_table::{FormatVersion, MediaValues, SegmentSource, TableSection};
use crate::common::FileIoPool;
use crate::error::{ChunkTableError, Result};

use super::sections::{parse_file_header, walk_segment, SegmentLayout};
use super::types::{FileHeader, VolumeSection, V2_FILE_HEADER_SIZE};

/// The segment files of one image, behind a shared file handle pool
///
/// Section walks are done on first use of a segment and remembered.
pub struct SegmentFiles {
    pool: Mutex<FileIoPool>,
    header: FileHeader,
    layouts: Mutex<HashMap<usize, Arc<SegmentLayout>>>,
}

impl SegmentFiles {
    pub fn open(paths: Vec<PathBuf>, max_open_files: usize) -> Result<Self> {
        if paths.is_empty() {
            return Err(ChunkTableError::ChunkUnavailable {
                segment: 0,
                reason: "no segment files given".to_string(),
            });
        }

        let mut pool = FileIoPool::new(paths, max_open_files);
        let file_size = pool.file_size(0)?;
        let header_bytes = pool.read_at(0, 0, file_size.min(V2_FILE_HEADER_SIZE) as usize)?;
        let header = parse_file_header(&header_bytes)?;

        debug!(
            segments = pool.get_file_count(),
            format_version = ?header.format_version,
            logical = header.logical,
            "Opened segment files"
        );

        Ok(Self {
            pool: Mutex::new(pool),
            header,
            layouts: Mutex::new(HashMap::new()),
        })
    }

    pub fn format_version(&self) -> FormatVersion {
        self.header.format_version
    }

    /// True for logical evidence files (L01/Lx01)
    pub fn is_logical(&self) -> bool {
        self.header.logical
    }

    pub fn path(&self, segment: usize) -> Option<PathBuf> {
        self.pool().get_path(segment).cloned()
    }

    /// Volume section of the first segment (v1 only)
    pub fn volume(&self) -> Result<Option<VolumeSection>> {
        Ok(self.layout(0)?.volume)
    }

    /// Media geometry recorded in the volume section
    pub fn read_media_values(&self) -> Result<MediaValues> {
        let volume = self.volume()?.ok_or_else(|| {
            ChunkTableError::MalformedSection(format!(
                "{:?} image has no volume section, media values must be supplied",
                self.format_version()
            ))
        })?;

        let media_size = volume
            .sector_count
            .checked_mul(volume.bytes_per_sector as u64)
            .ok_or_else(|| ChunkTableError::ValueOutOfRange(format!("{} sectors", volume.sector_count)))?;
        let media = MediaValues::new(media_size, volume.bytes_per_sector, volume.sectors_per_chunk)?;

        if media.number_of_chunks != volume.chunk_count as u64 {
            warn!(
                recorded = volume.chunk_count,
                computed = media.number_of_chunks,
                "Volume chunk count disagrees with sector count"
            );
        }
        Ok(media)
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, FileIoPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn layout(&self, segment: usize) -> Result<Arc<SegmentLayout>> {
        let known = self
            .layouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&segment)
            .cloned();
        if let Some(layout) = known {
            return Ok(layout);
        }

        let layout = walk_segment(&mut self.pool(), segment)?;
        if layout.header.format_version != self.header.format_version {
            return Err(ChunkTableError::MalformedSection(format!(
                "segment {} is {:?}, image is {:?}",
                segment, layout.header.format_version, self.header.format_version
            )));
        }
        if layout.header.segment_number as usize != segment + 1 {
            warn!(
                segment,
                recorded = layout.header.segment_number,
                "Segment number does not match file order"
            );
        }

        let layout = Arc::new(layout);
        self.layouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(segment, Arc::clone(&layout));
        Ok(layout)
    }
}

impl SegmentSource for SegmentFiles {
    fn number_of_segments(&self) -> usize {
        self.pool().get_file_count()
    }

    fn table_sections(&self, segment_file_id: usize) -> Result<Vec<TableSection>> {
        Ok(self.layout(segment_file_id)?.tables.clone())
    }

    fn read_at(&self, pool_entry: usize, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.pool().read_at(pool_entry, offset, length)
    }
}
