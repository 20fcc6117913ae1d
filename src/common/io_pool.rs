// File I/O pool for managing multiple segment file handles
//
// Provides LRU caching for file handles when working with multi-segment
// EWF images to avoid exceeding OS file descriptor limits.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::PathBuf;
use tracing::{debug, trace};

use crate::error::{ChunkTableError, Result};

use super::binary::read_bytes_at;

// =============================================================================
// File I/O Pool - Like libbfio_pool
// =============================================================================

/// Manages multiple file handles with LRU caching
/// Limits number of simultaneously open files to avoid OS limits
pub struct FileIoPool {
    /// Paths to all segment files in order
    file_paths: Vec<PathBuf>,
    /// Currently open file handles (file_index -> File)
    open_handles: HashMap<usize, File>,
    /// LRU queue for file handle management
    lru_queue: VecDeque<usize>,
    /// Maximum number of simultaneously open files
    max_open: usize,
}

impl FileIoPool {
    /// Create a new file pool with specified paths and max open limit
    pub fn new(file_paths: Vec<PathBuf>, max_open: usize) -> Self {
        Self {
            file_paths,
            open_handles: HashMap::new(),
            lru_queue: VecDeque::new(),
            max_open: max_open.max(1),
        }
    }

    /// Get a file handle, opening it if necessary and managing LRU cache
    ///
    /// A file that cannot be opened is reported as unavailable: the data it
    /// holds should exist, the volume carrying it may just not be mounted.
    pub fn get_file(&mut self, file_index: usize) -> Result<&mut File> {
        if file_index >= self.file_paths.len() {
            return Err(ChunkTableError::ChunkUnavailable {
                segment: file_index,
                reason: format!("pool has {} files", self.file_paths.len()),
            });
        }

        if self.open_handles.contains_key(&file_index) {
            self.lru_queue.retain(|&x| x != file_index);
            self.lru_queue.push_front(file_index);
            trace!(file_index, "File handle cache hit");
        } else {
            if self.open_handles.len() >= self.max_open {
                if let Some(lru_index) = self.lru_queue.pop_back() {
                    trace!(lru_index, "Evicting LRU file handle");
                    self.open_handles.remove(&lru_index);
                }
            }

            let file_path = &self.file_paths[file_index];
            debug!(file_index, ?file_path, "Opening file handle");
            let file = File::open(file_path).map_err(|e| ChunkTableError::ChunkUnavailable {
                segment: file_index,
                reason: format!("{}: {}", file_path.display(), e),
            })?;

            self.open_handles.insert(file_index, file);
            self.lru_queue.push_front(file_index);
        }

        self.open_handles
            .get_mut(&file_index)
            .ok_or_else(|| ChunkTableError::ChunkUnavailable {
                segment: file_index,
                reason: "handle evicted while opening".to_string(),
            })
    }

    /// Read `length` bytes at `offset` from a pooled file
    pub fn read_at(&mut self, file_index: usize, offset: u64, length: usize) -> Result<Vec<u8>> {
        let file = self.get_file(file_index)?;
        read_bytes_at(file, offset, length).map_err(|e| {
            ChunkTableError::io(
                format!("read {} bytes at {} from segment {}", length, offset, file_index),
                e,
            )
        })
    }

    /// Size of a pooled file in bytes
    pub fn file_size(&mut self, file_index: usize) -> Result<u64> {
        let file = self.get_file(file_index)?;
        let metadata = file
            .metadata()
            .map_err(|e| ChunkTableError::io(format!("metadata of segment {}", file_index), e))?;
        Ok(metadata.len())
    }

    /// Get the number of files in the pool
    pub fn get_file_count(&self) -> usize {
        self.file_paths.len()
    }

    /// Get the path for a specific file index
    pub fn get_path(&self, file_index: usize) -> Option<&PathBuf> {
        self.file_paths.get(file_index)
    }

    /// Get the number of currently open handles
    pub fn open_count(&self) -> usize {
        self.open_handles.len()
    }

    /// Close all open file handles
    pub fn close_all(&mut self) {
        self.open_handles.clear();
        self.lru_queue.clear();
    }
}
