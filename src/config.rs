//! Chunk table configuration
//!
//! Settings are plain serde structs so they can be embedded in a larger
//! application config or loaded from a standalone JSON file:
//!
//! ```json
//! { "max_cached_descriptors": 131072, "max_open_files": 32 }
//! ```
//!
//! Missing fields fall back to [`ChunkTableConfig::default`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::{ChunkTableError, Result};

/// Default upper bound on descriptors held by the descriptor cache
pub const DEFAULT_MAX_CACHED_DESCRIPTORS: usize = 64 * 1024;

/// Default maximum number of simultaneously open segment files
pub const DEFAULT_MAX_OPEN_FILES: usize = 16; // Like libewf's rlimit handling

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkTableConfig {
    /// Working-set bound of the descriptor cache (number of descriptors)
    pub max_cached_descriptors: usize,
    /// Maximum number of segment file handles kept open at once
    pub max_open_files: usize,
    /// Replace chunk data with zeros when its checksum does not match
    pub zero_on_checksum_error: bool,
    /// Measure the chunks of tainted v1 tables to correct their entries
    pub verify_tainted_tables: bool,
}

impl Default for ChunkTableConfig {
    fn default() -> Self {
        Self {
            max_cached_descriptors: DEFAULT_MAX_CACHED_DESCRIPTORS,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            zero_on_checksum_error: true,
            verify_tainted_tables: true,
        }
    }
}

impl ChunkTableConfig {
    /// Parse configuration from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ChunkTableConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ChunkTableError::io(format!("read config {}", path.display()), e))?;
        let config = Self::from_json_str(&content)?;
        debug!(?path, ?config, "Loaded chunk table config");
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_open_files == 0 {
            return Err(ChunkTableError::ValueOutOfRange(
                "max_open_files must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
