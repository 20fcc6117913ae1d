//! Sectors that failed content checksum verification, kept as ranges

use crate::error::{ChunkTableError, Result};

/// A run of sectors with checksum errors, half-open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumError {
    pub start_sector: u64,
    pub number_of_sectors: u64,
}

impl ChecksumError {
    pub fn end_sector(&self) -> u64 {
        self.start_sector.saturating_add(self.number_of_sectors)
    }

    /// Byte offset and length of the range for a given sector size
    pub fn byte_range(&self, bytes_per_sector: u32) -> (u64, u64) {
        let bps = bytes_per_sector as u64;
        (
            self.start_sector.saturating_mul(bps),
            self.number_of_sectors.saturating_mul(bps),
        )
    }
}

/// Ordered list of disjoint checksum error ranges
///
/// [`append`](Self::append) is write-forward: ranges must arrive in
/// non-decreasing start order, and one starting exactly where the last ends
/// extends it. [`insert`](Self::insert) accepts any order and merges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumErrors {
    ranges: Vec<ChecksumError>,
}

impl ChecksumErrors {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_range(start_sector: u64, number_of_sectors: u64) -> Result<u64> {
        match start_sector.checked_add(number_of_sectors) {
            Some(end) if number_of_sectors > 0 => Ok(end),
            _ => Err(ChunkTableError::InvalidRange {
                start_sector,
                number_of_sectors,
            }),
        }
    }

    pub fn append(&mut self, start_sector: u64, number_of_sectors: u64) -> Result<()> {
        Self::check_range(start_sector, number_of_sectors)?;

        if let Some(last) = self.ranges.last_mut() {
            let previous_end = last.end_sector();
            if start_sector < previous_end {
                return Err(ChunkTableError::OutOfOrder {
                    start_sector,
                    previous_end,
                });
            }
            if start_sector == previous_end {
                last.number_of_sectors += number_of_sectors;
                return Ok(());
            }
        }

        self.ranges.push(ChecksumError {
            start_sector,
            number_of_sectors,
        });
        Ok(())
    }

    /// Add a range anywhere, merging it with overlapping or touching ranges
    ///
    /// Returns false when the range was already fully covered.
    pub fn insert(&mut self, start_sector: u64, number_of_sectors: u64) -> Result<bool> {
        let end = Self::check_range(start_sector, number_of_sectors)?;

        // Ranges in first..last overlap or touch [start_sector, end)
        let first = self.ranges.partition_point(|r| r.end_sector() < start_sector);
        let last = self.ranges.partition_point(|r| r.start_sector <= end);

        if first == last {
            self.ranges.insert(first, ChecksumError { start_sector, number_of_sectors });
            return Ok(true);
        }

        let head = self.ranges[first];
        if last - first == 1 && head.start_sector <= start_sector && head.end_sector() >= end {
            return Ok(false);
        }

        let merged_start = head.start_sector.min(start_sector);
        let merged_end = self.ranges[last - 1].end_sector().max(end);
        let merged = ChecksumError {
            start_sector: merged_start,
            number_of_sectors: merged_end - merged_start,
        };
        self.ranges.splice(first..last, [merged]);
        Ok(true)
    }

    pub fn count(&self) -> usize {
        self.ranges.len()
    }

    pub fn get(&self, index: usize) -> Result<ChecksumError> {
        self.ranges
            .get(index)
            .copied()
            .ok_or(ChunkTableError::IndexOutOfRange {
                index,
                count: self.ranges.len(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChecksumError> {
        self.ranges.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of sectors covered by all ranges
    pub fn total_sectors(&self) -> u64 {
        self.ranges.iter().map(|r| r.number_of_sectors).sum()
    }
}
