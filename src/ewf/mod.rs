//! EWF (Expert Witness Format) - segment file layer for E01/L01/Ex01/Lx01 images
//!
//! This module locates table sections inside segment files and feeds them to
//! the [`chunk_table`](crate::chunk_table), then decodes chunk data for reads
//! and verification.
//!
//! ## Segment File Layout
//!
//! ```text
//! v1 (E01/L01) - sections chained forward from offset 13
//! ┌──────────────────────────────────────────────────────────────┐
//! │ File header (13 bytes): signature, fields start, segment no. │
//! ├──────────────────────────────────────────────────────────────┤
//! │ descriptor "volume"  → chunk count, sectors, bytes/sector    │
//! │ descriptor "sectors" → chunk data                            │
//! │ descriptor "table"   → 24-byte header, u32 entries, adler32  │
//! │ descriptor "table2"  → copy of "table"                       │
//! │ descriptor "next" / "done"                                   │
//! └──────────────────────────────────────────────────────────────┘
//!
//! v2 (Ex01/Lx01) - each descriptor follows its data, chained backwards
//! ┌──────────────────────────────────────────────────────────────┐
//! │ File header (32 bytes)                                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │ sector data          │ descriptor (type 0x03)                │
//! │ sector table         │ descriptor (type 0x04)                │
//! │                      │ descriptor "next" / "done"            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Table entries point straight at the stored chunk: a zlib stream when
//! compressed, otherwise the data followed by an Adler-32 (always in v1;
//! in v2 the entry says whether a checksum follows).

mod handle;
mod sections;
mod segment_files;
mod types;

#[cfg(test)]
pub(crate) mod test_image;

pub use handle::{ChunkData, ImageHandle};
pub use segment_files::SegmentFiles;
pub use types::{ChecksumErrorRange, FileHeader, VerifyResult, VolumeSection};
