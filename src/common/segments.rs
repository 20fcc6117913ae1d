// Segment file name discovery for multi-segment EWF images
//
// Naming follows the acquisition tools:
// - EWF v1: .E01 ... .E99, then .EAA ... .EZZ, .FAA ... .ZZZ
// - EWF v2: .Ex01 ... .Ex99, then .ExAA ... .ExZZ, .FxAA ... .ZxZZ

use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::error::{ChunkTableError, Result};

/// Highest segment number representable by the v1 naming scheme
pub const MAX_SEGMENT_NUMBER: u32 = 99 + 26 * 26 * 22;

/// Build the extension (without dot) for a segment number
///
/// `first` is the leading letter of the first segment ('E' for disk images,
/// 'L' for logical evidence). Returns `None` when the number cannot be named.
pub fn segment_extension(first: char, segment_number: u32, v2: bool) -> Option<String> {
    if segment_number == 0 || !first.is_ascii_uppercase() {
        return None;
    }
    let infix = if v2 { "x" } else { "" };

    if segment_number <= 99 {
        return Some(format!("{}{}{:02}", first, infix, segment_number));
    }

    let mut remaining = segment_number - 100;
    let third = (b'A' + (remaining % 26) as u8) as char;
    remaining /= 26;
    let second = (b'A' + (remaining % 26) as u8) as char;
    remaining /= 26;

    let lead = first as u32 + remaining;
    if lead > 'Z' as u32 {
        return None;
    }
    let lead = char::from_u32(lead)?;
    Some(format!("{}{}{}{}", lead, infix, second, third))
}

/// Discover all segments of an EWF image given the path of its first segment
///
/// Stops at the first missing segment; a gap means the image is incomplete,
/// which surfaces later as an unavailable chunk rather than here.
pub fn discover_ewf_segments(first_segment: &Path) -> Result<Vec<PathBuf>> {
    debug!(?first_segment, "Discovering EWF segments");
    let parent = first_segment.parent().unwrap_or(Path::new("."));
    let stem = first_segment
        .file_stem()
        .ok_or_else(|| invalid_name(first_segment))?
        .to_string_lossy()
        .to_string();
    let extension = first_segment
        .extension()
        .ok_or_else(|| invalid_name(first_segment))?
        .to_string_lossy()
        .to_string();

    let v2 = extension.len() == 4 && extension[1..2].eq_ignore_ascii_case("x");
    let lowercase = extension.chars().next().is_some_and(|c| c.is_ascii_lowercase());
    let first = extension
        .chars()
        .next()
        .map(|c| c.to_ascii_uppercase())
        .ok_or_else(|| invalid_name(first_segment))?;

    let mut paths = vec![first_segment.to_path_buf()];

    for number in 2..=MAX_SEGMENT_NUMBER {
        let Some(ext) = segment_extension(first, number, v2) else {
            break;
        };
        let ext = if lowercase { ext.to_lowercase() } else { ext };
        let segment_path = parent.join(format!("{}.{}", stem, ext));
        if !segment_path.exists() {
            break;
        }
        trace!(segment = number, ?segment_path, "Found EWF segment");
        paths.push(segment_path);
    }

    debug!(segment_count = paths.len(), "EWF segments discovered");
    Ok(paths)
}

fn invalid_name(path: &Path) -> ChunkTableError {
    ChunkTableError::ChunkUnavailable {
        segment: 0,
        reason: format!("invalid segment file name {}", path.display()),
    }
}
