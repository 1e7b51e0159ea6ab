//! Range planning: which bytes of the image must be sent.
//!
//! Planning runs in two passes.  [`locate_uploadable_ranges`] is
//! structural and cheap: it starts from the stream's extents, removes
//! ranges a previous run already uploaded and cuts the rest into
//! page-sized pieces.  [`detect_empty_ranges`] then reads every piece and
//! drops the all-zero ones, since unwritten page blob pages read as zero.

use tracing::debug;

use crate::range::{subtract, total_length, IndexRange};
use crate::vhd::ImageStream;

/// Page-aligned candidate ranges not yet present at the destination.
pub fn locate_uploadable_ranges(
    stream: &dyn ImageStream,
    ranges_to_skip: &[IndexRange],
    page_size: u64,
) -> Vec<IndexRange> {
    let pending = subtract(&stream.extents(), ranges_to_skip);
    let candidates: Vec<IndexRange> = pending.iter().flat_map(|r| r.chunks(page_size)).collect();
    debug!(
        "Located {} candidate ranges ({} bytes), skipping {} ranges",
        candidates.len(),
        total_length(&candidates),
        ranges_to_skip.len()
    );
    candidates
}

/// Drop the candidates whose content is entirely zero.
pub fn detect_empty_ranges(
    stream: &dyn ImageStream,
    candidates: &[IndexRange],
) -> std::io::Result<Vec<IndexRange>> {
    let mut kept = Vec::with_capacity(candidates.len());
    let mut buf = Vec::new();
    for range in candidates {
        buf.resize(range.length as usize, 0);
        stream.read_at(range.offset, &mut buf)?;
        if buf.iter().any(|b| *b != 0) {
            kept.push(*range);
        }
    }
    debug!(
        "{} of {} candidate ranges contain data",
        kept.len(),
        candidates.len()
    );
    Ok(kept)
}

/// Both passes in order.
pub fn plan_ranges(
    stream: &dyn ImageStream,
    ranges_to_skip: &[IndexRange],
    page_size: u64,
) -> std::io::Result<Vec<IndexRange>> {
    let candidates = locate_uploadable_ranges(stream, ranges_to_skip, page_size);
    detect_empty_ranges(stream, &candidates)
}
