//! Byte range arithmetic shared by the planner, the disk stream and the
//! page blob stores.

use std::fmt;

/// Contiguous span `[offset, offset + length)` of the logical image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexRange {
    pub offset: u64,
    pub length: u64,
}

impl IndexRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Build from an inclusive `[start, end]` pair, as page range listings
    /// report them.
    pub fn from_inclusive(start: u64, end: u64) -> Self {
        Self {
            offset: start,
            length: end - start + 1,
        }
    }

    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn intersects(&self, other: &IndexRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Split into pieces of at most `size` bytes, aligned to multiples of
    /// `size` from offset zero.
    pub fn chunks(&self, size: u64) -> Vec<IndexRange> {
        let mut out = Vec::new();
        let mut pos = self.offset;
        while pos < self.end() {
            let boundary = (pos / size + 1) * size;
            let next = boundary.min(self.end());
            out.push(IndexRange::new(pos, next - pos));
            pos = next;
        }
        out
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.length == 0 {
            write!(f, "[{}, empty]", self.offset)
        } else {
            write!(f, "[{}-{}]", self.offset, self.end() - 1)
        }
    }
}

/// Sort and coalesce overlapping or adjacent ranges.
pub fn merge(ranges: &[IndexRange]) -> Vec<IndexRange> {
    let mut sorted: Vec<IndexRange> = ranges.iter().copied().filter(|r| !r.is_empty()).collect();
    sorted.sort();

    let mut out: Vec<IndexRange> = Vec::with_capacity(sorted.len());
    for r in sorted {
        match out.last_mut() {
            Some(last) if r.offset <= last.end() => {
                let end = last.end().max(r.end());
                last.length = end - last.offset;
            }
            _ => out.push(r),
        }
    }
    out
}

/// Remove every byte covered by `skip` from `ranges`.
///
/// The result is sorted and never intersects any range in `skip`.
pub fn subtract(ranges: &[IndexRange], skip: &[IndexRange]) -> Vec<IndexRange> {
    let skip = merge(skip);
    let mut out = Vec::new();

    for r in merge(ranges) {
        let mut pos = r.offset;
        for s in skip.iter().filter(|s| s.intersects(&r)) {
            if s.offset > pos {
                out.push(IndexRange::new(pos, s.offset - pos));
            }
            pos = pos.max(s.end());
        }
        if pos < r.end() {
            out.push(IndexRange::new(pos, r.end() - pos));
        }
    }
    out
}

/// Sum of all range lengths.
pub fn total_length(ranges: &[IndexRange]) -> u64 {
    ranges.iter().map(|r| r.length).sum()
}

// -- Tests -------------------------------------------------------------------
