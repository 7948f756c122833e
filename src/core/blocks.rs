//! Byte range to chunk range mapping
//!
//! A logical file is stored as fixed-size chunks. Every operation starts by
//! translating its byte range into the chunks it touches and the sub-range
//! inside each of those chunks.

/// The part of one chunk covered by a byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// Block index (`offset / chunk_size`)
    pub block: u64,
    /// First covered byte inside the chunk
    pub start: usize,
    /// One past the last covered byte inside the chunk
    pub end: usize,
}

impl ChunkRange {
    /// Number of bytes covered inside the chunk
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True when the range spans the whole chunk
    pub fn is_full(&self, chunk_size: u64) -> bool {
        self.start == 0 && self.end as u64 == chunk_size
    }
}

/// Maps `[start, end)` to the ordered chunk ranges covering it.
///
/// A range ending exactly on a chunk boundary reports `end == chunk_size` for
/// its last chunk rather than an empty range.
///
/// `chunk_size` must be non-zero; handles validate it at creation.
pub fn blocks(chunk_size: u64, start: u64, end: u64) -> Vec<ChunkRange> {
    debug_assert!(chunk_size > 0, "chunk size must be non-zero");

    let mut ranges = Vec::new();
    if start >= end {
        return ranges;
    }

    let mut n = (start / chunk_size) * chunk_size;
    while n < end {
        let local_start = start.max(n) - n;
        let local_end = match end.min(n.saturating_add(chunk_size)) - n {
            0 => chunk_size,
            len => len,
        };
        ranges.push(ChunkRange {
            block: n / chunk_size,
            start: local_start as usize,
            end: local_end as usize,
        });

        n = match n.checked_add(chunk_size) {
            Some(next) => next,
            None => break,
        };
    }

    ranges
}
