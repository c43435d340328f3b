//! Chunk range planning over a loaded context blob.
//!
//! Planning is pure arithmetic on byte counts; materializing the planned
//! ranges as files lives in [`crate::io::chunks`].

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// A planned byte range within a context blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    /// 0-indexed chunk id, ascending by start offset.
    pub id: u32,
    /// Inclusive start offset.
    pub start: usize,
    /// Exclusive end offset.
    pub end: usize,
}

impl ChunkRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether two ranges share at least one offset.
    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Plan greedy fixed-size chunks over `total` bytes.
///
/// Each chunk spans `size` bytes; the next chunk begins `overlap` bytes
/// before the previous end. The final chunk is shortened rather than
/// overlapped past the end. Ranges ordered by start cover `[0, total)`
/// with no gaps.
pub fn plan_chunks(total: usize, size: usize, overlap: usize) -> Result<Vec<ChunkRange>> {
    if size == 0 {
        return Err(anyhow!("chunk size must be > 0"));
    }
    if overlap >= size {
        return Err(anyhow!(
            "chunk overlap ({overlap}) must be smaller than chunk size ({size})"
        ));
    }

    let mut ranges = Vec::new();
    let mut start = 0usize;
    let mut id = 0u32;
    while start < total {
        let end = (start + size).min(total);
        ranges.push(ChunkRange { id, start, end });
        if end == total {
            break;
        }
        start = end - overlap;
        id += 1;
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Covers the 1MB / 200k / no-overlap layout exactly.
    #[test]
    fn plan_without_overlap_splits_evenly() {
        let ranges = plan_chunks(1_000_000, 200_000, 0).expect("plan");
        assert_eq!(ranges.len(), 5);
        for (i, range) in ranges.iter().enumerate() {
            assert_eq!(range.id, i as u32);
            assert_eq!(range.start, i * 200_000);
            assert_eq!(range.end, (i + 1) * 200_000);
        }
    }

    #[test]
    fn plan_shortens_final_chunk() {
        let ranges = plan_chunks(450, 200, 0).expect("plan");
        assert_eq!(ranges.len(), 3);
        assert_eq!((ranges[2].start, ranges[2].end), (400, 450));
    }

    #[test]
    fn plan_with_overlap_covers_without_gaps() {
        let ranges = plan_chunks(1000, 300, 50).expect("plan");
        // Union covers [0, 1000) with no gaps.
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges.last().expect("nonempty").end, 1000);
        for pair in ranges.windows(2) {
            assert!(pair[1].start <= pair[0].end, "gap between chunks");
            // Adjacent chunks overlap by exactly `overlap` except at the tail.
            if pair[1].end - pair[1].start == 300 {
                assert_eq!(pair[0].end - pair[1].start, 50);
            }
        }
    }

    #[test]
    fn plan_empty_blob_yields_no_chunks() {
        let ranges = plan_chunks(0, 100, 10).expect("plan");
        assert!(ranges.is_empty());
    }

    #[test]
    fn plan_rejects_zero_size() {
        assert!(plan_chunks(10, 0, 0).is_err());
    }

    #[test]
    fn plan_rejects_overlap_not_smaller_than_size() {
        assert!(plan_chunks(10, 5, 5).is_err());
    }

    #[test]
    fn blob_smaller_than_size_is_one_chunk() {
        let ranges = plan_chunks(42, 100, 10).expect("plan");
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].start, ranges[0].end), (0, 42));
    }
}
