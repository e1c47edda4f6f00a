//! Chunk planner: splits a byte-range download into independently fetched chunks.

use super::constants::MIN_CHUNK_SIZE;
use super::error::DownloadError;
use super::http::ByteRange;

/// One chunk of a plan, `[start, end)`; `end == None` reads until EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// First byte of the chunk.
    pub start: u64,
    /// Exclusive end, or `None` for the open-ended last chunk.
    pub end: Option<u64>,
}

impl ChunkRange {
    /// The `Range` header covering the bytes from `offset` to the chunk end.
    #[must_use]
    pub fn request_range(&self, offset: u64) -> ByteRange {
        match self.end {
            Some(end) => ByteRange::inclusive(offset, end.saturating_sub(1)),
            None => ByteRange::from(offset),
        }
    }
}

/// Ordered chunk start offsets for one attempt.
///
/// Derived once from a target's length and range support plus a resume offset;
/// immutable afterward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    starts: Vec<u64>,
    start_offset: u64,
    download_length: Option<u64>,
    is_resumed: bool,
}

impl ChunkPlan {
    /// Plans the chunks for a download.
    ///
    /// - Without range support the whole file is one chunk from byte 0 and the
    ///   resume offset is ignored.
    /// - A known total equal to the offset leaves nothing to fetch; a total
    ///   smaller than the offset means the partial data belongs to something
    ///   else, so the plan restarts from 0.
    /// - An unknown total, or one below `small_threshold`, is a single chunk.
    /// - Otherwise `ceil((total - start) / chunk_size)` chunks, the last one
    ///   open-ended.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidConfig`] when `chunk_size` is not above
    /// 1000 bytes.
    pub fn plan(
        total: Option<u64>,
        supports_ranges: bool,
        start_offset: u64,
        chunk_size: u64,
        small_threshold: u64,
    ) -> Result<Self, DownloadError> {
        if chunk_size <= MIN_CHUNK_SIZE {
            return Err(DownloadError::invalid_config(
                "chunk_size",
                format!("must be greater than {MIN_CHUNK_SIZE} bytes, got {chunk_size}"),
            ));
        }

        if !supports_ranges {
            return Ok(Self {
                starts: vec![0],
                start_offset: 0,
                download_length: total,
                is_resumed: false,
            });
        }

        let mut start = start_offset;
        if let Some(total) = total {
            if total == start {
                return Ok(Self {
                    starts: Vec::new(),
                    start_offset: start,
                    download_length: Some(0),
                    is_resumed: start > 0,
                });
            }
            if total < start {
                start = 0;
            }
        }

        let download_length = total.map(|total| total - start);
        let starts = match total {
            Some(total) if total >= small_threshold => {
                let remaining = total - start;
                let count = remaining.div_ceil(chunk_size);
                (0..count).map(|i| start + i * chunk_size).collect()
            }
            _ => vec![start],
        };

        Ok(Self {
            starts,
            start_offset: start,
            download_length,
            is_resumed: start > 0,
        })
    }

    /// Number of chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.starts.len()
    }

    /// True when there is nothing left to fetch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// The `index`-th chunk.
    #[must_use]
    pub fn chunk(&self, index: usize) -> Option<ChunkRange> {
        let start = *self.starts.get(index)?;
        Some(ChunkRange {
            start,
            end: self.starts.get(index + 1).copied(),
        })
    }

    /// Index of the chunk containing `offset`; offsets before the plan map to 0.
    #[must_use]
    pub fn index_of(&self, offset: u64) -> usize {
        self.starts
            .partition_point(|start| *start <= offset)
            .saturating_sub(1)
    }

    /// All chunks in order.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        (0..self.len()).filter_map(|i| self.chunk(i))
    }

    /// Byte offset where writing begins.
    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Bytes this plan will fetch, when the total is known.
    #[must_use]
    pub fn download_length(&self) -> Option<u64> {
        self.download_length
    }

    /// Whether the plan continues a partial file.
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.is_resumed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::constants::DEFAULT_CHUNK_SIZE;

    const CHUNK: u64 = 10_000;
    const SMALL: u64 = 2 * CHUNK;

    #[test]
    fn test_plan_rejects_tiny_chunk_size() {
        let result = ChunkPlan::plan(Some(100_000), true, 0, 1000, 2000);
        assert!(matches!(
            result,
            Err(DownloadError::InvalidConfig {
                field: "chunk_size",
                ..
            })
        ));
    }

    #[test]
    fn test_plan_without_ranges_ignores_resume_offset() {
        let plan = ChunkPlan::plan(Some(100_000), false, 5_000, CHUNK, SMALL).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunk(0), Some(ChunkRange { start: 0, end: None }));
        assert_eq!(plan.download_length(), Some(100_000));
        assert!(!plan.is_resumed());
        assert_eq!(plan.start_offset(), 0);
    }

    #[test]
    fn test_plan_unknown_length_single_open_chunk() {
        let plan = ChunkPlan::plan(None, true, 500, CHUNK, SMALL).unwrap();
        assert_eq!(plan.chunks().collect::<Vec<_>>(), vec![ChunkRange {
            start: 500,
            end: None
        }]);
        assert_eq!(plan.download_length(), None);
        assert!(plan.is_resumed());
    }

    #[test]
    fn test_plan_small_file_single_chunk() {
        let plan = ChunkPlan::plan(Some(SMALL - 1), true, 100, CHUNK, SMALL).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.download_length(), Some(SMALL - 101));
    }

    #[test]
    fn test_plan_splits_large_file() {
        let plan = ChunkPlan::plan(Some(45_000), true, 0, CHUNK, SMALL).unwrap();
        let starts: Vec<u64> = plan.chunks().map(|c| c.start).collect();
        assert_eq!(starts, vec![0, 10_000, 20_000, 30_000, 40_000]);
        assert_eq!(plan.chunk(0).unwrap().end, Some(10_000));
        assert_eq!(plan.chunk(4).unwrap().end, None);
        assert_eq!(plan.download_length(), Some(45_000));
        assert!(!plan.is_resumed());
    }

    #[test]
    fn test_plan_resumed_offsets_start_at_resume_point() {
        let plan = ChunkPlan::plan(Some(45_000), true, 12_345, CHUNK, SMALL).unwrap();
        let starts: Vec<u64> = plan.chunks().map(|c| c.start).collect();
        assert_eq!(starts, vec![12_345, 22_345, 32_345, 42_345]);
        assert!(plan.is_resumed());
        assert_eq!(plan.download_length(), Some(45_000 - 12_345));
    }

    #[test]
    fn test_plan_complete_partial_has_no_chunks() {
        let plan = ChunkPlan::plan(Some(45_000), true, 45_000, CHUNK, SMALL).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.download_length(), Some(0));
    }

    #[test]
    fn test_plan_oversized_partial_restarts() {
        let plan = ChunkPlan::plan(Some(45_000), true, 50_000, CHUNK, SMALL).unwrap();
        assert_eq!(plan.start_offset(), 0);
        assert!(!plan.is_resumed());
        assert_eq!(plan.chunk(0).unwrap().start, 0);
    }

    #[test]
    fn test_plan_exact_multiple_has_no_empty_tail() {
        let plan = ChunkPlan::plan(Some(40_000), true, 0, CHUNK, SMALL).unwrap();
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn test_plan_default_chunk_size_accepted() {
        let plan =
            ChunkPlan::plan(Some(25 * DEFAULT_CHUNK_SIZE), true, 0, DEFAULT_CHUNK_SIZE, 2 * DEFAULT_CHUNK_SIZE)
                .unwrap();
        assert_eq!(plan.len(), 25);
    }

    #[test]
    fn test_index_of_maps_offsets_to_chunks() {
        let plan = ChunkPlan::plan(Some(10_000), true, 0, 3_000, 4_000).unwrap();
        assert_eq!(plan.index_of(0), 0);
        assert_eq!(plan.index_of(2_999), 0);
        assert_eq!(plan.index_of(3_000), 1);
        assert_eq!(plan.index_of(9_500), 3);
        assert_eq!(plan.index_of(10_000), 3);
    }

    #[test]
    fn test_request_range_for_bounded_and_open_chunks() {
        let bounded = ChunkRange {
            start: 0,
            end: Some(100),
        };
        assert_eq!(bounded.request_range(40).to_string(), "bytes=40-99");
        let open = ChunkRange {
            start: 100,
            end: None,
        };
        assert_eq!(open.request_range(100).to_string(), "bytes=100-");
    }
}
