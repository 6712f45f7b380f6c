use crate::fetcher::outcome::FetchError;

/// One bounded sub-range of the requested block interval.
///
/// Chunks are created in ascending order, ids are 0-based and dense, and the
/// final concatenation order of results is ascending id order regardless of
/// which chunk's query finishes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub id: usize,
    pub from_block: u64,
    pub to_block: u64,
}

impl ChunkSpec {
    /// Number of blocks covered by this chunk (ranges are inclusive).
    pub fn block_count(&self) -> u64 {
        self.to_block - self.from_block + 1
    }
}

/// Splits the inclusive interval `[from, to]` into chunks of at most
/// `chunk_size` blocks.
///
/// The result is deterministic: chunks are disjoint, contiguous, and their
/// union is exactly `[from, to]`; only the last chunk may span fewer than
/// `chunk_size` blocks. Inverted ranges are rejected before any RPC work
/// starts.
pub fn split_range(from: u64, to: u64, chunk_size: u64) -> Result<Vec<ChunkSpec>, FetchError> {
    assert!(chunk_size > 0, "chunk_size must be greater than zero");

    if from > to {
        return Err(FetchError::InvalidRange { from, to });
    }

    // (to - from) / chunk_size + 1 == ceil((to - from + 1) / chunk_size)
    // without overflowing on ranges ending at u64::MAX.
    let count = (to - from) / chunk_size + 1;
    let mut chunks = Vec::with_capacity(count as usize);

    for id in 0..count {
        let from_block = from + id * chunk_size;
        let to_block = from_block.saturating_add(chunk_size - 1).min(to);
        chunks.push(ChunkSpec {
            id: id as usize,
            from_block,
            to_block,
        });
    }

    Ok(chunks)
}
