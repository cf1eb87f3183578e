use std::fmt;
use std::ops::RangeInclusive;

/// Contiguous run of block heights handed to a single worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub first: u64,
    pub last: u64,
}

impl Chunk {
    pub fn heights(&self) -> RangeInclusive<u64> {
        self.first..=self.last
    }

    /// Number of heights in the chunk. Never zero
    pub fn size(&self) -> u64 {
        self.last - self.first + 1
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.first, self.last)
    }
}

/// Splits `range` into at most `workers` ascending, non-overlapping chunks that cover it exactly.
///
/// Chunks are `len / workers` heights long (at least one); whatever doesn't divide evenly is
/// appended to the last chunk
pub fn partition(range: RangeInclusive<u64>, workers: usize) -> Vec<Chunk> {
    let (start, end) = (*range.start(), *range.end());
    if start > end {
        return vec![];
    }

    let len = end - start + 1;
    let workers = workers.max(1) as u64;
    let chunk_size = (len / workers).max(1);
    let count = len.min(workers);

    (0..count)
        .map(|i| {
            let first = start + i * chunk_size;
            let last = if i == count - 1 {
                end
            } else {
                first + chunk_size - 1
            };
            Chunk { first, last }
        })
        .collect()
}
