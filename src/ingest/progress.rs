use std::collections::BTreeMap;
use std::sync::Arc;

use color_eyre::eyre::Result;
use tokio::sync::Mutex;
use tracing::debug;

use crate::db::Db;

/// Completed heights of the current run, folded into the longest gap-free prefix
#[derive(Debug)]
pub struct Frontier {
    /// Lowest height not yet completed
    next: u64,

    /// Completed heights above `next` as disjoint, non-adjacent `start => end` runs, waiting for
    /// the gap below them to close. Grows with the number of gaps, not with the number of heights
    pending: BTreeMap<u64, u64>,
}

impl Frontier {
    pub fn new(start: u64) -> Self {
        Self {
            next: start,
            pending: BTreeMap::new(),
        }
    }

    /// Records `height` as completed.
    /// Returns the new end of the contiguous prefix if it moved
    pub fn complete(&mut self, height: u64) -> Option<u64> {
        if height < self.next {
            return None;
        }

        let (mut start, mut end) = (height, height);

        if let Some((&s, &e)) = self.pending.range(..=height).next_back() {
            if e >= height {
                return None;
            }
            if e + 1 == height {
                self.pending.remove(&s);
                start = s;
            }
        }
        if let Some(e) = self.pending.remove(&(height + 1)) {
            end = e;
        }

        if start == self.next {
            self.next = end + 1;
            return Some(end);
        }

        self.pending.insert(start, end);
        None
    }

    /// Completed heights that cannot be committed yet
    pub fn pending(&self) -> u64 {
        self.pending.iter().map(|(start, end)| end - start + 1).sum()
    }
}

/// Shared by every worker of a run.
///
/// The durable marker only ever moves to the end of the gap-free prefix of completed heights, so
/// a height that failed (or is still in flight) holds it back. Restarting from the marker
/// therefore never skips a height.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    db: Db,
    frontier: Arc<Mutex<Frontier>>,
}

impl ProgressTracker {
    pub fn new(db: Db, start: u64) -> Self {
        Self {
            db,
            frontier: Arc::new(Mutex::new(Frontier::new(start))),
        }
    }

    pub async fn complete(&self, height: u64) -> Result<()> {
        // hold the lock across the write, so concurrent advances land in order
        let mut frontier = self.frontier.lock().await;

        if let Some(committed) = frontier.complete(height) {
            self.db.set_progress(committed).await?;
            debug!(
                committed,
                pending = frontier.pending(),
                "progress advanced"
            );
        }

        Ok(())
    }

    #[cfg(test)]
    pub async fn pending(&self) -> u64 {
        self.frontier.lock().await.pending()
    }
}
