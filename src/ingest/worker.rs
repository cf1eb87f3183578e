use std::time::Duration;

use color_eyre::eyre::Result;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use super::partition::Chunk;
use super::progress::ProgressTracker;
use crate::config::IngestConfig;
use crate::db::Db;
use crate::explorer::{BlockAddresses, BlockFetcher, FetchError};
use crate::validate::is_valid_address;

/// How a worker reacts to rate limiting
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub retries: u32,
    pub pause_min: Duration,
    pub pause_max: Duration,
}

impl From<&IngestConfig> for RateLimitPolicy {
    fn from(config: &IngestConfig) -> Self {
        let pause_min = Duration::from_millis(config.rate_limit_pause_min_ms);
        let pause_max = Duration::from_millis(config.rate_limit_pause_max_ms).max(pause_min);

        Self {
            retries: config.rate_limit_retries,
            pause_min,
            pause_max,
        }
    }
}

/// Outcome of one worker's chunk
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Heights fetched and fully saved
    pub completed: u64,

    /// Newly inserted addresses
    pub inserted: u64,

    /// Heights skipped after a fetch failure, ascending
    pub failed: Vec<u64>,
}

/// Walks one chunk in ascending order, one height at a time
pub struct Worker<F> {
    id: usize,
    chunk: Chunk,
    fetcher: F,
    db: Db,
    progress: ProgressTracker,
    rate_limit: RateLimitPolicy,
    rng: StdRng,
}

impl<F: BlockFetcher> Worker<F> {
    pub fn new(
        id: usize,
        chunk: Chunk,
        fetcher: F,
        db: Db,
        progress: ProgressTracker,
        rate_limit: RateLimitPolicy,
    ) -> Self {
        Self {
            id,
            chunk,
            fetcher,
            db,
            progress,
            rate_limit,
            rng: StdRng::from_entropy(),
        }
    }

    /// Store errors abort the chunk. Fetch errors only skip the offending height
    #[instrument(name = "worker", skip(self), fields(id = self.id, chunk = %self.chunk))]
    pub async fn run(mut self) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();

        for height in self.chunk.heights() {
            match self.fetch(height).await {
                Some(addresses) => {
                    report.inserted += save(&self.db, &addresses).await?;
                    self.progress.complete(height).await?;
                    report.completed += 1;
                }
                None => report.failed.push(height),
            }
        }

        info!(
            completed = report.completed,
            inserted = report.inserted,
            failed = report.failed.len(),
            "chunk finished"
        );

        Ok(report)
    }

    /// Fetches `height`, pausing and retrying while the explorer rate limits us.
    /// `None` means the height is skipped
    async fn fetch(&mut self, height: u64) -> Option<BlockAddresses> {
        let mut pauses = 0;

        loop {
            match self.fetcher.fetch_block(height).await {
                Ok(addresses) => return Some(addresses),

                Err(FetchError::RateLimited) if pauses < self.rate_limit.retries => {
                    pauses += 1;
                    let pause = self
                        .rng
                        .gen_range(self.rate_limit.pause_min..=self.rate_limit.pause_max);
                    warn!(
                        height,
                        pause_ms = pause.as_millis() as u64,
                        attempt = pauses,
                        "rate limited, retrying after pause"
                    );
                    sleep(pause).await;
                }

                Err(FetchError::RateLimited) => {
                    error!(height, pauses, "still rate limited, skipping height");
                    return None;
                }

                Err(err) => {
                    error!(height, error = %err, "failed to fetch block, skipping height");
                    return None;
                }
            }
        }
    }

}

/// Returns how many of `addresses` were new
async fn save(db: &Db, addresses: &BlockAddresses) -> Result<u64> {
    let mut inserted = 0;

    for address in addresses.iter().filter(|a| is_valid_address(a)) {
        if db.save_address(address).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use reqwest::StatusCode;
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::test_utils::{db, ingest_config, ScriptedFetcher};

    const ADDR: &str = "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2";

    fn worker(db: &Db, chunk: Chunk, fetcher: &ScriptedFetcher) -> Worker<ScriptedFetcher> {
        Worker::new(
            0,
            chunk,
            fetcher.clone(),
            db.clone(),
            ProgressTracker::new(db.clone(), chunk.first),
            RateLimitPolicy::from(&ingest_config(chunk.last, 1)),
        )
    }

    #[rstest]
    #[tokio::test]
    async fn test_rate_limit_pauses_are_bounded(#[future(awt)] db: (TempDir, Db)) -> Result<()> {
        let (_dir, db) = db;
        let fetcher = ScriptedFetcher::default();
        for _ in 0..100 {
            fetcher.script(1, Err(FetchError::RateLimited));
        }

        let report = worker(&db, Chunk { first: 1, last: 2 }, &fetcher)
            .run()
            .await?;

        // first attempt plus 5 paused retries for height 1, then height 2
        assert_eq!(fetcher.calls(), [vec![1; 6], vec![2]].concat());
        assert_eq!(report.failed, vec![1]);
        assert_eq!(report.completed, 1);

        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn test_rate_limit_then_success(#[future(awt)] db: (TempDir, Db)) -> Result<()> {
        let (_dir, db) = db;
        let fetcher = ScriptedFetcher::default();
        fetcher.script(1, Err(FetchError::RateLimited));
        fetcher.script(1, Err(FetchError::RateLimited));
        fetcher.script(1, Ok(BlockAddresses::from([ADDR.to_owned()])));

        let report = worker(&db, Chunk { first: 1, last: 1 }, &fetcher)
            .run()
            .await?;

        assert_eq!(fetcher.calls(), vec![1, 1, 1]);
        assert_eq!(report.completed, 1);
        assert!(report.failed.is_empty());
        assert_eq!(db.addresses().await?, vec![ADDR.to_owned()]);

        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn test_failed_height_is_skipped(#[future(awt)] db: (TempDir, Db)) -> Result<()> {
        let (_dir, db) = db;
        let fetcher = ScriptedFetcher::default();
        fetcher.script(2, Err(FetchError::Status(StatusCode::NOT_FOUND)));
        fetcher.script(3, Ok(BlockAddresses::from([ADDR.to_owned()])));

        let report = worker(&db, Chunk { first: 1, last: 3 }, &fetcher)
            .run()
            .await?;

        assert_eq!(fetcher.calls(), vec![1, 2, 3]);
        assert_eq!(
            report,
            WorkerReport {
                completed: 2,
                inserted: 1,
                failed: vec![2],
            }
        );
        assert_eq!(db.get_progress().await?, 1);
        assert_eq!(db.addresses().await?, vec![ADDR.to_owned()]);

        Ok(())
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runs_on_spawned_task(#[future(awt)] db: (TempDir, Db)) -> Result<()> {
        let (_dir, db) = db;
        let fetcher = ScriptedFetcher::default();
        fetcher.script(2, Ok(BlockAddresses::from([ADDR.to_owned()])));

        let handle = tokio::spawn(worker(&db, Chunk { first: 1, last: 3 }, &fetcher).run());
        let report = handle.await??;

        assert_eq!(report.completed, 3);
        assert_eq!(report.inserted, 1);
        assert_eq!(db.get_progress().await?, 3);

        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn test_malformed_addresses_are_not_saved(
        #[future(awt)] db: (TempDir, Db),
    ) -> Result<()> {
        let (_dir, db) = db;
        let fetcher = ScriptedFetcher::default();
        fetcher.script(
            1,
            Ok(BlockAddresses::from([
                ADDR.to_owned(),
                "d-1234-5678".to_owned(),
            ])),
        );

        let report = worker(&db, Chunk { first: 1, last: 1 }, &fetcher)
            .run()
            .await?;

        assert_eq!(report.inserted, 1);
        assert_eq!(db.count_addresses().await?, 1);
        assert_eq!(db.get_progress().await?, 1);

        Ok(())
    }
}
