mod partition;
mod progress;
mod worker;

use color_eyre::eyre::Result;
use futures::future::join_all;
use tracing::{error, info, instrument};

use crate::config::IngestConfig;
use crate::db::Db;
use crate::explorer::FetcherFactory;

pub use self::partition::{partition, Chunk};
pub use self::progress::{Frontier, ProgressTracker};
pub use self::worker::{RateLimitPolicy, Worker, WorkerReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Running,
    Done,
    /// Setup failed before any work was dispatched
    Failed,
}

/// Summary of one ingestion run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub chunks: usize,
    pub completed: u64,
    pub inserted: u64,

    /// Heights skipped because of fetch failures, ascending
    pub failed: Vec<u64>,

    /// Workers that stopped early because of a store error or a panic
    pub aborted_workers: usize,

    /// Progress marker at the end of the run
    pub progress: u64,
}

/// Drives a run from the stored progress marker up to the target height
///
/// The range is split into one chunk per worker, and every worker walks its own chunk with its
/// own fetcher. The only state they share is the store and the progress tracker.
pub struct Coordinator<F> {
    db: Db,
    config: IngestConfig,
    factory: F,
    phase: Phase,
}

/// `2 ×` the available parallelism unless configured, capped at `max_workers`, and never zero
pub fn worker_count(config: &IngestConfig) -> usize {
    let workers = config.workers.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            * 2
    });

    workers.clamp(1, config.max_workers.max(1))
}

impl<F: FetcherFactory> Coordinator<F> {
    pub fn new(db: Db, config: &IngestConfig, factory: F) -> Self {
        Self {
            db,
            config: config.clone(),
            factory,
            phase: Phase::Init,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[instrument(name = "ingest", skip(self), fields(target = self.config.target_height))]
    pub async fn run(&mut self) -> Result<RunReport> {
        let workers = match self.setup().await {
            Ok(workers) => workers,
            Err(e) => {
                self.phase = Phase::Failed;
                return Err(e);
            }
        };

        self.phase = Phase::Running;
        let mut report = RunReport {
            chunks: workers.len(),
            ..Default::default()
        };

        let handles: Vec<_> = workers
            .into_iter()
            .map(|worker| tokio::spawn(worker.run()))
            .collect();

        for res in join_all(handles).await {
            match res {
                Ok(Ok(worker)) => {
                    report.completed += worker.completed;
                    report.inserted += worker.inserted;
                    report.failed.extend(worker.failed);
                }
                Ok(Err(e)) => {
                    error!(error = %e, "worker aborted");
                    report.aborted_workers += 1;
                }
                Err(e) => {
                    error!(error = %e, "worker panicked");
                    report.aborted_workers += 1;
                }
            }
        }

        report.failed.sort_unstable();
        report.progress = self.db.get_progress().await?;
        self.phase = Phase::Done;

        info!(
            chunks = report.chunks,
            completed = report.completed,
            inserted = report.inserted,
            failed = report.failed.len(),
            aborted_workers = report.aborted_workers,
            progress = report.progress,
            "ingestion finished"
        );

        Ok(report)
    }

    /// Reads the marker, plans the chunks, and builds one worker per chunk
    async fn setup(&self) -> Result<Vec<Worker<F::Fetcher>>> {
        let start = self.db.get_progress().await?;
        let end = self.config.target_height;
        let workers = worker_count(&self.config);
        let chunks = partition(start..=end, workers);

        info!(
            start,
            end,
            workers,
            chunks = chunks.len(),
            "planned ingestion"
        );

        let tracker = ProgressTracker::new(self.db.clone(), start);
        let rate_limit = RateLimitPolicy::from(&self.config);

        chunks
            .into_iter()
            .enumerate()
            .map(|(id, chunk)| {
                Ok(Worker::new(
                    id,
                    chunk,
                    self.factory.build()?,
                    self.db.clone(),
                    tracker.clone(),
                    rate_limit.clone(),
                ))
            })
            .collect()
    }
}
