#![cfg(test)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Router,
};
use color_eyre::Result;
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;
use url::Url;

use crate::config::{CallSiteConfig, DbConfig, ExplorerConfig, IngestConfig, TransportConfig};
use crate::db::Db;
use crate::explorer::{BlockAddresses, BlockFetcher, FetchResult, FetcherFactory};

#[rstest::fixture]
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().unwrap()
}

/// Initialized store backed by a throwaway file. Keep the `TempDir` alive for the test's duration
#[rstest::fixture]
pub async fn db() -> (TempDir, Db) {
    let dir = tempfile::tempdir().unwrap();
    let config = DbConfig {
        url: dir.path().join("addresses.db").display().to_string(),
    };

    let db = Db::connect(&config).await.unwrap();
    db.initialize().await.unwrap();

    (dir, db)
}

/// Explorer settings with millisecond-scale retry delays
pub fn fast_explorer_config() -> ExplorerConfig {
    ExplorerConfig {
        base_url: Url::parse("http://127.0.0.1:1/rawblock/").unwrap(),
        timeout_ms: 2_000,
        transport: TransportConfig {
            max_retries: 1,
            backoff_factor_ms: 1,
            max_backoff_ms: 5,
        },
        call_site: CallSiteConfig {
            initial_delay_ms: 1,
            max_elapsed_ms: 30,
        },
    }
}

pub fn ingest_config(target_height: u64, workers: usize) -> IngestConfig {
    IngestConfig {
        target_height,
        workers: Some(workers),
        max_workers: 32,
        rate_limit_retries: 5,
        rate_limit_pause_min_ms: 1,
        rate_limit_pause_max_ms: 3,
    }
}

/// Scripted response served by [`MockExplorer`]
#[derive(Debug, Clone)]
pub struct Reply {
    status: StatusCode,
    body: String,
    delay: Duration,
}

impl Reply {
    pub fn new(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            body: body.to_owned(),
            delay: Duration::ZERO,
        }
    }

    /// Holds the response back for `delay` before sending it
    pub fn delayed(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    pub fn status(code: u16) -> Self {
        Self::new(StatusCode::from_u16(code).unwrap(), "")
    }

    /// 200 with one transaction per entry, each holding one output per address
    pub fn block(txs: &[&[&str]]) -> Self {
        let tx: Vec<_> = txs
            .iter()
            .map(|outs| {
                let out: Vec<_> = outs
                    .iter()
                    .map(|addr| json!({ "addr": addr, "value": 1000 }))
                    .collect();
                json!({ "out": out })
            })
            .collect();

        Self::new(StatusCode::OK, &json!({ "tx": tx }).to_string())
    }
}

#[derive(Default)]
struct MockState {
    scripts: Mutex<HashMap<u64, VecDeque<Reply>>>,
    hits: Mutex<Vec<u64>>,
}

/// In-process stand-in for the explorer's raw block endpoint.
/// Heights without a script (or whose script ran out) get an empty block
pub struct MockExplorer {
    url: Url,
    state: Arc<MockState>,
}

impl MockExplorer {
    pub async fn start() -> Result<Self> {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/rawblock/:height", get(rawblock))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move { axum::serve(listener, app).await });

        Ok(Self {
            url: Url::parse(&format!("http://{addr}/rawblock/"))?,
            state,
        })
    }

    pub fn script(&self, height: u64, replies: impl IntoIterator<Item = Reply>) {
        self.state
            .scripts
            .lock()
            .unwrap()
            .entry(height)
            .or_default()
            .extend(replies);
    }

    /// Requested heights, in arrival order
    pub fn hits(&self) -> Vec<u64> {
        self.state.hits.lock().unwrap().clone()
    }

    pub fn hits_for(&self, height: u64) -> usize {
        self.hits().into_iter().filter(|h| *h == height).count()
    }

    pub fn config(&self) -> ExplorerConfig {
        ExplorerConfig {
            base_url: self.url.clone(),
            ..fast_explorer_config()
        }
    }
}

async fn rawblock(
    State(state): State<Arc<MockState>>,
    Path(height): Path<u64>,
) -> (StatusCode, String) {
    state.hits.lock().unwrap().push(height);

    let reply = state
        .scripts
        .lock()
        .unwrap()
        .get_mut(&height)
        .and_then(|replies| replies.pop_front())
        .unwrap_or_else(|| Reply::block(&[]));

    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }

    (reply.status, reply.body)
}

/// [`BlockFetcher`] playing back canned results per height.
/// Clones share their script and call log; unscripted heights yield an empty block
#[derive(Clone, Default)]
pub struct ScriptedFetcher {
    replies: Arc<Mutex<HashMap<u64, VecDeque<FetchResult<BlockAddresses>>>>>,
    calls: Arc<Mutex<Vec<u64>>>,
}

impl ScriptedFetcher {
    pub fn script(&self, height: u64, reply: FetchResult<BlockAddresses>) {
        self.replies
            .lock()
            .unwrap()
            .entry(height)
            .or_default()
            .push_back(reply);
    }

    /// Requested heights, in call order
    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlockFetcher for ScriptedFetcher {
    async fn fetch_block(&mut self, height: u64) -> FetchResult<BlockAddresses> {
        self.calls.lock().unwrap().push(height);

        self.replies
            .lock()
            .unwrap()
            .get_mut(&height)
            .and_then(|replies| replies.pop_front())
            .unwrap_or_else(|| Ok(BlockAddresses::new()))
    }
}

impl FetcherFactory for ScriptedFetcher {
    type Fetcher = ScriptedFetcher;

    fn build(&self) -> Result<ScriptedFetcher> {
        Ok(self.clone())
    }
}
