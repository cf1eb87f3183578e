mod explorer;

use std::path::{Path, PathBuf};

use clap::Parser;
use color_eyre::eyre::Result;
use serde::Deserialize;

pub use self::explorer::{CallSiteConfig, ExplorerConfig, TransportConfig};

#[derive(Debug, clap::Parser)]
struct Args {
    #[clap(
        long,
        default_value = "address-harvester.toml",
        env = "ADDRESS_HARVESTER_CONFIG"
    )]
    config: PathBuf,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,

    #[serde(default)]
    pub explorer: ExplorerConfig,

    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DbConfig {
    #[serde(default = "default_db_url")]
    pub url: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct IngestConfig {
    /// Last height (inclusive) to ingest
    #[serde(default = "default_target_height")]
    pub target_height: u64,

    /// Explicit worker count. Derived from available parallelism when absent
    #[serde(default)]
    pub workers: Option<usize>,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How many times a worker pauses and retries a rate-limited height before skipping it
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,

    #[serde(default = "default_rate_limit_pause_min_ms")]
    pub rate_limit_pause_min_ms: u64,

    #[serde(default = "default_rate_limit_pause_max_ms")]
    pub rate_limit_pause_max_ms: u64,
}

impl Config {
    pub fn read() -> Result<Self> {
        let args = Args::parse();

        Self::read_from(args.config.as_path())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        Ok(toml::from_str(&std::fs::read_to_string(path)?)?)
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            target_height: default_target_height(),
            workers: None,
            max_workers: default_max_workers(),
            rate_limit_retries: default_rate_limit_retries(),
            rate_limit_pause_min_ms: default_rate_limit_pause_min_ms(),
            rate_limit_pause_max_ms: default_rate_limit_pause_max_ms(),
        }
    }
}

fn default_db_url() -> String {
    "bitcoin_addresses.db".to_owned()
}

fn default_target_height() -> u64 {
    800_000
}

fn default_max_workers() -> usize {
    32
}

fn default_rate_limit_retries() -> u32 {
    10
}

fn default_rate_limit_pause_min_ms() -> u64 {
    5_000
}

fn default_rate_limit_pause_max_ms() -> u64 {
    15_000
}
