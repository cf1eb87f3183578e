use std::time::Duration;

use serde::Deserialize;
use url::Url;

#[derive(Deserialize, Clone, Debug)]
pub struct ExplorerConfig {
    /// Prefix of the per-block resource. The block height is appended to it
    #[serde(default = "default_base_url")]
    pub base_url: Url,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub call_site: CallSiteConfig,
}

/// Retries applied to a single request: send errors and retryable status codes
#[derive(Deserialize, Clone, Debug)]
pub struct TransportConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_factor_ms")]
    pub backoff_factor_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Retries wrapped around a whole block fetch, bounded by total elapsed time
#[derive(Deserialize, Clone, Debug)]
pub struct CallSiteConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
}

impl ExplorerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `base_url` with a trailing slash, so that joining a height appends instead of replacing
    /// the last path segment
    pub fn block_base(&self) -> Url {
        let mut url = self.base_url.clone();
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url
    }
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_ms: default_timeout_ms(),
            transport: Default::default(),
            call_site: Default::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_factor_ms: default_backoff_factor_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for CallSiteConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_elapsed_ms: default_max_elapsed_ms(),
        }
    }
}

fn default_base_url() -> Url {
    Url::parse("https://blockchain.info/rawblock/").expect("static url")
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_backoff_factor_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    120_000
}

fn default_initial_delay_ms() -> u64 {
    2_000
}

fn default_max_elapsed_ms() -> u64 {
    120_000
}
