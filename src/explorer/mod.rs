mod error;
mod retry;
mod types;

use std::collections::HashSet;

use async_trait::async_trait;
use color_eyre::eyre::Result;
use rand::{rngs::StdRng, SeedableRng};
use reqwest::{Response, StatusCode};
use tokio::time::sleep;
use tracing::warn;
use url::Url;

use crate::config::ExplorerConfig;

pub use self::error::{FetchError, FetchResult};
pub use self::retry::{BackoffState, CallSiteBackoff, TransportRetry};
pub use self::types::{RawBlock, RawOutput, RawTransaction};

/// Distinct destination addresses found in one block
pub type BlockAddresses = HashSet<String>;

/// Source of per-block address sets.
/// Each ingestion worker owns one and runs on its own spawned task
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    async fn fetch_block(&mut self, height: u64) -> FetchResult<BlockAddresses>;
}

/// Builds one [`BlockFetcher`] per worker
pub trait FetcherFactory: Send + Sync + 'static {
    type Fetcher: BlockFetcher + 'static;

    fn build(&self) -> Result<Self::Fetcher>;
}

impl FetcherFactory for ExplorerConfig {
    type Fetcher = ExplorerClient;

    fn build(&self) -> Result<ExplorerClient> {
        ExplorerClient::new(self)
    }
}

/// HTTP client for the explorer's raw block endpoint
///
/// Retries happen at two levels: every request is retried on send errors and on 429/5xx
/// (see [`TransportRetry`]), and the whole fetch is retried with jittered exponential backoff
/// while the failure stays transient (see [`CallSiteBackoff`])
#[derive(Debug)]
pub struct ExplorerClient {
    http: reqwest::Client,
    base_url: Url,
    transport: TransportRetry,
    call_site: CallSiteBackoff,
    rng: StdRng,
}

impl ExplorerClient {
    pub fn new(config: &ExplorerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            http,
            base_url: config.block_base(),
            transport: TransportRetry::from(&config.transport),
            call_site: CallSiteBackoff::from(&config.call_site),
            rng: StdRng::from_entropy(),
        })
    }

    pub fn block_url(&self, height: u64) -> FetchResult<Url> {
        Ok(self.base_url.join(&height.to_string())?)
    }

    async fn send(&self, height: u64, url: &Url) -> FetchResult<Response> {
        let max_retries = self.transport.max_retries;
        let mut retry = 0;

        loop {
            let (reason, delay) = match self.http.get(url.clone()).send().await {
                Ok(resp) if !TransportRetry::is_retryable(resp.status()) => return Ok(resp),

                Ok(resp) => {
                    let status = resp.status();
                    if retry >= max_retries {
                        return Err(match status {
                            StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited,
                            _ => FetchError::Transient(format!(
                                "status {status} after {retry} retries"
                            )),
                        });
                    }

                    retry += 1;
                    let server_delay = match status {
                        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                            self.transport.retry_after(resp.headers())
                        }
                        _ => None,
                    };
                    let delay = server_delay.unwrap_or_else(|| self.transport.delay(retry));
                    (format!("status {status}"), delay)
                }

                Err(err) => {
                    if retry >= max_retries {
                        return Err(FetchError::Transient(err.to_string()));
                    }

                    retry += 1;
                    (err.to_string(), self.transport.delay(retry))
                }
            };

            warn!(
                height,
                retry,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "retrying request"
            );
            sleep(delay).await;
        }
    }

    async fn fetch_once(&self, height: u64, url: &Url) -> FetchResult<BlockAddresses> {
        let resp = self.send(height, url).await?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status(status));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        let block: RawBlock = serde_json::from_slice(&body)?;

        Ok(block.addresses())
    }
}

#[async_trait]
impl BlockFetcher for ExplorerClient {
    async fn fetch_block(&mut self, height: u64) -> FetchResult<BlockAddresses> {
        let url = self.block_url(height)?;
        let mut backoff = self.call_site.start();

        loop {
            match self.fetch_once(height, &url).await {
                Err(FetchError::Transient(reason)) => match backoff.next_delay(&mut self.rng) {
                    Some(delay) => {
                        warn!(
                            height,
                            attempt = backoff.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            %reason,
                            "block fetch failed, backing off"
                        );
                        sleep(delay).await;
                    }
                    None => {
                        return Err(FetchError::GaveUp {
                            attempts: backoff.attempts(),
                            elapsed: backoff.elapsed(),
                            reason,
                        })
                    }
                },
                res => return res,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use color_eyre::Result;
    use tokio::net::TcpListener;

    use super::*;
    use crate::test_utils::{fast_explorer_config, MockExplorer, Reply};

    const ADDR_A: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
    const ADDR_B: &str = "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy";

    #[tokio::test]
    async fn test_fetch_block() -> Result<()> {
        let explorer = MockExplorer::start().await?;
        explorer.script(7, [Reply::block(&[&[ADDR_A, ADDR_B], &[ADDR_A]])]);

        let mut client = ExplorerClient::new(&explorer.config())?;
        let addresses = client.fetch_block(7).await?;

        assert_eq!(addresses, BlockAddresses::from([ADDR_A.into(), ADDR_B.into()]));
        assert_eq!(explorer.hits(), vec![7]);

        Ok(())
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() -> Result<()> {
        let explorer = MockExplorer::start().await?;
        explorer.script(3, [Reply::status(404)]);

        let mut client = ExplorerClient::new(&explorer.config())?;
        let res = client.fetch_block(3).await;

        assert!(matches!(res, Err(FetchError::Status(StatusCode::NOT_FOUND))));
        assert_eq!(explorer.hits_for(3), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_server_error_is_retried() -> Result<()> {
        let explorer = MockExplorer::start().await?;
        explorer.script(5, [Reply::status(502), Reply::block(&[&[ADDR_B]])]);

        let mut client = ExplorerClient::new(&explorer.config())?;
        let addresses = client.fetch_block(5).await?;

        assert_eq!(addresses, BlockAddresses::from([ADDR_B.into()]));
        assert_eq!(explorer.hits_for(5), 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_rate_limit_survives_transport_retries() -> Result<()> {
        let explorer = MockExplorer::start().await?;
        explorer.script(9, [Reply::status(429), Reply::status(429)]);

        let mut client = ExplorerClient::new(&explorer.config())?;
        let res = client.fetch_block(9).await;

        assert!(matches!(res, Err(FetchError::RateLimited)));
        // one request plus one transport retry, and no call-site retries
        assert_eq!(explorer.hits_for(9), 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_persistent_server_errors_give_up() -> Result<()> {
        let explorer = MockExplorer::start().await?;
        explorer.script(11, std::iter::repeat(Reply::status(503)).take(10_000));

        let mut client = ExplorerClient::new(&explorer.config())?;
        let res = client.fetch_block(11).await;

        assert!(matches!(res, Err(FetchError::GaveUp { .. })));
        // every call-site attempt spends the full transport budget
        assert_eq!(explorer.hits_for(11) % 2, 0);
        assert!(explorer.hits_for(11) >= 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_timed_out_request_is_retried() -> Result<()> {
        let explorer = MockExplorer::start().await?;
        explorer.script(
            4,
            [
                Reply::block(&[&[ADDR_A]]).delayed(Duration::from_millis(500)),
                Reply::block(&[&[ADDR_B]]),
            ],
        );

        let config = ExplorerConfig {
            timeout_ms: 50,
            ..explorer.config()
        };
        let mut client = ExplorerClient::new(&config)?;
        let addresses = client.fetch_block(4).await?;

        // the slow reply never arrives, its retry does
        assert_eq!(addresses, BlockAddresses::from([ADDR_B.into()]));
        assert_eq!(explorer.hits_for(4), 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_hung_explorer_gives_up() -> Result<()> {
        let explorer = MockExplorer::start().await?;
        explorer.script(
            6,
            std::iter::repeat(Reply::block(&[&[ADDR_A]]).delayed(Duration::from_secs(5))).take(100),
        );

        let config = ExplorerConfig {
            timeout_ms: 50,
            ..explorer.config()
        };
        let mut client = ExplorerClient::new(&config)?;
        let res = tokio::time::timeout(Duration::from_secs(2), client.fetch_block(6)).await?;

        assert!(matches!(res, Err(FetchError::GaveUp { .. })));
        assert!(explorer.hits_for(6) >= 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_payload() -> Result<()> {
        let explorer = MockExplorer::start().await?;
        explorer.script(2, [Reply::new(StatusCode::OK, "<html>maintenance</html>")]);

        let mut client = ExplorerClient::new(&explorer.config())?;
        let res = client.fetch_block(2).await;

        assert!(matches!(res, Err(FetchError::Malformed(_))));
        assert_eq!(explorer.hits_for(2), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_explorer_gives_up() -> Result<()> {
        // grab a free port, then release it so nothing is listening there
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let config = ExplorerConfig {
            base_url: Url::parse(&format!("http://{addr}/rawblock/"))?,
            ..fast_explorer_config()
        };

        let mut client = ExplorerClient::new(&config)?;
        let res = client.fetch_block(1).await;

        assert!(matches!(res, Err(FetchError::GaveUp { .. })));

        Ok(())
    }

    #[test]
    fn test_block_url() -> Result<()> {
        let client = ExplorerClient::new(&ExplorerConfig::default())?;

        assert_eq!(
            client.block_url(800_000)?.as_str(),
            "https://blockchain.info/rawblock/800000"
        );

        Ok(())
    }
}
