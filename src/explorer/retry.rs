use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use crate::config::{CallSiteConfig, TransportConfig};

/// Status codes retried by the transport layer
const RETRY_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Per-request retry budget, applied to send errors and to [`RETRY_STATUSES`]
#[derive(Debug, Clone)]
pub struct TransportRetry {
    pub max_retries: u32,
    factor: Duration,
    max_backoff: Duration,
}

impl TransportRetry {
    pub fn is_retryable(status: StatusCode) -> bool {
        RETRY_STATUSES.contains(&status)
    }

    /// Delay before the `retry`-th retry (1-based).
    /// The first retry goes out immediately, then `factor * 2^(retry - 1)`
    pub fn delay(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return Duration::ZERO;
        }

        let exp = 1u32 << (retry - 1).min(20);
        self.factor.saturating_mul(exp).min(self.max_backoff)
    }

    /// Server-provided delay, honoured for rate limiting and maintenance responses.
    /// Only the delta-seconds form is understood
    pub fn retry_after(&self, headers: &HeaderMap) -> Option<Duration> {
        let secs = headers
            .get(RETRY_AFTER)?
            .to_str()
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()?;

        Some(Duration::from_secs(secs).min(self.max_backoff))
    }
}

impl From<&TransportConfig> for TransportRetry {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            factor: Duration::from_millis(config.backoff_factor_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Exponential backoff with full jitter, bounded by total elapsed time.
/// Wraps a whole block fetch, so failures that survive [`TransportRetry`] still get retried
#[derive(Debug, Clone)]
pub struct CallSiteBackoff {
    initial: Duration,
    max_elapsed: Duration,
}

impl CallSiteBackoff {
    pub fn start(&self) -> BackoffState {
        BackoffState {
            next: self.initial,
            max_elapsed: self.max_elapsed,
            started: Instant::now(),
            attempts: 1,
        }
    }
}

impl From<&CallSiteConfig> for CallSiteBackoff {
    fn from(config: &CallSiteConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_delay_ms),
            max_elapsed: Duration::from_millis(config.max_elapsed_ms),
        }
    }
}

#[derive(Debug)]
pub struct BackoffState {
    next: Duration,
    max_elapsed: Duration,
    started: Instant,
    attempts: u32,
}

impl BackoffState {
    /// How long to wait before the next attempt, or `None` once the time budget is spent
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Option<Duration> {
        let elapsed = self.started.elapsed();
        if elapsed >= self.max_elapsed {
            return None;
        }

        let ceiling = self.next.as_millis() as u64;
        let jittered = Duration::from_millis(rng.gen_range(0..=ceiling));
        let remaining = self.max_elapsed - elapsed;

        self.next = self.next.saturating_mul(2);
        self.attempts += 1;

        Some(jittered.min(remaining))
    }

    /// Attempts made so far, including the first one
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
