use std::time::Duration;

use reqwest::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    /// 429 survived the transport retries. Not a failure: the caller should pause and retry
    #[error("rate limited")]
    RateLimited,

    #[error("unexpected status {0}")]
    Status(StatusCode),

    /// Send or body errors, or retryable statuses that outlived the transport budget
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("gave up after {attempts} attempts in {elapsed:?}: {reason}")]
    GaveUp {
        attempts: u32,
        elapsed: Duration,
        reason: String,
    },

    #[error("malformed block payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;
