//! Transport-level failure classification and retry policy.
//!
//! Both remote clients report failures as [`ApiError`]. Callers decide what a
//! failure means for the sync; this module only knows whether it is worth
//! trying again.

use std::future::Future;
use std::time::Duration;

use log::warn;
use thiserror::Error;

/// Failure of a single request to a remote API.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// 401: credential missing, expired or revoked
    #[error("unauthorized")]
    Unauthorized,
    /// 429: the server refused the request because of its rate limit
    #[error("rate limited by server")]
    RateLimited { retry_after: Option<Duration> },
    /// 404
    #[error("not found")]
    NotFound,
    /// Any other non-success status
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    /// Connection, timeout or body read failure
    #[error("request error: {0}")]
    Transport(String),
    /// The response body could not be decoded
    #[error("invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Map a non-success status code to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 => ApiError::Unauthorized,
            404 => ApiError::NotFound,
            429 => ApiError::RateLimited { retry_after: None },
            _ => ApiError::Status {
                status,
                message: message.into(),
            },
        }
    }

    /// Timeouts, dropped connections and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => *status == 408 || *status >= 500,
            _ => false,
        }
    }
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry, doubled for every further retry
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base, 2x base, 4x base...
    pub fn delay(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1 << shift)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let wait = self.delay(attempt);
                    warn!(
                        "[Retry] {} failed: {}, retry {} after {:?}",
                        what, e, attempt, wait
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
