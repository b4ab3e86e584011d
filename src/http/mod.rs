//! # HTTP Clients
//!
//! reqwest implementations of the three remote seams:
//! - [`StravaApi`]: activity listing, details and streams
//! - [`StravaTokenRefresher`]: OAuth refresh-token grant
//! - [`WebDavClient`]: Nextcloud file storage
//!
//! Each method performs exactly one request. Status codes are mapped to
//! [`ApiError`] here; retries and rate limiting happen further up.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use crate::transport::ApiError;

mod oauth;
mod strava;
mod webdav;

pub use oauth::StravaTokenRefresher;
pub use strava::StravaApi;
pub use webdav::WebDavClient;

/// Request timeout, including the body download.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 200;

/// Build the shared client configuration.
pub(crate) fn build_client() -> Result<Client, ApiError> {
    Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .tcp_keepalive(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("activity-sync/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ApiError::Transport(format!("Failed to create HTTP client: {}", e)))
}

pub(crate) fn transport_error(e: reqwest::Error) -> ApiError {
    ApiError::Transport(e.to_string())
}

/// Pass successful responses through, map everything else to an
/// [`ApiError`].
pub(crate) async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ApiError::RateLimited {
            retry_after: retry_after(&response),
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_status(status.as_u16(), truncate(&body)))
}

/// Read the whole body.
pub(crate) async fn read_body(response: Response) -> Result<Vec<u8>, ApiError> {
    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(transport_error)
}

/// Parse a `Retry-After` header given in seconds.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((end, _)) => format!("{}...", &body[..end]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_long_bodies() {
        let long = "x".repeat(500);
        let short = truncate(&long);
        assert_eq!(short.len(), MAX_ERROR_BODY + 3);
        assert!(short.ends_with("..."));
        assert_eq!(truncate("  not found \n"), "not found");
    }

    #[test]
    fn test_client_builds() {
        assert!(build_client().is_ok());
    }
}
