//! Unified error handling for the activity-sync library.
//!
//! `SyncError` is the error every public operation returns. Transport-level
//! failures are reported as [`ApiError`](crate::transport::ApiError) by the
//! remote clients and mapped to a `SyncError` by the component that knows
//! what was being attempted.

use std::time::Duration;

use thiserror::Error;

/// Unified error type for sync operations.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Bearer credential rejected or token refresh failed. Fatal for the cycle.
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// Waiting for the rate-limit window would exceed the configured maximum.
    #[error("Rate limit budget exhausted, next request allowed in {}s", retry_after.as_secs())]
    RateLimitExceeded { retry_after: Duration },

    /// Listing or fetching from the activity API failed after retries.
    #[error("Failed to fetch {resource}: {message}")]
    FetchFailed { resource: String, message: String },

    /// Writing a route file (or its folder) to storage failed after retries.
    #[error("Failed to upload '{path}': {message}")]
    Upload { path: String, message: String },

    /// Activity data is structurally unusable. Never retried.
    #[error("Cannot encode activity '{activity_id}': {message}")]
    Encoding {
        activity_id: String,
        message: String,
    },

    /// The remote sync record could not be read or written.
    #[error("Remote state unavailable: {message}")]
    StorageUnavailable { message: String },

    /// Missing or malformed configuration at startup.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl SyncError {
    /// Whether this error stops the current cycle rather than a single activity.
    pub fn aborts_cycle(&self) -> bool {
        matches!(
            self,
            SyncError::Auth { .. }
                | SyncError::RateLimitExceeded { .. }
                | SyncError::StorageUnavailable { .. }
                | SyncError::Config { .. }
        )
    }

    /// Whether retrying the same activity in a later cycle can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::Encoding { .. } | SyncError::Config { .. })
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        SyncError::Config {
            message: message.into(),
        }
    }

    pub(crate) fn encoding(activity_id: &str, message: impl Into<String>) -> Self {
        SyncError::Encoding {
            activity_id: activity_id.to_string(),
            message: message.into(),
        }
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
