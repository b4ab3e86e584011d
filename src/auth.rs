//! Bearer token handling for the activity API.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::Result;

/// Refresh a token this long before the server says it expires.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Short-lived bearer token.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub token: String,
    /// `None` when the server did not say
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| now + ChronoDuration::seconds(EXPIRY_MARGIN_SECS) >= at)
    }
}

/// Obtains a fresh access token, e.g. through an OAuth refresh-token grant.
///
/// Failures are reported as `SyncError::Auth`.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<AccessToken>;
}
