//! Strava OAuth refresh-token grant.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{build_client, check_status, read_body, transport_error};
use crate::auth::{AccessToken, TokenRefresher};
use crate::error::{Result, SyncError};
use crate::transport::ApiError;

const DEFAULT_TOKEN_URL: &str = "https://www.strava.com/oauth/token";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Unix seconds
    #[serde(default)]
    expires_at: Option<i64>,
    /// Strava may rotate the refresh token on any grant
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Exchanges the long-lived refresh token for short-lived access tokens.
pub struct StravaTokenRefresher {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: Mutex<String>,
}

impl StravaTokenRefresher {
    pub fn new(client_id: &str, client_secret: &str, refresh_token: &str) -> Result<Self> {
        Self::with_token_url(DEFAULT_TOKEN_URL, client_id, client_secret, refresh_token)
    }

    pub fn with_token_url(
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<Self> {
        let client = build_client().map_err(|e| SyncError::config(e.to_string()))?;
        Ok(Self {
            client,
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            refresh_token: Mutex::new(refresh_token.to_string()),
        })
    }

    async fn request(&self, refresh_token: &str) -> std::result::Result<TokenResponse, ApiError> {
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;
        let bytes = read_body(check_status(response).await?).await?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl TokenRefresher for StravaTokenRefresher {
    async fn refresh(&self) -> Result<AccessToken> {
        let mut refresh_token = self.refresh_token.lock().await;
        let response = self
            .request(&refresh_token)
            .await
            .map_err(|e| SyncError::Auth {
                message: format!("token refresh failed: {}", e),
            })?;

        if let Some(rotated) = response.refresh_token.filter(|t| *t != *refresh_token) {
            info!("[StravaTokenRefresher] Refresh token was rotated");
            *refresh_token = rotated;
        }

        let expires_at = response
            .expires_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        debug!(
            "[StravaTokenRefresher] New access token, expires {:?}",
            expires_at.map(|t| t.to_rfc3339())
        );
        Ok(AccessToken::new(response.access_token, expires_at))
    }
}
