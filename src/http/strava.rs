//! Strava REST API v3.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{build_client, check_status, read_body, transport_error};
use crate::source::{ActivityApi, PageQuery, StreamSet};
use crate::transport::ApiError;
use crate::ActivitySummary;

const DEFAULT_BASE_URL: &str = "https://www.strava.com/api/v3";

/// Streams requested for every activity.
const STREAM_KEYS: &str = "time,latlng,altitude,heartrate,cadence,watts,temp";

/// Activity as returned by the listing and detail endpoints. Only the fields
/// the sync needs.
#[derive(Debug, Deserialize)]
struct ApiActivity {
    id: u64,
    #[serde(default)]
    name: String,
    start_date: DateTime<Utc>,
    #[serde(rename = "type", default)]
    activity_type: String,
    #[serde(default)]
    sport_type: Option<String>,
}

impl From<ApiActivity> for ActivitySummary {
    fn from(a: ApiActivity) -> Self {
        // Older activities predate sport_type
        let sport_type = a
            .sport_type
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| a.activity_type.clone());
        ActivitySummary {
            id: a.id.to_string(),
            name: a.name,
            start: a.start_date,
            activity_type: a.activity_type,
            sport_type,
        }
    }
}

/// Bearer-authenticated Strava client.
pub struct StravaApi {
    client: Client,
    base_url: String,
}

impl StravaApi {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Client against a different API root, e.g. a local mock server.
    pub fn with_base_url(base_url: &str) -> Result<Self, ApiError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<R: DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<R, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("[StravaApi] GET {}", path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        let bytes = read_body(check_status(response).await?).await?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl ActivityApi for StravaApi {
    async fn list_page(
        &self,
        token: &str,
        query: PageQuery,
    ) -> Result<Vec<ActivitySummary>, ApiError> {
        let mut params = vec![
            ("per_page", query.per_page.to_string()),
            ("page", query.page.to_string()),
        ];
        if let Some(after) = query.after {
            params.push(("after", after.timestamp().to_string()));
        }
        let page: Vec<ApiActivity> = self
            .get_json(token, "/athlete/activities", &params)
            .await?;
        Ok(page.into_iter().map(ActivitySummary::from).collect())
    }

    async fn get_activity(&self, token: &str, id: &str) -> Result<ActivitySummary, ApiError> {
        let activity: ApiActivity = self
            .get_json(
                token,
                &format!("/activities/{}", id),
                &[("include_all_efforts", "false".to_string())],
            )
            .await?;
        Ok(activity.into())
    }

    async fn get_streams(&self, token: &str, id: &str) -> Result<StreamSet, ApiError> {
        self.get_json(
            token,
            &format!("/activities/{}/streams", id),
            &[
                ("keys", STREAM_KEYS.to_string()),
                ("key_by_type", "true".to_string()),
            ],
        )
        .await
    }
}
