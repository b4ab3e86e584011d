//! # Activity Source
//!
//! Lists activities and fetches their tracks from the activity API.
//!
//! Every request goes through the same path:
//! 1. claim a slot from the [`RateLimiter`] (waiting, or refusing with
//!    `RateLimitExceeded`)
//! 2. attach a bearer token, refreshing it first when missing or expired
//! 3. on 401 refresh once and retry; a second 401 is an `Auth` error
//! 4. on 429 tell the limiter and go back to step 1
//! 5. retry transient failures with exponential backoff, then `FetchFailed`

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::auth::{AccessToken, TokenRefresher};
use crate::error::{Result, SyncError};
use crate::rate_limit::{RateLimiter, SHORT_WINDOW};
use crate::transport::{ApiError, RetryPolicy};
use crate::{Activity, ActivitySummary, TrackPoint};

/// Largest page the Strava listing endpoint accepts.
pub const PAGE_SIZE: u32 = 200;

/// One page request of the activity listing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageQuery {
    /// 1-based page number
    pub page: u32,
    pub per_page: u32,
    /// Only activities that started after this instant
    pub after: Option<DateTime<Utc>>,
}

/// Raw activity API, one method per endpoint.
///
/// Implementations perform exactly one request per call and leave rate
/// limiting, retries and token refresh to [`ActivitySource`].
#[async_trait]
pub trait ActivityApi: Send + Sync {
    /// One page of the athlete's activities, newest first.
    async fn list_page(
        &self,
        token: &str,
        query: PageQuery,
    ) -> std::result::Result<Vec<ActivitySummary>, ApiError>;

    /// Metadata of a single activity.
    async fn get_activity(
        &self,
        token: &str,
        id: &str,
    ) -> std::result::Result<ActivitySummary, ApiError>;

    /// Sample streams of a single activity.
    async fn get_streams(&self, token: &str, id: &str) -> std::result::Result<StreamSet, ApiError>;
}

/// A single sample stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SampleStream<T> {
    pub data: Vec<T>,
}

impl<T> SampleStream<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// Activity sample streams, keyed by type.
///
/// Streams the activity was not recorded with are absent. Sensor streams may
/// contain gaps.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StreamSet {
    /// Seconds since the activity start
    pub time: Option<SampleStream<i64>>,
    /// `[lat, lng]` pairs
    pub latlng: Option<SampleStream<[f64; 2]>>,
    pub altitude: Option<SampleStream<f64>>,
    pub heartrate: Option<SampleStream<Option<f64>>>,
    pub cadence: Option<SampleStream<Option<f64>>>,
    pub watts: Option<SampleStream<Option<f64>>>,
    pub temp: Option<SampleStream<Option<f64>>>,
}

impl StreamSet {
    /// Zip the streams into track points.
    ///
    /// An activity without position data yields an empty track. Streams of
    /// different lengths, or positions without times, cannot be aligned and
    /// are reported as an encoding error.
    pub fn into_track(self, activity_id: &str, start: DateTime<Utc>) -> Result<Vec<TrackPoint>> {
        let Some(latlng) = self.latlng else {
            return Ok(Vec::new());
        };
        let Some(time) = self.time else {
            return Err(SyncError::encoding(
                activity_id,
                "track has positions but no time stream",
            ));
        };

        let len = latlng.data.len();
        let check = |name: &str, other: Option<usize>| match other {
            Some(n) if n != len => Err(SyncError::encoding(
                activity_id,
                format!("latlng and {} streams differ in length ({} vs {})", name, len, n),
            )),
            _ => Ok(()),
        };
        check("time", Some(time.data.len()))?;
        check("altitude", self.altitude.as_ref().map(|s| s.data.len()))?;
        check("heartrate", self.heartrate.as_ref().map(|s| s.data.len()))?;
        check("cadence", self.cadence.as_ref().map(|s| s.data.len()))?;
        check("watts", self.watts.as_ref().map(|s| s.data.len()))?;
        check("temp", self.temp.as_ref().map(|s| s.data.len()))?;

        let points = latlng
            .data
            .iter()
            .zip(&time.data)
            .enumerate()
            .map(|(i, (&[lat, lng], &offset))| TrackPoint {
                latitude: lat,
                longitude: lng,
                elevation: self.altitude.as_ref().map(|s| s.data[i]),
                time: start + ChronoDuration::seconds(offset),
                heart_rate: sample(&self.heartrate, i).map(to_u16),
                cadence: sample(&self.cadence, i).map(to_u16),
                power: sample(&self.watts, i).map(to_u16),
                temperature: sample(&self.temp, i),
            })
            .collect();
        Ok(points)
    }
}

fn sample(stream: &Option<SampleStream<Option<f64>>>, i: usize) -> Option<f64> {
    stream
        .as_ref()
        .and_then(|s| s.data.get(i).copied().flatten())
        .filter(|v| v.is_finite())
}

fn to_u16(value: f64) -> u16 {
    value.round().clamp(0.0, u16::MAX as f64) as u16
}

/// Rate-limited, token-refreshing view of an [`ActivityApi`].
pub struct ActivitySource<A, T> {
    api: A,
    refresher: T,
    limiter: RateLimiter,
    retry: RetryPolicy,
    token: Mutex<Option<AccessToken>>,
    per_page: u32,
}

impl<A: ActivityApi, T: TokenRefresher> ActivitySource<A, T> {
    pub fn new(api: A, refresher: T, limiter: RateLimiter) -> Self {
        Self {
            api,
            refresher,
            limiter,
            retry: RetryPolicy::default(),
            token: Mutex::new(None),
            per_page: PAGE_SIZE,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_page_size(mut self, per_page: u32) -> Self {
        self.per_page = per_page.clamp(1, PAGE_SIZE);
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Lazily page through the athlete's activities, newest first.
    ///
    /// Pages are requested only as the stream is polled. The listing ends at
    /// the first empty or short page. Dropping the stream and calling this
    /// again restarts from the first page.
    pub fn list_activities(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> impl Stream<Item = Result<ActivitySummary>> + '_ {
        stream::try_unfold(Some(1u32), move |page| self.next_page(page, since))
            .map_ok(|items| stream::iter(items.into_iter().map(Ok::<_, SyncError>)))
            .try_flatten()
    }

    async fn next_page(
        &self,
        page: Option<u32>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<(Vec<ActivitySummary>, Option<u32>)>> {
        let Some(page) = page else {
            return Ok(None);
        };
        let query = PageQuery {
            page,
            per_page: self.per_page,
            after: since,
        };
        let resource = format!("activity list page {}", page);
        let items = self
            .call(&resource, move |token| async move {
                self.api.list_page(&token, query).await
            })
            .await?;

        debug!(
            "[ActivitySource] Page {} returned {} activities",
            page,
            items.len()
        );
        if items.is_empty() {
            return Ok(None);
        }
        let next = (items.len() as u32 >= self.per_page).then_some(page + 1);
        Ok(Some((items, next)))
    }

    /// Fetch metadata and track of one activity.
    ///
    /// Issues two requests, both counted against the rate budget.
    pub async fn fetch_activity_detail(&self, id: &str) -> Result<Activity> {
        let resource = format!("activity {}", id);
        let summary = self
            .call(&resource, move |token| async move {
                self.api.get_activity(&token, id).await
            })
            .await?;

        let resource = format!("streams of activity {}", id);
        let streams = self
            .call(&resource, move |token| async move {
                match self.api.get_streams(&token, id).await {
                    // Manual activities have no streams at all
                    Err(ApiError::NotFound) => Ok(StreamSet::default()),
                    other => other,
                }
            })
            .await?;

        let track = streams.into_track(id, summary.start)?;
        debug!(
            "[ActivitySource] Activity {} has {} track points",
            id,
            track.len()
        );
        Ok(Activity::from_summary(summary, track))
    }

    async fn access_token(&self, force_refresh: bool) -> Result<String> {
        let mut current = self.token.lock().await;
        if let Some(token) = current.as_ref() {
            if !force_refresh && !token.is_expired(Utc::now()) {
                return Ok(token.token.clone());
            }
        }
        debug!("[ActivitySource] Refreshing access token");
        let fresh = self.refresher.refresh().await?;
        let value = fresh.token.clone();
        *current = Some(fresh);
        Ok(value)
    }

    async fn call<R, F, Fut>(&self, resource: &str, op: F) -> Result<R>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = std::result::Result<R, ApiError>>,
    {
        let mut attempt = 1;
        let mut refreshed = false;

        loop {
            // A failed token refresh must not use up a request slot
            let token = self.access_token(false).await?;
            self.limiter.acquire().await?;

            let err = match op(token).await {
                Ok(value) => {
                    self.limiter.record_success();
                    return Ok(value);
                }
                Err(e) => e,
            };

            match err {
                ApiError::Unauthorized if !refreshed => {
                    info!(
                        "[ActivitySource] 401 for {}, refreshing token and retrying",
                        resource
                    );
                    refreshed = true;
                    self.access_token(true).await?;
                }
                ApiError::Unauthorized => {
                    return Err(SyncError::Auth {
                        message: format!("{} rejected after token refresh", resource),
                    });
                }
                ApiError::RateLimited { retry_after } => {
                    self.limiter.record_429(retry_after).await;
                    if attempt >= self.retry.max_attempts {
                        return Err(SyncError::RateLimitExceeded {
                            retry_after: retry_after.unwrap_or(SHORT_WINDOW),
                        });
                    }
                    attempt += 1;
                }
                e if e.is_transient() && attempt < self.retry.max_attempts => {
                    let wait = self.retry.delay(attempt);
                    warn!(
                        "[ActivitySource] Error for {}: {}, retry {} after {:?}",
                        resource, e, attempt, wait
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                e => {
                    return Err(SyncError::FetchFailed {
                        resource: resource.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}
