//! In-memory implementations of the remote seams, shared by the integration
//! tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use activity_sync::source::SampleStream;
use activity_sync::{
    AccessToken, ActivityApi, ActivitySource, ActivitySummary, ApiError, PageQuery, RateBudget,
    RateLimiter, Result, StorageApi, StreamSet, SyncEngine, SyncError, TokenRefresher,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::time::Instant;

pub const TARGET: &str = "/GPX/Strava";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Activity API
// ============================================================================

#[derive(Default)]
pub struct FakeApiState {
    /// Listing, newest first
    pub activities: Vec<ActivitySummary>,
    pub streams: HashMap<String, StreamSet>,
    /// `(when, what)` for every request, e.g. `"list 1"`, `"activity 7"`
    pub calls: Vec<(Instant, String)>,
    /// Number of upcoming requests answered with 401
    pub unauthorized_remaining: u32,
    /// Errors returned before the real answer, keyed by request label
    pub scripted: HashMap<String, VecDeque<ApiError>>,
}

/// Activity API serving a fixed history. Clones share state.
#[derive(Clone, Default)]
pub struct FakeActivityApi {
    pub state: Arc<Mutex<FakeApiState>>,
}

impl FakeActivityApi {
    pub fn new(activities: Vec<ActivitySummary>) -> Self {
        let streams = activities
            .iter()
            .map(|a| (a.id.clone(), track_streams(5)))
            .collect();
        let api = Self::default();
        {
            let mut state = api.state.lock().unwrap();
            state.activities = activities;
            state.streams = streams;
        }
        api
    }

    pub fn set_streams(&self, id: &str, streams: StreamSet) {
        self.state
            .lock()
            .unwrap()
            .streams
            .insert(id.to_string(), streams);
    }

    pub fn remove_streams(&self, id: &str) {
        self.state.lock().unwrap().streams.remove(id);
    }

    pub fn fail_unauthorized(&self, times: u32) {
        self.state.lock().unwrap().unauthorized_remaining = times;
    }

    /// Answer the next `times` requests labelled `label` with `error`.
    pub fn script(&self, label: &str, error: ApiError, times: usize) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(label.to_string())
            .or_default()
            .extend(std::iter::repeat(error).take(times));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(_, label)| label.clone())
            .collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn begin(&self, label: String) -> std::result::Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((Instant::now(), label.clone()));
        if state.unauthorized_remaining > 0 {
            state.unauthorized_remaining -= 1;
            return Err(ApiError::Unauthorized);
        }
        if let Some(error) = state.scripted.get_mut(&label).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityApi for FakeActivityApi {
    async fn list_page(
        &self,
        _token: &str,
        query: PageQuery,
    ) -> std::result::Result<Vec<ActivitySummary>, ApiError> {
        self.begin(format!("list {}", query.page))?;
        let state = self.state.lock().unwrap();
        let start = ((query.page - 1) * query.per_page) as usize;
        Ok(state
            .activities
            .iter()
            .skip(start)
            .take(query.per_page as usize)
            .cloned()
            .collect())
    }

    async fn get_activity(
        &self,
        _token: &str,
        id: &str,
    ) -> std::result::Result<ActivitySummary, ApiError> {
        self.begin(format!("activity {}", id))?;
        let state = self.state.lock().unwrap();
        state
            .activities
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn get_streams(&self, _token: &str, id: &str) -> std::result::Result<StreamSet, ApiError> {
        self.begin(format!("streams {}", id))?;
        let state = self.state.lock().unwrap();
        state.streams.get(id).cloned().ok_or(ApiError::NotFound)
    }
}

pub fn summary(id: &str, name: &str, day: u32) -> ActivitySummary {
    ActivitySummary {
        id: id.to_string(),
        name: name.to_string(),
        start: Utc.with_ymd_and_hms(2024, 5, day, 7, 0, 0).unwrap(),
        activity_type: "Ride".to_string(),
        sport_type: "GravelRide".to_string(),
    }
}

/// Streams for a short track heading north-east, one sample every 5 s.
pub fn track_streams(points: usize) -> StreamSet {
    StreamSet {
        time: Some(SampleStream::new((0..points as i64).map(|i| i * 5).collect())),
        latlng: Some(SampleStream::new(
            (0..points)
                .map(|i| [46.5 + i as f64 * 0.0001, 6.6 + i as f64 * 0.0001])
                .collect(),
        )),
        altitude: Some(SampleStream::new((0..points).map(|i| 372.0 + i as f64).collect())),
        heartrate: Some(SampleStream::new((0..points).map(|_| Some(130.0)).collect())),
        ..Default::default()
    }
}

// ============================================================================
// Token refresh
// ============================================================================

#[derive(Clone, Default)]
pub struct FakeRefresher {
    pub calls: Arc<AtomicU32>,
    pub fail: Arc<std::sync::atomic::AtomicBool>,
}

impl FakeRefresher {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for FakeRefresher {
    async fn refresh(&self) -> Result<AccessToken> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::Auth {
                message: "refresh token revoked".to_string(),
            });
        }
        Ok(AccessToken::new(format!("token-{}", n), None))
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Default)]
pub struct FakeStorageState {
    pub files: HashMap<String, Vec<u8>>,
    pub folders: HashSet<String>,
    /// Path of every successful PUT, in order
    pub puts: Vec<String>,
    /// PUTs to these paths fail with 507 while the counter is positive
    pub failing_puts: HashMap<String, u32>,
    /// GETs of these paths fail with 503
    pub failing_gets: HashSet<String>,
}

/// Storage with WebDAV-like folder semantics.
#[derive(Default)]
pub struct FakeStorage {
    pub state: Mutex<FakeStorageState>,
}

impl FakeStorage {
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn insert(&self, path: &str, content: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_vec());
    }

    pub fn puts(&self) -> Vec<String> {
        self.state.lock().unwrap().puts.clone()
    }

    pub fn gpx_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .files
            .keys()
            .filter(|p| p.ends_with(".gpx"))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn fail_puts(&self, path: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failing_puts
            .insert(path.to_string(), times);
    }

    pub fn has_folder(&self, path: &str) -> bool {
        self.state.lock().unwrap().folders.contains(path)
    }
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

#[async_trait]
impl StorageApi for FakeStorage {
    async fn get(&self, path: &str) -> std::result::Result<Option<Vec<u8>>, ApiError> {
        let state = self.state.lock().unwrap();
        if state.failing_gets.contains(path) {
            return Err(ApiError::from_status(503, "maintenance mode"));
        }
        Ok(state.files.get(path).cloned())
    }

    async fn put(&self, path: &str, content: Vec<u8>) -> std::result::Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.failing_puts.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ApiError::from_status(507, "insufficient storage"));
            }
        }
        let folder = parent(path);
        if folder != "/" && !state.folders.contains(folder) {
            return Err(ApiError::from_status(409, "parent folder missing"));
        }
        state.files.insert(path.to_string(), content);
        state.puts.push(path.to_string());
        Ok(())
    }

    async fn make_folder(&self, path: &str) -> std::result::Result<bool, ApiError> {
        let mut state = self.state.lock().unwrap();
        let folder = parent(path);
        if folder != "/" && !state.folders.contains(folder) {
            return Err(ApiError::from_status(409, "parent folder missing"));
        }
        Ok(state.folders.insert(path.to_string()))
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub fn limiter(short_limit: u32, max_wait: Duration) -> RateLimiter {
    RateLimiter::new(
        vec![
            RateBudget::new("15min", short_limit, Duration::from_secs(900)),
            RateBudget::new("daily", 1000, Duration::from_secs(86_400)),
        ],
        max_wait,
    )
}

pub fn source(
    api: &FakeActivityApi,
    refresher: &FakeRefresher,
) -> ActivitySource<FakeActivityApi, FakeRefresher> {
    ActivitySource::new(
        api.clone(),
        refresher.clone(),
        limiter(100, Duration::from_secs(900)),
    )
}

pub fn engine(
    api: &FakeActivityApi,
    storage: &Arc<FakeStorage>,
) -> SyncEngine<FakeActivityApi, FakeRefresher, FakeStorage> {
    SyncEngine::new(
        source(api, &FakeRefresher::default()),
        Arc::clone(storage),
        TARGET,
    )
}
