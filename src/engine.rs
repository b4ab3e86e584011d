//! # Sync Engine
//!
//! Runs the incremental sync, one cycle at a time:
//!
//! ```text
//! Idle -> Listing -> Diffing -> PerActivity(fetch, encode, upload, mark) -> Persisting -> Idle
//! ```
//!
//! An activity id enters the [`SyncRecord`] only after its route file was
//! uploaded. Anything that goes wrong for one activity leaves it unsynced for
//! the next cycle (or, for malformed data, skipped for the rest of the
//! process) and the cycle moves on. Authentication failures and an exhausted
//! rate budget stop the remaining activities, but the record is still
//! persisted with whatever was uploaded before.

use std::collections::HashSet;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use log::{debug, error, info, warn};

use crate::auth::TokenRefresher;
use crate::config::{
    PersistMode, DEFAULT_ERROR_BACKOFF_MAX_SECS, DEFAULT_ERROR_BACKOFF_SECS,
    DEFAULT_SYNC_INTERVAL_SECS,
};
use crate::error::{Result, SyncError};
use crate::gpx;
use crate::sink::FileSink;
use crate::source::{ActivityApi, ActivitySource};
use crate::state::{RemoteStateStore, SyncRecord};
use crate::storage::StorageApi;
use crate::transport::RetryPolicy;
use crate::ActivitySummary;

/// Where the engine is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Listing,
    Diffing,
    PerActivity,
    Persisting,
}

/// Result of syncing one activity.
#[derive(Debug, Clone)]
pub enum ActivityOutcome {
    /// Uploaded to `path`
    Synced { id: String, path: String },
    /// Malformed data, not retried during this process
    Skipped { id: String, reason: String },
    /// Transient failure, retried next cycle
    Failed { id: String, reason: String },
    /// Failure that stops the rest of the cycle
    Halted { id: String, error: SyncError },
}

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Activities returned by the listing
    pub listed: usize,
    /// Activities not yet synced when the cycle started
    pub pending: usize,
    pub synced: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    /// Set when the cycle stopped (or never started) because of the rate limit
    pub deferred_until: Option<DateTime<Utc>>,
}

/// Orchestrates source, encoder, sink and state store.
pub struct SyncEngine<A, T, S> {
    source: ActivitySource<A, T>,
    sink: FileSink<S>,
    store: RemoteStateStore<S>,
    target_folder: String,
    interval: Duration,
    error_backoff: Duration,
    error_backoff_max: Duration,
    persist_mode: PersistMode,
    // Activities with malformed data, skipped until restart
    skipped: HashSet<String>,
    phase: CyclePhase,
}

impl<A, T, S> SyncEngine<A, T, S>
where
    A: ActivityApi,
    T: TokenRefresher,
    S: StorageApi,
{
    /// Create an engine writing route files and state into `target_folder`.
    pub fn new(source: ActivitySource<A, T>, storage: Arc<S>, target_folder: &str) -> Self {
        Self {
            source,
            sink: FileSink::new(Arc::clone(&storage)),
            store: RemoteStateStore::new(storage, target_folder),
            target_folder: target_folder.to_string(),
            interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            error_backoff: Duration::from_secs(DEFAULT_ERROR_BACKOFF_SECS),
            error_backoff_max: Duration::from_secs(DEFAULT_ERROR_BACKOFF_MAX_SECS),
            persist_mode: PersistMode::default(),
            skipped: HashSet::new(),
            phase: CyclePhase::Idle,
        }
    }

    pub fn with_persist_mode(mut self, persist_mode: PersistMode) -> Self {
        self.persist_mode = persist_mode;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Pause after an aborted cycle. It doubles with every further aborted
    /// cycle up to `max` and drops back to the interval after a cycle that
    /// completes.
    pub fn with_error_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.error_backoff = initial;
        self.error_backoff_max = max.max(initial);
        self
    }

    /// Retry policy for every storage request (state and uploads).
    pub fn with_storage_retry(mut self, retry: RetryPolicy) -> Self {
        self.sink = self.sink.with_retry_policy(retry);
        self.store = self.store.with_retry_policy(retry);
        self
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn source(&self) -> &ActivitySource<A, T> {
        &self.source
    }

    pub fn store(&self) -> &RemoteStateStore<S> {
        &self.store
    }

    pub fn target_folder(&self) -> &str {
        &self.target_folder
    }

    /// Ids skipped for malformed data since the engine was created.
    pub fn skipped_ids(&self) -> &HashSet<String> {
        &self.skipped
    }

    /// Run cycles until `shutdown` completes, sleeping the configured
    /// interval in between, or the error backoff after an aborted cycle.
    ///
    /// A shutdown during a cycle abandons it; everything persisted so far
    /// stays valid.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = pin!(shutdown);
        info!(
            "[SyncEngine] Syncing into {} every {}s",
            self.target_folder,
            self.interval.as_secs()
        );

        let mut backoff = self.error_backoff;
        loop {
            let result = tokio::select! {
                _ = &mut shutdown => None,
                result = self.run_cycle() => Some(result),
            };
            let Some(result) = result else {
                info!("[SyncEngine] Shutdown requested, abandoning cycle in progress");
                break;
            };
            log_cycle(&result);

            let pause = if result.is_ok() {
                backoff = self.error_backoff;
                self.interval
            } else {
                let pause = backoff;
                backoff = backoff.saturating_mul(2).min(self.error_backoff_max);
                pause
            };
            info!("[SyncEngine] Waiting {}s until next sync", pause.as_secs());
            tokio::select! {
                _ = &mut shutdown => {
                    info!("[SyncEngine] Shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Run one full cycle.
    ///
    /// Errors mean the cycle was aborted: authentication failed, or the
    /// record could not be loaded or saved. Per-activity failures are in the
    /// report instead.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let result = self.cycle().await;
        self.enter(CyclePhase::Idle);
        result
    }

    async fn cycle(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        if let Some(until) = self.store.load_backoff().await {
            if until > Utc::now() {
                warn!(
                    "[SyncEngine] Backoff in effect until {}, skipping cycle",
                    until.to_rfc3339()
                );
                report.deferred_until = Some(until);
                return Ok(report);
            }
        }

        // The record lives in the target folder, so it must exist before the
        // first save
        self.sink.ensure_folder(&self.target_folder).await?;
        let mut record = self.store.load().await?;

        self.enter(CyclePhase::Listing);
        let listed: Vec<ActivitySummary> =
            match self.source.list_activities(None).try_collect().await {
                Ok(listed) => listed,
                Err(SyncError::RateLimitExceeded { retry_after }) => {
                    report.deferred_until = Some(self.defer(retry_after).await);
                    return Ok(report);
                }
                Err(e) => return Err(e),
            };
        report.listed = listed.len();

        self.enter(CyclePhase::Diffing);
        let pending = self.diff(listed, &record);
        report.pending = pending.len();
        info!(
            "[SyncEngine] {} activities listed, {} already synced, {} to sync",
            report.listed,
            record.len(),
            report.pending
        );

        self.enter(CyclePhase::PerActivity);
        let halted = self.process(pending, &mut record, &mut report).await;

        self.enter(CyclePhase::Persisting);
        self.store.save(&record).await?;

        match halted {
            Some(SyncError::RateLimitExceeded { retry_after }) => {
                report.deferred_until = Some(self.defer(retry_after).await);
                Ok(report)
            }
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Listed activities not in the record and not skipped, in listing order.
    fn diff(&self, listed: Vec<ActivitySummary>, record: &SyncRecord) -> Vec<ActivitySummary> {
        // Pages can shift while listing, repeating an entry
        let mut seen = HashSet::new();
        listed
            .into_iter()
            .filter(|summary| seen.insert(summary.id.clone()))
            .filter(|summary| !record.contains(&summary.id) && !self.skipped.contains(&summary.id))
            .collect()
    }

    /// Sync pending activities one after another. Returns the error that
    /// halted the cycle, if any.
    async fn process(
        &mut self,
        pending: Vec<ActivitySummary>,
        record: &mut SyncRecord,
        report: &mut CycleReport,
    ) -> Option<SyncError> {
        let total = pending.len();
        let mut halted = None;
        let mut newly_skipped = Vec::new();

        {
            let this = &*self;
            let mut outcomes = pin!(stream::iter(pending)
                .enumerate()
                .then(|(i, summary)| this.sync_one(summary, i + 1, total)));

            while let Some(outcome) = outcomes.next().await {
                match outcome {
                    ActivityOutcome::Synced { id, path } => {
                        info!("[SyncEngine] Synced activity {} to {}", id, path);
                        record.mark_synced(id.clone());
                        report.synced.push(id);
                        if this.persist_mode == PersistMode::PerActivity {
                            if let Err(e) = this.store.save(record).await {
                                // The end-of-cycle save tries again
                                warn!("[SyncEngine] Could not persist progress: {}", e);
                            }
                        }
                    }
                    ActivityOutcome::Skipped { id, reason } => {
                        warn!("[SyncEngine] Skipping activity {}: {}", id, reason);
                        newly_skipped.push(id.clone());
                        report.skipped.push(id);
                    }
                    ActivityOutcome::Failed { id, reason } => {
                        warn!(
                            "[SyncEngine] Activity {} failed, will retry next cycle: {}",
                            id, reason
                        );
                        report.failed.push(id);
                    }
                    ActivityOutcome::Halted { id, error } => {
                        error!(
                            "[SyncEngine] Stopping cycle at activity {}: {}",
                            id, error
                        );
                        report.failed.push(id);
                        halted = Some(error);
                        break;
                    }
                }
            }
        }

        self.skipped.extend(newly_skipped);
        halted
    }

    async fn sync_one(
        &self,
        summary: ActivitySummary,
        position: usize,
        total: usize,
    ) -> ActivityOutcome {
        info!(
            "[SyncEngine] Syncing activity {} ({}) [{}/{}]",
            summary.id, summary.name, position, total
        );
        let id = summary.id;
        match self.transfer(&id).await {
            Ok(path) => ActivityOutcome::Synced { id, path },
            Err(e @ SyncError::Encoding { .. }) => ActivityOutcome::Skipped {
                id,
                reason: e.to_string(),
            },
            Err(e) if e.aborts_cycle() => ActivityOutcome::Halted { id, error: e },
            Err(e) => ActivityOutcome::Failed {
                id,
                reason: e.to_string(),
            },
        }
    }

    /// Fetch, encode and upload one activity.
    async fn transfer(&self, id: &str) -> Result<String> {
        let activity = self.source.fetch_activity_detail(id).await?;
        let file = gpx::encode(&activity)?;
        self.sink.upload(&self.target_folder, &file).await
    }

    /// Persist a backoff marker `retry_after` from now.
    async fn defer(&self, retry_after: Duration) -> DateTime<Utc> {
        let until = Utc::now()
            + ChronoDuration::from_std(retry_after).unwrap_or_else(|_| ChronoDuration::days(1));
        if let Err(e) = self.store.save_backoff(until).await {
            warn!("[SyncEngine] Could not persist backoff marker: {}", e);
        }
        until
    }

    fn enter(&mut self, phase: CyclePhase) {
        debug!("[SyncEngine] {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }
}

fn log_cycle(result: &Result<CycleReport>) {
    match result {
        Ok(report) if report.deferred_until.is_some() => {
            warn!(
                "[SyncEngine] Cycle deferred by rate limit until {} ({} synced before stopping)",
                report
                    .deferred_until
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                report.synced.len()
            );
        }
        Ok(report) => {
            info!(
                "[SyncEngine] Cycle complete: {} listed, {} pending, {} synced, {} skipped, {} failed",
                report.listed,
                report.pending,
                report.synced.len(),
                report.skipped.len(),
                report.failed.len()
            );
        }
        Err(e) => error!("[SyncEngine] Cycle aborted: {}", e),
    }
}
