//! Client-side rate limiting for the activity API.
//!
//! Strava enforces two limits on reads: a short-term limit per 15 minutes and
//! a daily limit. Each is tracked by a [`RateBudget`], a sliding window of
//! request times. [`RateLimiter::acquire`] is called before every request:
//! it waits for a free slot in every budget, or refuses with
//! `RateLimitExceeded` when that wait would exceed the configured maximum.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Result, SyncError};

// Strava read limits
pub const SHORT_WINDOW: Duration = Duration::from_secs(15 * 60);
pub const DAILY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SHORT_LIMIT: u32 = 100;
pub const DEFAULT_DAILY_LIMIT: u32 = 1000;

/// Request budget for one window.
#[derive(Debug, Clone)]
pub struct RateBudget {
    name: String,
    limit: u32,
    window: Duration,
    request_times: VecDeque<Instant>,
}

impl RateBudget {
    pub fn new(name: impl Into<String>, limit: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            limit: limit.max(1),
            window,
            request_times: VecDeque::with_capacity(limit.min(1024) as usize),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests counted against the window ending at `now`.
    pub fn used(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.request_times.len() as u32
    }

    /// Drop requests whose window has fully elapsed.
    fn prune(&mut self, now: Instant) {
        while self
            .request_times
            .front()
            .is_some_and(|&t| t + self.window <= now)
        {
            self.request_times.pop_front();
        }
    }

    /// How long until one more request fits, `None` if it fits now.
    fn wait_time(&mut self, now: Instant) -> Option<Duration> {
        self.prune(now);
        if self.request_times.len() < self.limit as usize {
            return None;
        }
        // The slot frees when the request `limit` places back ages out
        let idx = self.request_times.len() - self.limit as usize;
        self.request_times
            .get(idx)
            .map(|&t| (t + self.window).saturating_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    fn record(&mut self, now: Instant) {
        self.request_times.push_back(now);
    }

    /// Treat the budget as exhausted from `now` on, so the next slot frees
    /// one full window later.
    fn saturate(&mut self, now: Instant) {
        self.request_times.clear();
        self.request_times
            .extend(std::iter::repeat(now).take(self.limit as usize));
    }
}

struct LimiterState {
    budgets: Vec<RateBudget>,
    blocked_until: Option<Instant>,
}

/// Set of budgets consulted together before every request.
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    max_wait: Duration,
    consecutive_429s: AtomicU32,
}

impl RateLimiter {
    pub fn new(budgets: Vec<RateBudget>, max_wait: Duration) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                budgets,
                blocked_until: None,
            }),
            max_wait,
            consecutive_429s: AtomicU32::new(0),
        }
    }

    /// Strava's default read limits: 100 per 15 minutes, 1000 per day.
    pub fn strava(short_limit: u32, daily_limit: u32, max_wait: Duration) -> Self {
        Self::new(
            vec![
                RateBudget::new("15min", short_limit, SHORT_WINDOW),
                RateBudget::new("daily", daily_limit, DAILY_WINDOW),
            ],
            max_wait,
        )
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Wait for a request slot in every budget and claim it.
    ///
    /// Fails without claiming anything when the required wait is longer than
    /// `max_wait`.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            let wait_time = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let mut wait = state
                    .blocked_until
                    .map(|until| until.saturating_duration_since(now))
                    .filter(|d| !d.is_zero());
                for budget in state.budgets.iter_mut() {
                    if let Some(d) = budget.wait_time(now) {
                        debug!(
                            "[RateLimiter] {} budget full ({}/{}), frees in {:?}",
                            budget.name,
                            budget.request_times.len(),
                            budget.limit,
                            d
                        );
                        wait = Some(wait.map_or(d, |w| w.max(d)));
                    }
                }
                if wait.is_none() {
                    state.blocked_until = None;
                    for budget in state.budgets.iter_mut() {
                        budget.record(now);
                    }
                }
                wait
            };

            match wait_time {
                None => return Ok(()),
                Some(duration) if duration > self.max_wait => {
                    warn!(
                        "[RateLimiter] Next slot in {:?}, exceeds max wait {:?}",
                        duration, self.max_wait
                    );
                    return Err(SyncError::RateLimitExceeded {
                        retry_after: duration,
                    });
                }
                Some(duration) => {
                    debug!("[RateLimiter] Waiting {:?}", duration);
                    tokio::time::sleep(duration).await;
                }
            }
        }
    }

    /// React to a 429 from the server.
    ///
    /// With a `Retry-After` hint all requests are held until it passes.
    /// Without one a budget is marked exhausted, so the next request waits
    /// for its full window: the shortest budget on the first 429, the next
    /// longer one for every further 429 in a row.
    pub async fn record_429(&self, retry_after: Option<Duration>) {
        let count = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match retry_after {
            Some(delay) => {
                warn!(
                    "[RateLimiter] Got 429 (consecutive: {}), holding requests for {:?}",
                    count, delay
                );
                state.blocked_until = Some(now + delay);
            }
            None => {
                let mut by_window: Vec<&mut RateBudget> = state.budgets.iter_mut().collect();
                by_window.sort_by_key(|b| b.window);
                let level = (count as usize - 1).min(by_window.len().saturating_sub(1));
                for budget in by_window.into_iter().take(level + 1) {
                    warn!(
                        "[RateLimiter] Got 429 (consecutive: {}), marking {} budget exhausted",
                        count, budget.name
                    );
                    budget.saturate(now);
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_429s.store(0, Ordering::Relaxed);
    }

    /// Snapshot of `(name, used, limit)` for every budget.
    pub async fn usage(&self) -> Vec<(String, u32, u32)> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state
            .budgets
            .iter_mut()
            .map(|b| (b.name.clone(), b.used(now), b.limit))
            .collect()
    }
}
