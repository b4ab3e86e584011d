//! Daemon configuration from environment variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::rate_limit::{DEFAULT_DAILY_LIMIT, DEFAULT_SHORT_LIMIT, SHORT_WINDOW};

pub const DEFAULT_TARGET_FOLDER: &str = "/GPX/Strava";
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 600;
/// Pause after an aborted cycle, doubled for each further abort
pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 900;
pub const DEFAULT_ERROR_BACKOFF_MAX_SECS: u64 = 3600;

/// When the sync record is written back to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// After every uploaded activity and once more at the end of the cycle
    #[default]
    PerActivity,
    /// Once, at the end of the cycle
    PerCycle,
}

impl FromStr for PersistMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "activity" | "per-activity" => Ok(PersistMode::PerActivity),
            "cycle" | "per-cycle" => Ok(PersistMode::PerCycle),
            other => Err(SyncError::config(format!(
                "SYNC_PERSIST_MODE must be 'activity' or 'cycle', got '{}'",
                other
            ))),
        }
    }
}

/// Everything the daemon needs to run.
#[derive(Clone)]
pub struct SyncConfig {
    pub source_client_id: String,
    pub source_client_secret: String,
    pub source_refresh_token: String,
    /// Base URL of the Nextcloud server
    pub sink_url: String,
    pub sink_username: String,
    pub sink_password: String,
    /// Remote folder receiving route files and the sync record
    pub target_folder: String,
    pub sync_interval: Duration,
    /// First pause after an aborted cycle
    pub error_backoff: Duration,
    /// Upper bound for the doubling pause
    pub error_backoff_max: Duration,
    pub persist_mode: PersistMode,
    /// Requests allowed per 15 minutes
    pub rate_limit_short: u32,
    /// Requests allowed per day
    pub rate_limit_daily: u32,
    /// Longest a single request may wait for the rate limit
    pub rate_limit_max_wait: Duration,
}

impl SyncConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| SyncError::config(format!("{} is not set", key)))
        };
        let number = |key: &str, default: u64| -> Result<u64> {
            match get(key) {
                Some(raw) => raw.trim().parse().map_err(|_| {
                    SyncError::config(format!("{} must be a whole number, got '{}'", key, raw))
                }),
                None => Ok(default),
            }
        };

        let sync_interval = number("SYNC_INTERVAL_SECONDS", DEFAULT_SYNC_INTERVAL_SECS)?;
        if sync_interval == 0 {
            return Err(SyncError::config("SYNC_INTERVAL_SECONDS must be positive"));
        }
        let error_backoff = number("SYNC_ERROR_BACKOFF_SECONDS", DEFAULT_ERROR_BACKOFF_SECS)?;
        let error_backoff_max = number(
            "SYNC_ERROR_BACKOFF_MAX_SECONDS",
            DEFAULT_ERROR_BACKOFF_MAX_SECS.max(error_backoff),
        )?;
        if error_backoff == 0 {
            return Err(SyncError::config("SYNC_ERROR_BACKOFF_SECONDS must be positive"));
        }
        if error_backoff_max < error_backoff {
            return Err(SyncError::config(
                "SYNC_ERROR_BACKOFF_MAX_SECONDS must not be below SYNC_ERROR_BACKOFF_SECONDS",
            ));
        }
        let rate_limit_short = number("SOURCE_RATE_LIMIT_SHORT", DEFAULT_SHORT_LIMIT as u64)?;
        let rate_limit_daily = number("SOURCE_RATE_LIMIT_DAILY", DEFAULT_DAILY_LIMIT as u64)?;
        if rate_limit_short == 0 || rate_limit_daily == 0 {
            return Err(SyncError::config("rate limits must be positive"));
        }

        Ok(Self {
            source_client_id: required("SOURCE_CLIENT_ID")?,
            source_client_secret: required("SOURCE_CLIENT_SECRET")?,
            source_refresh_token: required("SOURCE_REFRESH_TOKEN")?,
            sink_url: required("SINK_URL")?.trim_end_matches('/').to_string(),
            sink_username: required("SINK_USERNAME")?,
            sink_password: required("SINK_PASSWORD")?,
            target_folder: normalize_folder(
                &get("SINK_TARGET_FOLDER").unwrap_or_else(|| DEFAULT_TARGET_FOLDER.to_string()),
            ),
            sync_interval: Duration::from_secs(sync_interval),
            error_backoff: Duration::from_secs(error_backoff),
            error_backoff_max: Duration::from_secs(error_backoff_max),
            persist_mode: get("SYNC_PERSIST_MODE")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or_default(),
            rate_limit_short: rate_limit_short.min(u32::MAX as u64) as u32,
            rate_limit_daily: rate_limit_daily.min(u32::MAX as u64) as u32,
            rate_limit_max_wait: Duration::from_secs(number(
                "SOURCE_RATE_LIMIT_MAX_WAIT_SECONDS",
                SHORT_WINDOW.as_secs(),
            )?),
        })
    }
}

// Secrets stay out of logs
impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("source_client_id", &self.source_client_id)
            .field("source_client_secret", &"<redacted>")
            .field("source_refresh_token", &"<redacted>")
            .field("sink_url", &self.sink_url)
            .field("sink_username", &self.sink_username)
            .field("sink_password", &"<redacted>")
            .field("target_folder", &self.target_folder)
            .field("sync_interval", &self.sync_interval)
            .field("error_backoff", &self.error_backoff)
            .field("error_backoff_max", &self.error_backoff_max)
            .field("persist_mode", &self.persist_mode)
            .field("rate_limit_short", &self.rate_limit_short)
            .field("rate_limit_daily", &self.rate_limit_daily)
            .field("rate_limit_max_wait", &self.rate_limit_max_wait)
            .finish()
    }
}

/// Absolute folder path without a trailing slash, `/` for the root.
pub fn normalize_folder(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}
