//! # Activity Sync
//!
//! Incremental mirroring of a Strava activity history into GPX route files
//! on a Nextcloud (WebDAV) server.
//!
//! This library provides:
//! - A lazy, rate-limited activity source with token refresh on 401
//! - Deterministic GPX encoding of activity tracks
//! - A remote sync record kept next to the route files
//! - The sync engine that ties them together, one cycle at a time
//!
//! ## Features
//!
//! - **`http`** (default) - reqwest clients for Strava, its OAuth endpoint
//!   and WebDAV, and the `activity-syncd` daemon
//!
//! The three remote seams ([`ActivityApi`], [`TokenRefresher`],
//! [`StorageApi`]) are traits, so the engine runs unchanged against
//! in-memory implementations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{Result, SyncError};

// Failure classification and retry policy shared by remote clients
pub mod transport;
pub use transport::{ApiError, RetryPolicy};

// Environment configuration
pub mod config;
pub use config::{PersistMode, SyncConfig};

// Sliding-window request budgets
pub mod rate_limit;
pub use rate_limit::{RateBudget, RateLimiter};

// Bearer token refresh seam
pub mod auth;
pub use auth::{AccessToken, TokenRefresher};

// Activity listing and detail fetching
pub mod source;
pub use source::{ActivityApi, ActivitySource, PageQuery, StreamSet};

// GPX route encoding
pub mod gpx;
pub use gpx::{encode, EncodedFile};

// File-storage seam
pub mod storage;
pub use storage::{join_path, StorageApi};

// Remote sync record
pub mod state;
pub use state::{RemoteStateStore, SyncRecord};

// Route file upload
pub mod sink;
pub use sink::FileSink;

// Sync engine
pub mod engine;
pub use engine::{ActivityOutcome, CyclePhase, CycleReport, SyncEngine};

// HTTP clients for Strava and WebDAV
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{StravaApi, StravaTokenRefresher, WebDavClient};

// ============================================================================
// Core Types
// ============================================================================

/// One entry of the activity listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    /// Source-assigned identifier
    pub id: String,
    pub name: String,
    pub start: DateTime<Utc>,
    /// Legacy activity type (e.g., "Ride", "Run")
    pub activity_type: String,
    /// Detailed sport type (e.g., "MountainBikeRide", "TrailRun")
    pub sport_type: String,
}

/// A single sample of an activity track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation in meters
    pub elevation: Option<f64>,
    pub time: DateTime<Utc>,
    /// Beats per minute
    pub heart_rate: Option<u16>,
    /// Revolutions (or steps) per minute
    pub cadence: Option<u16>,
    /// Watts
    pub power: Option<u16>,
    /// Degrees Celsius
    pub temperature: Option<f64>,
}

impl TrackPoint {
    /// Create a track point with position and time only.
    pub fn new(latitude: f64, longitude: f64, elevation: Option<f64>, time: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            elevation,
            time,
            heart_rate: None,
            cadence: None,
            power: None,
            temperature: None,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && self.elevation.map_or(true, f64::is_finite)
    }
}

/// A fully fetched activity. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub name: String,
    pub start: DateTime<Utc>,
    pub activity_type: String,
    pub sport_type: String,
    pub track: Vec<TrackPoint>,
}

impl Activity {
    pub fn from_summary(summary: ActivitySummary, track: Vec<TrackPoint>) -> Self {
        Self {
            id: summary.id,
            name: summary.name,
            start: summary.start,
            activity_type: summary.activity_type,
            sport_type: summary.sport_type,
            track,
        }
    }
}
