//! # Remote State Store
//!
//! Keeps the [`SyncRecord`] as a JSON file next to the route files, so a
//! fresh container resumes where the previous one stopped without any local
//! disk.
//!
//! Also keeps the backoff marker: the time before which the activity API
//! should not be contacted again after its daily budget ran out.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::storage::{join_path, StorageApi};
use crate::transport::RetryPolicy;

pub const STATE_FILE_NAME: &str = "synced_activities.json";
pub const BACKOFF_FILE_NAME: &str = "activity_sync_backoff.json";

/// Current on-storage schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Ids of activities whose route file has been uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Sorted, so equal sets serialize to equal bytes
    pub synced_ids: BTreeSet<String>,
    pub version: u32,
}

impl Default for SyncRecord {
    fn default() -> Self {
        Self {
            synced_ids: BTreeSet::new(),
            version: SCHEMA_VERSION,
        }
    }
}

impl SyncRecord {
    pub fn contains(&self, id: &str) -> bool {
        self.synced_ids.contains(id)
    }

    /// Record a successful upload. Returns `false` if already recorded.
    pub fn mark_synced(&mut self, id: impl Into<String>) -> bool {
        self.synced_ids.insert(id.into())
    }

    pub fn len(&self) -> usize {
        self.synced_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.synced_ids.is_empty()
    }

    /// Parse a stored record, upgrading the legacy bare-array format.
    pub fn from_json(bytes: &[u8]) -> std::result::Result<Self, String> {
        match serde_json::from_slice::<StoredRecord>(bytes) {
            Ok(StoredRecord::Current(record)) if record.version > SCHEMA_VERSION => Err(format!(
                "record version {} is newer than supported version {}",
                record.version, SCHEMA_VERSION
            )),
            Ok(StoredRecord::Current(record)) => Ok(Self {
                version: SCHEMA_VERSION,
                ..record
            }),
            Ok(StoredRecord::Legacy(ids)) => Ok(Self {
                synced_ids: ids.into_iter().map(LegacyId::into_string).collect(),
                version: SCHEMA_VERSION,
            }),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Current(SyncRecord),
    Legacy(Vec<LegacyId>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyId {
    Text(String),
    Number(u64),
}

impl LegacyId {
    fn into_string(self) -> String {
        match self {
            LegacyId::Text(s) => s,
            LegacyId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BackoffMarker {
    backoff_until_utc: DateTime<Utc>,
}

/// Reads and writes the sync record and backoff marker in storage.
pub struct RemoteStateStore<S> {
    storage: Arc<S>,
    state_path: String,
    backoff_path: String,
    retry: RetryPolicy,
}

impl<S: StorageApi> RemoteStateStore<S> {
    /// Store both files inside `folder`.
    pub fn new(storage: Arc<S>, folder: &str) -> Self {
        Self {
            storage,
            state_path: join_path(folder, STATE_FILE_NAME),
            backoff_path: join_path(folder, BACKOFF_FILE_NAME),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state_path(&self) -> &str {
        &self.state_path
    }

    pub fn backoff_path(&self) -> &str {
        &self.backoff_path
    }

    /// Load the sync record. A missing file is an empty record (first run).
    ///
    /// An unreadable or unparseable record is an error rather than an empty
    /// record: starting over would re-upload the whole history.
    pub async fn load(&self) -> Result<SyncRecord> {
        let bytes = self
            .retry
            .run("load sync record", || self.storage.get(&self.state_path))
            .await
            .map_err(|e| SyncError::StorageUnavailable {
                message: format!("reading {}: {}", self.state_path, e),
            })?;

        let Some(bytes) = bytes else {
            info!(
                "[StateStore] No sync record at {}, starting fresh",
                self.state_path
            );
            return Ok(SyncRecord::default());
        };

        let record = SyncRecord::from_json(&bytes).map_err(|e| SyncError::StorageUnavailable {
            message: format!("{} is not a valid sync record: {}", self.state_path, e),
        })?;
        debug!(
            "[StateStore] Loaded {} synced ids from {}",
            record.len(),
            self.state_path
        );
        Ok(record)
    }

    /// Overwrite the stored record with `record` in a single PUT.
    pub async fn save(&self, record: &SyncRecord) -> Result<()> {
        let body = record.to_json().map_err(|e| SyncError::StorageUnavailable {
            message: format!("serializing {}: {}", self.state_path, e),
        })?;
        self.retry
            .run("save sync record", || {
                self.storage.put(&self.state_path, body.clone())
            })
            .await
            .map_err(|e| SyncError::StorageUnavailable {
                message: format!("writing {}: {}", self.state_path, e),
            })?;
        debug!(
            "[StateStore] Saved {} synced ids to {}",
            record.len(),
            self.state_path
        );
        Ok(())
    }

    /// The stored backoff time, if any. Read failures count as no backoff.
    pub async fn load_backoff(&self) -> Option<DateTime<Utc>> {
        let bytes = match self.storage.get(&self.backoff_path).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(
                    "[StateStore] Could not read backoff marker {}: {}",
                    self.backoff_path, e
                );
                return None;
            }
        };
        match serde_json::from_slice::<BackoffMarker>(&bytes) {
            Ok(marker) => Some(marker.backoff_until_utc),
            Err(e) => {
                warn!(
                    "[StateStore] Ignoring malformed backoff marker {}: {}",
                    self.backoff_path, e
                );
                None
            }
        }
    }

    pub async fn save_backoff(&self, until: DateTime<Utc>) -> Result<()> {
        let marker = BackoffMarker {
            backoff_until_utc: until,
        };
        let body = serde_json::to_vec(&marker).map_err(|e| SyncError::StorageUnavailable {
            message: e.to_string(),
        })?;
        self.retry
            .run("save backoff marker", || {
                self.storage.put(&self.backoff_path, body.clone())
            })
            .await
            .map_err(|e| SyncError::StorageUnavailable {
                message: format!("writing {}: {}", self.backoff_path, e),
            })?;
        info!("[StateStore] Backing off until {}", until.to_rfc3339());
        Ok(())
    }
}
