//! Route file upload.

use std::sync::Arc;

use log::{debug, info};

use crate::error::{Result, SyncError};
use crate::gpx::EncodedFile;
use crate::storage::{ancestors, join_path, StorageApi};
use crate::transport::RetryPolicy;

/// Writes encoded route files into storage folders.
pub struct FileSink<S> {
    storage: Arc<S>,
    retry: RetryPolicy,
}

impl<S: StorageApi> FileSink<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create `path` and any missing parents. Existing folders are fine.
    ///
    /// Every ancestor is checked on each call, so a folder deleted on the
    /// server since the last call is created again.
    pub async fn ensure_folder(&self, path: &str) -> Result<()> {
        for folder in ancestors(path) {
            let created = self
                .retry
                .run("create folder", || self.storage.make_folder(&folder))
                .await
                .map_err(|e| SyncError::Upload {
                    path: folder.clone(),
                    message: format!("creating folder: {}", e),
                })?;
            if created {
                info!("[FileSink] Created folder {}", folder);
            }
        }
        Ok(())
    }

    /// Upload `file` into `folder`, overwriting any file of the same name.
    /// Returns the remote path.
    pub async fn upload(&self, folder: &str, file: &EncodedFile) -> Result<String> {
        let path = join_path(folder, &file.file_name);
        self.retry
            .run("upload", || self.storage.put(&path, file.content.clone()))
            .await
            .map_err(|e| SyncError::Upload {
                path: path.clone(),
                message: e.to_string(),
            })?;
        debug!("[FileSink] Uploaded {} ({} bytes)", path, file.len());
        Ok(path)
    }
}
