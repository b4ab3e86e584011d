//! File-storage seam shared by the state store and the file sink.

use async_trait::async_trait;

use crate::transport::ApiError;

/// Minimal file-storage API.
///
/// Paths are absolute, `/`-separated and relative to the user's storage root.
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// File contents, `None` if the file does not exist.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ApiError>;

    /// Create or overwrite a file in a single request.
    async fn put(&self, path: &str, content: Vec<u8>) -> Result<(), ApiError>;

    /// Create one folder whose parent exists. Returns `false` if it already
    /// existed.
    async fn make_folder(&self, path: &str) -> Result<bool, ApiError>;
}

/// Join a folder and a file name into a storage path.
pub fn join_path(folder: &str, name: &str) -> String {
    let folder = folder.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    format!("{}/{}", folder, name)
}

/// Every ancestor of `path`, outermost first, including `path` itself.
pub(crate) fn ancestors(path: &str) -> Vec<String> {
    let mut current = String::new();
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            current.push('/');
            current.push_str(segment);
            current.clone()
        })
        .collect()
}
