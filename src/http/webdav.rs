//! Nextcloud WebDAV file storage.

use async_trait::async_trait;
use base64::Engine;
use log::debug;
use reqwest::{Client, Method, StatusCode, Url};

use super::{build_client, check_status, read_body, transport_error};
use crate::storage::StorageApi;
use crate::transport::ApiError;

/// Basic-auth WebDAV client rooted at one user's files.
pub struct WebDavClient {
    client: Client,
    root: Url,
    auth_header: String,
}

impl WebDavClient {
    /// Client for `username`'s files on the Nextcloud server at `base_url`.
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<Self, ApiError> {
        let mut root = Url::parse(base_url)
            .map_err(|e| ApiError::Transport(format!("invalid server URL '{}': {}", base_url, e)))?;
        root.path_segments_mut()
            .map_err(|_| ApiError::Transport(format!("'{}' cannot be a base URL", base_url)))?
            .pop_if_empty()
            .extend(["remote.php", "dav", "files", username]);

        let credentials =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
        Ok(Self {
            client: build_client()?,
            root,
            auth_header: format!("Basic {}", credentials),
        })
    }

    /// Full URL of a storage path, each segment percent-encoded.
    fn url(&self, path: &str) -> Url {
        let mut url = self.root.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, ApiError> {
        debug!("[WebDav] {} {}", method, path);
        let mut request = self
            .client
            .request(method, self.url(path))
            .header(reqwest::header::AUTHORIZATION, &self.auth_header);
        if let Some(body) = body {
            request = request.body(body);
        }
        request.send().await.map_err(transport_error)
    }
}

#[async_trait]
impl StorageApi for WebDavClient {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ApiError> {
        let response = self.send(Method::GET, path, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = read_body(check_status(response).await?).await?;
        Ok(Some(bytes))
    }

    async fn put(&self, path: &str, content: Vec<u8>) -> Result<(), ApiError> {
        let response = self.send(Method::PUT, path, Some(content)).await?;
        check_status(response).await?;
        Ok(())
    }

    async fn make_folder(&self, path: &str) -> Result<bool, ApiError> {
        let mkcol = Method::from_bytes(b"MKCOL").map_err(|e| ApiError::Transport(e.to_string()))?;
        let response = self.send(mkcol, path, None).await?;
        // MKCOL on an existing collection is refused with 405
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(false);
        }
        check_status(response).await?;
        Ok(true)
    }
}
