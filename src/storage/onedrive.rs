//! OneDrive-style storage adapter.
//!
//! Talks to a Graph-like drive API where items live under an app folder
//! and carry an `eTag`. Conditional writes are expressed with `If-Match`;
//! create-only writes with `If-None-Match: *`. Same engine contract as the
//! Drive adapter, different wire spelling.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::SyncError;
use crate::manifest::SyncManifest;

use super::{
    status_error, transport_error, ETag, ManifestEntry, StorageAdapter, TokenSource, MANIFEST_PATH,
};

#[derive(Debug, Deserialize)]
struct DriveItem {
    #[serde(rename = "eTag")]
    etag: String,
}

#[derive(Debug, Deserialize)]
struct ChildrenResponse {
    #[serde(default)]
    value: Vec<ChildItem>,
}

#[derive(Debug, Deserialize)]
struct ChildItem {
    name: String,
}

/// Adapter for a OneDrive-like backend.
pub struct OneDriveAdapter {
    base_url: String,
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

impl OneDriveAdapter {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            tokens,
        }
    }

    /// Percent-encodes each path segment, keeping the separators.
    fn encode_path(path: &str) -> String {
        path.split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn item_url(&self, path: &str) -> String {
        format!("{}/root:/{}", self.base_url, Self::encode_path(path))
    }

    fn content_url(&self, path: &str) -> String {
        format!("{}/root:/{}:/content", self.base_url, Self::encode_path(path))
    }

    fn children_url(&self) -> String {
        format!("{}/root/children", self.base_url)
    }

    async fn put_content(
        &self,
        path: &str,
        bytes: Vec<u8>,
        if_match: Option<&ETag>,
        create_only: bool,
    ) -> Result<ETag, SyncError> {
        let token = self.tokens.access_token().await?;
        let mut request = self
            .http
            .put(self.content_url(path))
            .bearer_auth(token)
            .body(bytes);
        request = match if_match {
            Some(etag) => request.header(reqwest::header::IF_MATCH, etag.as_str()),
            None if create_only => request.header(reqwest::header::IF_NONE_MATCH, "*"),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, path))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), path));
        }

        let item: DriveItem = response
            .json()
            .await
            .map_err(|e| transport_error(e, path))?;
        Ok(ETag::new(item.etag))
    }

    async fn get_content(&self, path: &str) -> Result<(Vec<u8>, ETag), SyncError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(self.content_url(path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(e, path))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), path));
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(ETag::new)
            .ok_or_else(|| SyncError::Transient(format!("{}: response missing eTag", path)))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, path))?;
        Ok((bytes.to_vec(), etag))
    }

    async fn delete_item(&self, path: &str) -> Result<(), SyncError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .delete(self.item_url(path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(e, path))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(status_error(response.status(), path));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for OneDriveAdapter {
    async fn init(&self) -> Result<(), SyncError> {
        self.tokens.refresh().await
    }

    async fn get_manifest(&self) -> Result<Option<ManifestEntry>, SyncError> {
        match self.get_content(MANIFEST_PATH).await {
            Ok((bytes, etag)) => {
                let manifest: SyncManifest = serde_json::from_slice(&bytes).map_err(|e| {
                    SyncError::Corruption(format!("manifest parse: {}", e))
                })?;
                Ok(Some(ManifestEntry { manifest, etag }))
            }
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put_manifest(
        &self,
        manifest: &SyncManifest,
        if_match: Option<&ETag>,
    ) -> Result<ETag, SyncError> {
        let bytes = serde_json::to_vec(manifest)
            .map_err(|e| SyncError::Corruption(format!("manifest encode: {}", e)))?;
        self.put_content(MANIFEST_PATH, bytes, if_match, true).await
    }

    async fn upload(
        &self,
        path: &str,
        blob: &[u8],
        if_match: Option<&ETag>,
    ) -> Result<ETag, SyncError> {
        self.put_content(path, blob.to_vec(), if_match, false).await
    }

    async fn download(&self, path: &str) -> Result<(Vec<u8>, ETag), SyncError> {
        self.get_content(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(self.children_url())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(e, "list"))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "list"));
        }

        // the children endpoint has no server-side prefix filter
        let children: ChildrenResponse = response
            .json()
            .await
            .map_err(|e| transport_error(e, "list"))?;
        let mut names: Vec<String> = children
            .value
            .into_iter()
            .map(|item| item.name)
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn exists(&self, path: &str) -> Result<bool, SyncError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(self.item_url(path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(e, path))?;
        match response.status() {
            status if status.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_error(status, path)),
        }
    }

    async fn unlink(&self) {
        match self.list("").await {
            Ok(names) => {
                for name in names {
                    if let Err(e) = self.delete_item(&name).await {
                        tracing::warn!("unlink: failed to remove {}: {}", name, e);
                    }
                }
            }
            Err(e) => tracing::warn!("unlink: listing remote items failed: {}", e),
        }
        self.tokens.revoke().await;
    }
}
