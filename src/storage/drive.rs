//! Drive-style storage adapter.
//!
//! Talks to a Drive-like object API where every object carries a
//! generation token. Conditional writes are expressed as an
//! `ifGenerationMatch` query parameter; generation `0` means "the object
//! must not exist yet", which is how create-only manifest writes map onto
//! this provider.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::SyncError;
use crate::manifest::SyncManifest;

use super::{
    status_error, transport_error, ETag, ManifestEntry, StorageAdapter, TokenSource, MANIFEST_PATH,
};

/// Response header carrying an object's generation token on reads.
const GENERATION_HEADER: &str = "x-generation";

#[derive(Debug, Deserialize)]
struct PutResponse {
    generation: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
}

/// Adapter for a Drive-like backend.
pub struct DriveAdapter {
    base_url: String,
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

impl DriveAdapter {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            tokens,
        }
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}/o/{}", self.base_url, urlencoding::encode(name))
    }

    fn list_url(&self, prefix: &str) -> String {
        format!("{}/o?prefix={}", self.base_url, urlencoding::encode(prefix))
    }

    /// Query value for the `ifGenerationMatch` precondition, if any.
    fn generation_param(if_match: Option<&ETag>, create_only: bool) -> Option<String> {
        match if_match {
            Some(token) => Some(token.as_str().to_string()),
            None if create_only => Some("0".to_string()),
            None => None,
        }
    }

    async fn put_object(
        &self,
        name: &str,
        bytes: Vec<u8>,
        if_match: Option<&ETag>,
        create_only: bool,
    ) -> Result<ETag, SyncError> {
        let token = self.tokens.access_token().await?;
        let mut request = self
            .http
            .put(self.object_url(name))
            .bearer_auth(token)
            .body(bytes);
        if let Some(generation) = Self::generation_param(if_match, create_only) {
            request = request.query(&[("ifGenerationMatch", generation)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, name))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), name));
        }

        let put: PutResponse = response
            .json()
            .await
            .map_err(|e| transport_error(e, name))?;
        Ok(ETag::new(put.generation))
    }

    async fn get_object(&self, name: &str) -> Result<(Vec<u8>, ETag), SyncError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(self.object_url(name))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(e, name))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), name));
        }

        let generation = response
            .headers()
            .get(GENERATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(ETag::new)
            .ok_or_else(|| {
                SyncError::Transient(format!("{}: response missing generation token", name))
            })?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, name))?;
        Ok((bytes.to_vec(), generation))
    }

    async fn delete_object(&self, name: &str) -> Result<(), SyncError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .delete(self.object_url(name))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(e, name))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(status_error(response.status(), name));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for DriveAdapter {
    async fn init(&self) -> Result<(), SyncError> {
        self.tokens.refresh().await
    }

    async fn get_manifest(&self) -> Result<Option<ManifestEntry>, SyncError> {
        match self.get_object(MANIFEST_PATH).await {
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
        self.put_object(MANIFEST_PATH, bytes, if_match, true).await
    }

    async fn upload(
        &self,
        path: &str,
        blob: &[u8],
        if_match: Option<&ETag>,
    ) -> Result<ETag, SyncError> {
        self.put_object(path, blob.to_vec(), if_match, false).await
    }

    async fn download(&self, path: &str) -> Result<(Vec<u8>, ETag), SyncError> {
        self.get_object(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(self.list_url(prefix))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(e, "list"))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "list"));
        }

        let listing: ListResponse = response
            .json()
            .await
            .map_err(|e| transport_error(e, "list"))?;
        let mut names: Vec<String> = listing.items.into_iter().map(|item| item.name).collect();
        names.sort();
        Ok(names)
    }

    async fn exists(&self, path: &str) -> Result<bool, SyncError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .head(self.object_url(path))
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
                    if let Err(e) = self.delete_object(&name).await {
                        tracing::warn!("unlink: failed to remove {}: {}", name, e);
                    }
                }
            }
            Err(e) => tracing::warn!("unlink: listing remote objects failed: {}", e),
        }
        self.tokens.revoke().await;
    }
}
