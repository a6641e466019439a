//! Remote storage adapters.
//!
//! One capability trait, one implementation per provider. The engine only
//! sees the conditional-write contract; If-Match headers and version tokens
//! are provider concerns that never leak past this module.

mod drive;
mod memory;
mod onedrive;

pub use drive::DriveAdapter;
pub use memory::MemoryAdapter;
pub use onedrive::OneDriveAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::manifest::SyncManifest;

/// Remote object key for the encrypted snapshot blob.
pub const SNAPSHOT_PATH: &str = "snapshot.bin";

/// Remote object key for the manifest document.
pub(crate) const MANIFEST_PATH: &str = "manifest.json";

/// Opaque version token for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Manifest together with its current version token.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub manifest: SyncManifest,
    pub etag: ETag,
}

/// Capability interface for a remote sync backend.
///
/// Conditional writes are the concurrency primitive: with `if_match` given,
/// a write succeeds only while the remote token still matches and fails
/// with [`SyncError::Conflict`] otherwise. `put_manifest` without
/// `if_match` is create-only: the manifest guards sequence slots, so two
/// racing creators cannot both win. `upload` without `if_match` overwrites;
/// an orphaned blob left by a crash must not wedge manifest creation.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Idempotent authorization refresh.
    async fn init(&self) -> Result<(), SyncError>;

    /// Fetches the manifest; `None` means the remote was never initialized.
    async fn get_manifest(&self) -> Result<Option<ManifestEntry>, SyncError>;

    /// Conditionally writes the manifest, returning its new token.
    async fn put_manifest(
        &self,
        manifest: &SyncManifest,
        if_match: Option<&ETag>,
    ) -> Result<ETag, SyncError>;

    /// Conditionally writes a blob, returning its new token.
    async fn upload(
        &self,
        path: &str,
        blob: &[u8],
        if_match: Option<&ETag>,
    ) -> Result<ETag, SyncError>;

    /// Downloads a blob with its current token.
    async fn download(&self, path: &str) -> Result<(Vec<u8>, ETag), SyncError>;

    /// Lists keys under a prefix, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError>;

    /// Existence probe without fetching content.
    async fn exists(&self, path: &str) -> Result<bool, SyncError>;

    /// Best-effort revoke and remote cleanup. Partial failure is swallowed.
    async fn unlink(&self);
}

/// Credential seam for a provider's native identity flow.
///
/// The engine treats authorization as an opaque side effect: `init`
/// refreshes, `unlink` revokes, and every request asks for the current
/// bearer token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a bearer token for the next request.
    async fn access_token(&self) -> Result<String, SyncError>;

    /// Refreshes credentials. Called from [`StorageAdapter::init`].
    async fn refresh(&self) -> Result<(), SyncError>;

    /// Best-effort revocation. Called from [`StorageAdapter::unlink`].
    async fn revoke(&self);
}

/// Fixed-token source for tests and local development.
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String, SyncError> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn revoke(&self) {}
}

/// Maps an HTTP response status to the engine error taxonomy.
pub(crate) fn status_error(status: reqwest::StatusCode, what: &str) -> SyncError {
    use reqwest::StatusCode;

    match status {
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            SyncError::Conflict(format!("{}: {}", what, status))
        }
        StatusCode::NOT_FOUND => SyncError::NotFound(what.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SyncError::Auth(format!("{}: {}", what, status))
        }
        _ => SyncError::Transient(format!("{}: {}", what, status)),
    }
}

/// Maps a transport-level failure to the engine error taxonomy.
pub(crate) fn transport_error(err: reqwest::Error, what: &str) -> SyncError {
    SyncError::Transient(format!("{}: {}", what, err))
}
