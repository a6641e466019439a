//! Versioned manifest describing remote sync state.
//!
//! The manifest is the concurrency anchor for the whole engine: its
//! sequence counter and ETag are what conditional writes race on. It also
//! carries the key-derivation parameters every device needs to open the
//! snapshot blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::CipherParams;
use crate::error::SyncError;
use crate::storage::ETag;

/// Current manifest schema version. Never decreases.
pub const MANIFEST_VERSION: u32 = 1;

/// Cipher identifier recorded in every manifest.
pub const MANIFEST_CIPHER: &str = "AES-GCM";

/// Versioned record describing the remote snapshot.
///
/// Field names are camelCase on the wire; the manifest document is shared
/// with non-Rust clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncManifest {
    pub version: u32,
    pub last_seq: u64,
    #[serde(rename = "snapshotETag", skip_serializing_if = "Option::is_none", default)]
    pub snapshot_etag: Option<ETag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub device_id_primary: Uuid,
    pub cipher: String,
    /// Base64-encoded PBKDF2 salt.
    pub salt: String,
    pub iterations: u32,
}

impl SyncManifest {
    /// Creates the initial manifest for a remote that was never synced.
    ///
    /// Starts at `lastSeq = 0`; the creating push advances it to 1 like any
    /// other push.
    pub fn new(device_id_primary: Uuid, params: &CipherParams) -> Self {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let now = Utc::now();
        Self {
            version: MANIFEST_VERSION,
            last_seq: 0,
            snapshot_etag: None,
            created_at: now,
            updated_at: now,
            device_id_primary,
            cipher: MANIFEST_CIPHER.to_string(),
            salt: STANDARD.encode(&params.salt),
            iterations: params.iterations,
        }
    }

    /// Returns the manifest an accepted push would publish: sequence
    /// advanced by one, snapshot token replaced, `updatedAt` refreshed.
    pub fn next_push(&self, snapshot_etag: ETag) -> Self {
        Self {
            last_seq: self.last_seq + 1,
            snapshot_etag: Some(snapshot_etag),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Extracts the key-derivation parameters for the snapshot cipher.
    ///
    /// An unknown cipher id or an undecodable salt means the blob cannot be
    /// opened, which the engine treats the same as a failed authentication.
    pub fn cipher_params(&self) -> Result<CipherParams, SyncError> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        if self.cipher != MANIFEST_CIPHER {
            return Err(SyncError::Corruption(format!(
                "unsupported cipher '{}'",
                self.cipher
            )));
        }
        let salt = STANDARD
            .decode(&self.salt)
            .map_err(|e| SyncError::Corruption(format!("undecodable salt: {}", e)))?;

        Ok(CipherParams {
            salt,
            iterations: self.iterations,
        })
    }
}
