//! Snapshot encryption.
//!
//! Snapshots are sealed with AES-256-GCM. The key is derived from the
//! account secret with PBKDF2-HMAC-SHA256, using the salt and iteration
//! count recorded in the manifest, so any device holding the secret can
//! open blobs written by any other device.

use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::Rng;
use sha2::Sha256;

use crate::error::SyncError;

/// PBKDF2 iteration count for newly created manifests.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Key-derivation parameters carried by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherParams {
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl CipherParams {
    /// Generates a fresh random salt with the default iteration count.
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill(&mut salt);
        Self {
            salt: salt.to_vec(),
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

/// Authenticated ciphertext of a serialized snapshot.
///
/// Wire framing is the 12-byte nonce followed by the GCM ciphertext with
/// its authentication tag appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// Serializes the blob for upload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parses a downloaded blob.
    ///
    /// A payload too short to carry a nonce and tag is reported as
    /// corruption, same as a failed authentication.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        if bytes.len() < NONCE_LEN + 16 {
            return Err(SyncError::Corruption(format!(
                "blob too short: {} bytes",
                bytes.len()
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[..NONCE_LEN]);
        Ok(Self {
            nonce,
            ciphertext: bytes[NONCE_LEN..].to_vec(),
        })
    }
}

/// Snapshot cipher bound to one account secret.
///
/// Key derivation is the expensive step and parameters only change when a
/// manifest is recreated, so the derived key is cached per parameter set.
pub struct SnapshotCipher {
    secret: Vec<u8>,
    cached: Mutex<Option<(CipherParams, [u8; 32])>>,
}

impl SnapshotCipher {
    /// Creates a cipher from account key material.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            cached: Mutex::new(None),
        }
    }

    /// Encrypts a serialized snapshot under the given parameters.
    pub fn encrypt(
        &self,
        params: &CipherParams,
        plaintext: &[u8],
    ) -> Result<EncryptedBlob, SyncError> {
        let key = self.key_for(params);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SyncError::Corruption("encryption failed".to_string()))?;

        Ok(EncryptedBlob {
            nonce: nonce_bytes,
            ciphertext,
        })
    }

    /// Decrypts a downloaded blob.
    ///
    /// Fails closed: a bad tag, a truncated payload, or a wrong secret all
    /// surface as [`SyncError::Corruption`].
    pub fn decrypt(&self, params: &CipherParams, blob: &EncryptedBlob) -> Result<Vec<u8>, SyncError> {
        let key = self.key_for(params);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = Nonce::from(blob.nonce);

        cipher
            .decrypt(&nonce, blob.ciphertext.as_slice())
            .map_err(|_| SyncError::Corruption("authentication failed".to_string()))
    }

    fn key_for(&self, params: &CipherParams) -> [u8; 32] {
        let mut cached = self.cached.lock().expect("cipher cache poisoned");
        if let Some((cached_params, key)) = cached.as_ref() {
            if cached_params == params {
                return *key;
            }
        }

        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(&self.secret, &params.salt, params.iterations, &mut key);
        *cached = Some((params.clone(), key));
        key
    }
}
