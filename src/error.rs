//! Sync error taxonomy.

use thiserror::Error;

/// Errors produced by the sync engine and its storage adapters.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A conditional write lost the optimistic-concurrency race. Retryable.
    #[error("conditional write conflict: {0}")]
    Conflict(String),

    /// Remote object absent. Signals "first sync" when it is the manifest.
    #[error("remote object not found: {0}")]
    NotFound(String),

    /// Adapter init or token failure. Sync is deferred, never reverted.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Timeout or connection failure. Triggers backoff.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// Decryption or authentication failure for a blob.
    ///
    /// The only error the worker surfaces as a hard failure; everything
    /// else is retried or deferred.
    #[error("snapshot corrupted: {0}")]
    Corruption(String),

    /// Settings store failure.
    #[error("settings store: {0}")]
    Settings(String),

    /// Local data collaborator failure.
    #[error("local store: {0}")]
    Local(String),
}

impl SyncError {
    /// True for failures the worker absorbs via retry or backoff.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SyncError::Corruption(_))
    }
}
