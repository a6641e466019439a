//! Nuvem Sync Core
//!
//! Multi-device sync engine for Nuvem applications: policy management,
//! a versioned manifest, pluggable storage adapters, and the background
//! worker that reconciles local state with a remote store under
//! optimistic concurrency.
//!
//! ## Protocol
//!
//! Every tick the worker:
//! 1. Pulls the remote manifest (absent remote → create path)
//! 2. Downloads, decrypts, and merges when the remote is ahead
//! 3. Encrypts and pushes pending local changes with conditional writes
//! 4. On a lost write, re-pulls and retries, bounded per tick
//!
//! The manifest's `lastSeq`/ETag compare-and-swap is the only cross-device
//! ordering guarantee; exactly one writer wins a sequence slot.

pub mod crypto;
pub mod error;
pub mod local;
pub mod manifest;
pub mod policy;
pub mod settings;
pub mod storage;
pub mod worker;

pub use crypto::{CipherParams, EncryptedBlob, SnapshotCipher};
pub use error::SyncError;
pub use local::{LocalSnapshot, LocalStore, MemoryLocalStore, MergeOutcome};
pub use manifest::{SyncManifest, MANIFEST_CIPHER, MANIFEST_VERSION};
pub use policy::{ProviderRegistry, SyncPolicyManager};
pub use settings::{
    JsonSettingsStore, SettingsStore, SyncPolicy, SyncProvider, UserSyncSettings,
};
pub use storage::{
    DriveAdapter, ETag, ManifestEntry, MemoryAdapter, OneDriveAdapter, StaticTokenSource,
    StorageAdapter, TokenSource, SNAPSHOT_PATH,
};
pub use worker::{Clock, Scheduler, SyncWorker, TickOutcome, TokioClock};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
