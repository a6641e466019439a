//! Local data collaborator seam.
//!
//! The engine never inspects payload contents. It sees serialized
//! snapshots, a revision counter that strictly increases with every local
//! write, and an apply call for pulled state. Merge policy belongs to the
//! implementation behind this trait.

use std::sync::Mutex;

use crate::error::SyncError;

/// Serialized local state with its revision counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSnapshot {
    pub bytes: Vec<u8>,
    pub revision: u64,
}

/// Result of applying a pulled remote snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Local revision after the merge.
    pub revision: u64,
    /// True when pending local changes survived the merge and still need
    /// a push.
    pub dirty: bool,
}

/// Local application data as seen by the sync worker.
pub trait LocalStore: Send + Sync {
    /// Current serialized state and revision.
    fn snapshot(&self) -> Result<LocalSnapshot, SyncError>;

    /// Current revision counter.
    fn revision(&self) -> u64;

    /// Applies a pulled remote snapshot.
    ///
    /// `synced_rev` is the last revision the worker pushed or adopted;
    /// anything newer is pending local work the implementation must rebase
    /// onto the new baseline.
    fn apply_merged(&self, remote: &[u8], synced_rev: u64) -> Result<MergeOutcome, SyncError>;
}

/// In-memory local store.
///
/// Merge policy: pending local edits win over the pulled snapshot
/// (local-wins rebase); a clean store adopts the remote snapshot
/// wholesale.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    bytes: Vec<u8>,
    revision: u64,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a local edit, bumping the revision counter.
    pub fn write(&self, bytes: impl Into<Vec<u8>>) {
        let mut inner = self.inner.lock().expect("local store lock poisoned");
        inner.bytes = bytes.into();
        inner.revision += 1;
    }

    /// Current state bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.inner
            .lock()
            .expect("local store lock poisoned")
            .bytes
            .clone()
    }
}

impl LocalStore for MemoryLocalStore {
    fn snapshot(&self) -> Result<LocalSnapshot, SyncError> {
        let inner = self.inner.lock().expect("local store lock poisoned");
        Ok(LocalSnapshot {
            bytes: inner.bytes.clone(),
            revision: inner.revision,
        })
    }

    fn revision(&self) -> u64 {
        self.inner
            .lock()
            .expect("local store lock poisoned")
            .revision
    }

    fn apply_merged(&self, remote: &[u8], synced_rev: u64) -> Result<MergeOutcome, SyncError> {
        let mut inner = self.inner.lock().expect("local store lock poisoned");
        if inner.revision > synced_rev {
            // pending edits win; the caller keeps them marked for push
            return Ok(MergeOutcome {
                revision: inner.revision,
                dirty: true,
            });
        }

        inner.bytes = remote.to_vec();
        inner.revision += 1;
        Ok(MergeOutcome {
            revision: inner.revision,
            dirty: false,
        })
    }
}
