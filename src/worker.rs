//! Background sync worker.
//!
//! One cooperative loop per session. Each tick pulls the remote manifest,
//! merges when the local view is stale, and pushes pending local changes
//! under the manifest's compare-and-swap. Losing a conditional write
//! re-pulls and retries within the tick, bounded; transient failures back
//! off exponentially between ticks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::crypto::{CipherParams, EncryptedBlob, SnapshotCipher};
use crate::error::SyncError;
use crate::local::{LocalSnapshot, LocalStore};
use crate::manifest::SyncManifest;
use crate::settings::{SyncPolicy, UserSyncSettings};
use crate::storage::{ETag, ManifestEntry, StorageAdapter, SNAPSHOT_PATH};

/// Interval between ticks when error-free.
pub const BASELINE_INTERVAL: Duration = Duration::from_secs(15);

/// Backoff ceiling for repeated transient failures.
pub const BACKOFF_CEILING: Duration = Duration::from_secs(300);

/// Conditional-write losses tolerated within one tick before deferring.
const CONFLICT_RETRIES_PER_TICK: usize = 3;

/// Default timeout applied to every adapter call.
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Sleep seam so tests can drive the loop without real time.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Tokio-backed clock.
#[derive(Debug, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do; no writes were performed.
    Clean,
    /// A push was accepted and `lastSeq` advanced.
    Pushed,
    /// Conflict budget exhausted; the push retries next tick.
    Deferred,
}

/// Tick pacing: baseline when healthy, doubling backoff after transient
/// failures, reset on the next success.
#[derive(Debug, Clone)]
pub struct Scheduler {
    baseline: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Scheduler {
    pub fn new(baseline: Duration, ceiling: Duration) -> Self {
        Self {
            baseline,
            ceiling,
            current: baseline,
        }
    }

    /// Delay before the next tick. `backoff` marks a failed tick.
    pub fn next_delay(&mut self, backoff: bool) -> Duration {
        self.current = if backoff {
            (self.current * 2).min(self.ceiling)
        } else {
            self.baseline
        };
        self.current
    }
}

/// Background worker reconciling a local store with a remote adapter.
///
/// The worker mirrors the last accepted remote state (`lastSeq` and the
/// manifest/blob tokens) and never persists anything itself; a restarted
/// worker simply re-pulls and converges.
pub struct SyncWorker {
    adapter: Arc<dyn StorageAdapter>,
    local: Arc<dyn LocalStore>,
    cipher: SnapshotCipher,
    device_id: Uuid,
    policy: watch::Receiver<UserSyncSettings>,
    clock: Arc<dyn Clock>,
    op_timeout: Duration,
    scheduler: Scheduler,
    last_seq: u64,
    synced_rev: u64,
    snapshot_etag: Option<ETag>,
    manifest_etag: Option<ETag>,
}

impl SyncWorker {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        local: Arc<dyn LocalStore>,
        cipher: SnapshotCipher,
        device_id: Uuid,
        policy: watch::Receiver<UserSyncSettings>,
    ) -> Self {
        Self {
            adapter,
            local,
            cipher,
            device_id,
            policy,
            clock: Arc::new(TokioClock),
            op_timeout: DEFAULT_OP_TIMEOUT,
            scheduler: Scheduler::new(BASELINE_INTERVAL, BACKOFF_CEILING),
            last_seq: 0,
            synced_rev: 0,
            snapshot_etag: None,
            manifest_etag: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn with_intervals(mut self, baseline: Duration, ceiling: Duration) -> Self {
        self.scheduler = Scheduler::new(baseline, ceiling);
        self
    }

    /// Last sequence number accepted locally.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Token of the snapshot blob this worker last wrote or adopted.
    pub fn snapshot_etag(&self) -> Option<&ETag> {
        self.snapshot_etag.as_ref()
    }

    /// Runs ticks until the policy leaves `cloud_primary`.
    ///
    /// Conflict and transient failures are absorbed; a corrupted snapshot
    /// is the one hard failure surfaced to the caller.
    pub async fn run(mut self) -> Result<(), SyncError> {
        loop {
            if self.policy.borrow().policy != SyncPolicy::CloudPrimary {
                tracing::debug!("policy left cloud_primary, sync worker stopping");
                return Ok(());
            }

            let backoff = match self.tick().await {
                Ok(outcome) => {
                    tracing::debug!(?outcome, "sync tick complete");
                    false
                }
                Err(SyncError::Corruption(reason)) => {
                    tracing::warn!("sync halted on corrupted snapshot: {}", reason);
                    return Err(SyncError::Corruption(reason));
                }
                Err(e) => {
                    tracing::warn!("sync tick failed: {}", e);
                    true
                }
            };

            let delay = self.scheduler.next_delay(backoff);
            let clock = self.clock.clone();
            tokio::select! {
                _ = clock.sleep(delay) => {}
                _ = self.policy.changed() => {}
            }
        }
    }

    /// One pull → merge → push cycle.
    ///
    /// A lost conditional write abandons the push, re-pulls, and retries,
    /// bounded per tick; exhausting the budget defers to the next tick.
    pub async fn tick(&mut self) -> Result<TickOutcome, SyncError> {
        for _ in 0..CONFLICT_RETRIES_PER_TICK {
            match self.sync_once().await {
                Err(SyncError::Conflict(reason)) => {
                    tracing::debug!("conditional write lost ({}), re-pulling", reason);
                    continue;
                }
                other => return other,
            }
        }
        tracing::warn!("conflict budget exhausted, deferring push to next tick");
        Ok(TickOutcome::Deferred)
    }

    async fn sync_once(&mut self) -> Result<TickOutcome, SyncError> {
        let remote = self
            .with_timeout("get_manifest", self.adapter.get_manifest())
            .await?;

        let entry = match remote {
            None => return self.create_remote().await,
            Some(entry) => entry,
        };

        if entry.manifest.last_seq > self.last_seq {
            self.adopt_remote(&entry).await?;
        } else {
            self.manifest_etag = Some(entry.etag.clone());
        }

        // cheap probe before serializing a full snapshot
        if self.local.revision() <= self.synced_rev {
            return Ok(TickOutcome::Clean);
        }
        let snapshot = self.local.snapshot()?;
        self.push(snapshot, &entry.manifest).await
    }

    /// First sync: no remote manifest exists yet.
    async fn create_remote(&mut self) -> Result<TickOutcome, SyncError> {
        let snapshot = self.local.snapshot()?;
        let params = CipherParams::generate();
        let blob = self.cipher.encrypt(&params, &snapshot.bytes)?;

        if self
            .with_timeout("exists", self.adapter.exists(SNAPSHOT_PATH))
            .await?
        {
            tracing::warn!("snapshot blob present without a manifest, overwriting");
        }

        let payload = blob.to_bytes();
        let blob_etag = self
            .with_timeout("upload", self.adapter.upload(SNAPSHOT_PATH, &payload, None))
            .await?;
        self.snapshot_etag = Some(blob_etag.clone());

        // create-only: a racing initializer loses here, re-pulls, and
        // adopts whatever won
        let manifest = SyncManifest::new(self.device_id, &params).next_push(blob_etag);
        let manifest_etag = self
            .with_timeout("put_manifest", self.adapter.put_manifest(&manifest, None))
            .await?;

        self.last_seq = manifest.last_seq;
        self.synced_rev = snapshot.revision;
        self.manifest_etag = Some(manifest_etag);
        tracing::info!(last_seq = self.last_seq, "remote initialized");
        Ok(TickOutcome::Pushed)
    }

    /// The remote is ahead: download, decrypt, merge, adopt.
    async fn adopt_remote(&mut self, entry: &ManifestEntry) -> Result<(), SyncError> {
        let params = entry.manifest.cipher_params()?;
        let (bytes, blob_etag) = self
            .with_timeout("download", self.adapter.download(SNAPSHOT_PATH))
            .await?;
        let blob = EncryptedBlob::from_bytes(&bytes)?;
        let plaintext = self.cipher.decrypt(&params, &blob)?;

        let outcome = self.local.apply_merged(&plaintext, self.synced_rev)?;

        // adopt only after the blob proved authentic; the blob token comes
        // from the download, which is authoritative over the manifest copy
        self.last_seq = entry.manifest.last_seq;
        self.snapshot_etag = Some(blob_etag);
        self.manifest_etag = Some(entry.etag.clone());
        if !outcome.dirty {
            self.synced_rev = outcome.revision;
        }
        tracing::debug!(
            last_seq = self.last_seq,
            dirty = outcome.dirty,
            "adopted remote state"
        );
        Ok(())
    }

    /// Pushes pending local changes under the manifest compare-and-swap.
    async fn push(
        &mut self,
        snapshot: LocalSnapshot,
        base: &SyncManifest,
    ) -> Result<TickOutcome, SyncError> {
        let params = base.cipher_params()?;
        let blob = self.cipher.encrypt(&params, &snapshot.bytes)?;
        let payload = blob.to_bytes();

        let blob_etag = self
            .with_timeout(
                "upload",
                self.adapter
                    .upload(SNAPSHOT_PATH, &payload, self.snapshot_etag.as_ref()),
            )
            .await?;
        // the blob is ours even if the manifest swap below loses
        self.snapshot_etag = Some(blob_etag.clone());

        let next = base.next_push(blob_etag);
        let manifest_etag = self
            .with_timeout(
                "put_manifest",
                self.adapter
                    .put_manifest(&next, self.manifest_etag.as_ref()),
            )
            .await?;

        self.last_seq = next.last_seq;
        self.synced_rev = snapshot.revision;
        self.manifest_etag = Some(manifest_etag);
        tracing::debug!(last_seq = self.last_seq, "push accepted");
        Ok(TickOutcome::Pushed)
    }

    async fn with_timeout<T>(
        &self,
        what: &str,
        fut: impl Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Transient(format!("{} timed out", what))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MemoryLocalStore;
    use crate::settings::SyncProvider;
    use crate::storage::MemoryAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SECRET: &[u8] = b"shared account secret";

    fn cloud_settings() -> UserSyncSettings {
        UserSyncSettings {
            policy: SyncPolicy::CloudPrimary,
            provider: Some(SyncProvider::Drive),
            device_id: Some(Uuid::new_v4()),
        }
    }

    fn policy_channel() -> (
        watch::Sender<UserSyncSettings>,
        watch::Receiver<UserSyncSettings>,
    ) {
        watch::channel(cloud_settings())
    }

    fn test_worker(
        adapter: Arc<dyn StorageAdapter>,
        local: Arc<MemoryLocalStore>,
    ) -> (SyncWorker, watch::Sender<UserSyncSettings>) {
        let (tx, rx) = policy_channel();
        let worker = SyncWorker::new(
            adapter,
            local,
            SnapshotCipher::new(SECRET.to_vec()),
            Uuid::new_v4(),
            rx,
        );
        (worker, tx)
    }

    async fn decrypt_remote(adapter: &MemoryAdapter) -> Vec<u8> {
        let entry = adapter.get_manifest().await.unwrap().unwrap();
        let (bytes, _) = adapter.download(SNAPSHOT_PATH).await.unwrap();
        let blob = EncryptedBlob::from_bytes(&bytes).unwrap();
        SnapshotCipher::new(SECRET.to_vec())
            .decrypt(&entry.manifest.cipher_params().unwrap(), &blob)
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_tick_creates_remote() {
        let adapter = Arc::new(MemoryAdapter::new());
        let local = Arc::new(MemoryLocalStore::new());
        local.write(b"device a state".to_vec());
        let (mut worker, _tx) = test_worker(adapter.clone(), local);

        let outcome = worker.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Pushed);

        let entry = adapter.get_manifest().await.unwrap().unwrap();
        assert_eq!(entry.manifest.last_seq, 1);
        assert_eq!(worker.last_seq(), 1);

        // the manifest records the blob token the adapter returned
        let (_, blob_etag) = adapter.download(SNAPSHOT_PATH).await.unwrap();
        assert_eq!(entry.manifest.snapshot_etag, Some(blob_etag.clone()));
        assert_eq!(worker.snapshot_etag(), Some(&blob_etag));
    }

    #[tokio::test]
    async fn test_first_tick_encrypts_local_state() {
        let adapter = Arc::new(MemoryAdapter::new());
        let local = Arc::new(MemoryLocalStore::new());
        local.write(b"plaintext state".to_vec());
        let (mut worker, _tx) = test_worker(adapter.clone(), local);
        worker.tick().await.unwrap();

        // stored blob is ciphertext, but decrypts back to the snapshot
        let (stored, _) = adapter.download(SNAPSHOT_PATH).await.unwrap();
        assert_ne!(stored, b"plaintext state");

        let entry = adapter.get_manifest().await.unwrap().unwrap();
        let blob = EncryptedBlob::from_bytes(&stored).unwrap();
        let plaintext = SnapshotCipher::new(SECRET.to_vec())
            .decrypt(&entry.manifest.cipher_params().unwrap(), &blob)
            .unwrap();
        assert_eq!(plaintext, b"plaintext state");
    }

    #[tokio::test]
    async fn test_idle_tick_performs_no_writes() {
        let adapter = Arc::new(MemoryAdapter::new());
        let local = Arc::new(MemoryLocalStore::new());
        local.write(b"state".to_vec());
        let (mut worker, _tx) = test_worker(adapter.clone(), local);

        worker.tick().await.unwrap();
        let writes_after_first = adapter.writes();

        let outcome = worker.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Clean);
        assert_eq!(adapter.writes(), writes_after_first);
        assert_eq!(worker.last_seq(), 1);
    }

    #[tokio::test]
    async fn test_create_path_overwrites_orphaned_blob() {
        let adapter = Arc::new(MemoryAdapter::new());
        // a crashed device left a blob but no manifest
        adapter.upload(SNAPSHOT_PATH, b"orphan", None).await.unwrap();

        let local = Arc::new(MemoryLocalStore::new());
        local.write(b"fresh state".to_vec());
        let (mut worker, _tx) = test_worker(adapter.clone(), local);

        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Pushed);
        assert_eq!(
            adapter.get_manifest().await.unwrap().unwrap().manifest.last_seq,
            1
        );
    }

    #[tokio::test]
    async fn test_second_device_adopts_remote_state() {
        let adapter = Arc::new(MemoryAdapter::new());
        let local_a = Arc::new(MemoryLocalStore::new());
        local_a.write(b"from device a".to_vec());
        let (mut worker_a, _tx_a) = test_worker(adapter.clone(), local_a);
        worker_a.tick().await.unwrap();

        let local_b = Arc::new(MemoryLocalStore::new());
        let (mut worker_b, _tx_b) = test_worker(adapter.clone(), local_b.clone());

        let outcome = worker_b.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Clean);
        assert_eq!(worker_b.last_seq(), 1);
        assert_eq!(local_b.bytes(), b"from device a");
    }

    #[tokio::test]
    async fn test_pending_changes_push_after_adoption() {
        let adapter = Arc::new(MemoryAdapter::new());
        let local_a = Arc::new(MemoryLocalStore::new());
        local_a.write(b"v1".to_vec());
        let (mut worker_a, _tx_a) = test_worker(adapter.clone(), local_a.clone());
        worker_a.tick().await.unwrap();

        let local_b = Arc::new(MemoryLocalStore::new());
        let (mut worker_b, _tx_b) = test_worker(adapter.clone(), local_b.clone());
        worker_b.tick().await.unwrap();

        local_b.write(b"v2 from b".to_vec());
        assert_eq!(worker_b.tick().await.unwrap(), TickOutcome::Pushed);
        assert_eq!(worker_b.last_seq(), 2);

        // device A picks it up on its next tick
        assert_eq!(worker_a.tick().await.unwrap(), TickOutcome::Clean);
        assert_eq!(worker_a.last_seq(), 2);
        assert_eq!(local_a.bytes(), b"v2 from b");
    }

    #[tokio::test]
    async fn test_loser_rebases_on_next_tick() {
        let adapter = Arc::new(MemoryAdapter::new());
        let local_a = Arc::new(MemoryLocalStore::new());
        local_a.write(b"base".to_vec());
        let (mut worker_a, _tx_a) = test_worker(adapter.clone(), local_a.clone());
        worker_a.tick().await.unwrap();

        let local_b = Arc::new(MemoryLocalStore::new());
        let (mut worker_b, _tx_b) = test_worker(adapter.clone(), local_b.clone());
        worker_b.tick().await.unwrap();

        // both devices edit; A's push wins sequence slot 2
        local_a.write(b"a wins slot 2".to_vec());
        local_b.write(b"b pending".to_vec());
        worker_a.tick().await.unwrap();
        assert_eq!(worker_a.last_seq(), 2);

        // B's next tick observes lastSeq 2, rebases its pending edit on
        // the new baseline, and pushes slot 3
        assert_eq!(worker_b.tick().await.unwrap(), TickOutcome::Pushed);
        assert_eq!(worker_b.last_seq(), 3);
        assert_eq!(local_b.bytes(), b"b pending");
        assert_eq!(decrypt_remote(&adapter).await, b"b pending");
    }

    /// Delegating adapter that injects a winning push from another device
    /// right before the victim's first manifest swap.
    struct RaceOnce {
        inner: Arc<MemoryAdapter>,
        winner: Mutex<Option<Vec<u8>>>,
    }

    #[async_trait]
    impl StorageAdapter for RaceOnce {
        async fn init(&self) -> Result<(), SyncError> {
            self.inner.init().await
        }

        async fn get_manifest(&self) -> Result<Option<ManifestEntry>, SyncError> {
            self.inner.get_manifest().await
        }

        async fn put_manifest(
            &self,
            manifest: &SyncManifest,
            if_match: Option<&ETag>,
        ) -> Result<ETag, SyncError> {
            let winner = self.winner.lock().unwrap().take();
            if let Some(blob) = winner {
                let base = self.inner.get_manifest().await?.unwrap();
                let blob_etag = self.inner.upload(SNAPSHOT_PATH, &blob, None).await?;
                let next = base.manifest.next_push(blob_etag);
                self.inner.put_manifest(&next, Some(&base.etag)).await?;
            }
            self.inner.put_manifest(manifest, if_match).await
        }

        async fn upload(
            &self,
            path: &str,
            blob: &[u8],
            if_match: Option<&ETag>,
        ) -> Result<ETag, SyncError> {
            self.inner.upload(path, blob, if_match).await
        }

        async fn download(&self, path: &str) -> Result<(Vec<u8>, ETag), SyncError> {
            self.inner.download(path).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
            self.inner.list(prefix).await
        }

        async fn exists(&self, path: &str) -> Result<bool, SyncError> {
            self.inner.exists(path).await
        }

        async fn unlink(&self) {
            self.inner.unlink().await
        }
    }

    #[tokio::test]
    async fn test_conflict_repulls_and_retries_within_tick() {
        let inner = Arc::new(MemoryAdapter::new());
        let local_a = Arc::new(MemoryLocalStore::new());
        local_a.write(b"base".to_vec());
        let (mut worker_a, _tx_a) = test_worker(inner.clone(), local_a);
        worker_a.tick().await.unwrap();

        // prepare the interfering winner's encrypted blob
        let entry = inner.get_manifest().await.unwrap().unwrap();
        let params = entry.manifest.cipher_params().unwrap();
        let winner_blob = SnapshotCipher::new(SECRET.to_vec())
            .encrypt(&params, b"winner state")
            .unwrap()
            .to_bytes();

        let racing = Arc::new(RaceOnce {
            inner: inner.clone(),
            winner: Mutex::new(Some(winner_blob)),
        });

        let local_b = Arc::new(MemoryLocalStore::new());
        let (mut worker_b, _tx_b) = test_worker(racing, local_b.clone());
        worker_b.tick().await.unwrap();
        local_b.write(b"victim edit".to_vec());

        // the victim loses slot 2 mid-tick, re-pulls, rebases, wins slot 3
        assert_eq!(worker_b.tick().await.unwrap(), TickOutcome::Pushed);
        assert_eq!(worker_b.last_seq(), 3);
        assert_eq!(decrypt_remote(&inner).await, b"victim edit");
    }

    /// Delegating adapter whose manifest swaps always lose.
    struct AlwaysConflict {
        inner: Arc<MemoryAdapter>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl StorageAdapter for AlwaysConflict {
        async fn init(&self) -> Result<(), SyncError> {
            self.inner.init().await
        }

        async fn get_manifest(&self) -> Result<Option<ManifestEntry>, SyncError> {
            self.inner.get_manifest().await
        }

        async fn put_manifest(
            &self,
            _manifest: &SyncManifest,
            _if_match: Option<&ETag>,
        ) -> Result<ETag, SyncError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Conflict("always".into()))
        }

        async fn upload(
            &self,
            path: &str,
            blob: &[u8],
            if_match: Option<&ETag>,
        ) -> Result<ETag, SyncError> {
            self.inner.upload(path, blob, if_match).await
        }

        async fn download(&self, path: &str) -> Result<(Vec<u8>, ETag), SyncError> {
            self.inner.download(path).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
            self.inner.list(prefix).await
        }

        async fn exists(&self, path: &str) -> Result<bool, SyncError> {
            self.inner.exists(path).await
        }

        async fn unlink(&self) {
            self.inner.unlink().await
        }
    }

    #[tokio::test]
    async fn test_conflict_budget_defers_to_next_tick() {
        let inner = Arc::new(MemoryAdapter::new());
        let local_a = Arc::new(MemoryLocalStore::new());
        local_a.write(b"base".to_vec());
        let (mut worker_a, _tx_a) = test_worker(inner.clone(), local_a);
        worker_a.tick().await.unwrap();

        let conflicting = Arc::new(AlwaysConflict {
            inner: inner.clone(),
            attempts: AtomicUsize::new(0),
        });
        let local_b = Arc::new(MemoryLocalStore::new());
        local_b.write(b"never lands".to_vec());
        let (mut worker_b, _tx_b) = test_worker(conflicting.clone(), local_b);

        let outcome = worker_b.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Deferred);
        assert_eq!(conflicting.attempts.load(Ordering::SeqCst), 3);
        // the victim never adopted a sequence it did not win
        assert_eq!(worker_b.last_seq(), 1);
    }

    #[tokio::test]
    async fn test_tampered_blob_is_corruption_and_adopts_nothing() {
        let adapter = Arc::new(MemoryAdapter::new());
        let local_a = Arc::new(MemoryLocalStore::new());
        local_a.write(b"good state".to_vec());
        let (mut worker_a, _tx_a) = test_worker(adapter.clone(), local_a);
        worker_a.tick().await.unwrap();

        adapter.tamper(SNAPSHOT_PATH);

        let local_b = Arc::new(MemoryLocalStore::new());
        let (mut worker_b, _tx_b) = test_worker(adapter.clone(), local_b.clone());

        let result = worker_b.tick().await;
        assert!(matches!(result, Err(SyncError::Corruption(_))));
        // the tick advanced nothing
        assert_eq!(worker_b.last_seq(), 0);
        assert!(worker_b.snapshot_etag().is_none());
        assert!(local_b.bytes().is_empty());
    }

    /// Adapter that never answers, for timeout mapping.
    struct Hanging;

    #[async_trait]
    impl StorageAdapter for Hanging {
        async fn init(&self) -> Result<(), SyncError> {
            Ok(())
        }

        async fn get_manifest(&self) -> Result<Option<ManifestEntry>, SyncError> {
            std::future::pending().await
        }

        async fn put_manifest(
            &self,
            _manifest: &SyncManifest,
            _if_match: Option<&ETag>,
        ) -> Result<ETag, SyncError> {
            std::future::pending().await
        }

        async fn upload(
            &self,
            _path: &str,
            _blob: &[u8],
            _if_match: Option<&ETag>,
        ) -> Result<ETag, SyncError> {
            std::future::pending().await
        }

        async fn download(&self, _path: &str) -> Result<(Vec<u8>, ETag), SyncError> {
            std::future::pending().await
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<String>, SyncError> {
            std::future::pending().await
        }

        async fn exists(&self, _path: &str) -> Result<bool, SyncError> {
            std::future::pending().await
        }

        async fn unlink(&self) {}
    }

    #[tokio::test]
    async fn test_adapter_timeout_is_transient() {
        let local = Arc::new(MemoryLocalStore::new());
        let (worker, _tx) = test_worker(Arc::new(Hanging), local);
        let mut worker = worker.with_op_timeout(Duration::from_millis(10));

        let result = worker.tick().await;
        assert!(matches!(result, Err(SyncError::Transient(_))));
    }

    #[test]
    fn test_scheduler_backoff_and_reset() {
        let mut scheduler = Scheduler::new(Duration::from_secs(15), Duration::from_secs(300));

        assert_eq!(scheduler.next_delay(false), Duration::from_secs(15));
        assert_eq!(scheduler.next_delay(true), Duration::from_secs(30));
        assert_eq!(scheduler.next_delay(true), Duration::from_secs(60));
        assert_eq!(scheduler.next_delay(true), Duration::from_secs(120));
        assert_eq!(scheduler.next_delay(true), Duration::from_secs(240));
        // capped at the ceiling
        assert_eq!(scheduler.next_delay(true), Duration::from_secs(300));
        assert_eq!(scheduler.next_delay(true), Duration::from_secs(300));
        // reset on the next success
        assert_eq!(scheduler.next_delay(false), Duration::from_secs(15));
    }

    /// Clock that flips the policy to local-only after a few sleeps.
    struct FlippingClock {
        sleeps: AtomicUsize,
        tx: watch::Sender<UserSyncSettings>,
    }

    #[async_trait]
    impl Clock for FlippingClock {
        async fn sleep(&self, _duration: Duration) {
            if self.sleeps.fetch_add(1, Ordering::SeqCst) >= 2 {
                let mut settings = self.tx.borrow().clone();
                settings.policy = SyncPolicy::LocalOnly;
                let _ = self.tx.send(settings);
            }
        }
    }

    #[tokio::test]
    async fn test_run_stops_when_policy_flips() {
        let adapter = Arc::new(MemoryAdapter::new());
        let local = Arc::new(MemoryLocalStore::new());
        local.write(b"state".to_vec());

        let (tx, rx) = policy_channel();
        let clock = Arc::new(FlippingClock {
            sleeps: AtomicUsize::new(0),
            tx: tx.clone(),
        });
        let worker = SyncWorker::new(
            adapter.clone(),
            local,
            SnapshotCipher::new(SECRET.to_vec()),
            Uuid::new_v4(),
            rx,
        )
        .with_clock(clock.clone());

        let result = tokio::time::timeout(Duration::from_secs(5), worker.run()).await;
        assert!(matches!(result, Ok(Ok(()))));

        // the loop ticked while it was allowed to
        assert!(clock.sleeps.load(Ordering::SeqCst) >= 3);
        assert_eq!(
            adapter.get_manifest().await.unwrap().unwrap().manifest.last_seq,
            1
        );
    }

    #[tokio::test]
    async fn test_run_surfaces_corruption() {
        let adapter = Arc::new(MemoryAdapter::new());
        let local_a = Arc::new(MemoryLocalStore::new());
        local_a.write(b"state".to_vec());
        let (mut worker_a, _tx_a) = test_worker(adapter.clone(), local_a);
        worker_a.tick().await.unwrap();
        adapter.tamper(SNAPSHOT_PATH);

        let local_b = Arc::new(MemoryLocalStore::new());
        let (worker_b, _tx_b) = test_worker(adapter, local_b);

        let result = tokio::time::timeout(Duration::from_secs(5), worker_b.run()).await;
        assert!(matches!(result, Ok(Err(SyncError::Corruption(_)))));
    }

    #[tokio::test]
    async fn test_tokio_clock_sleeps() {
        TokioClock.sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn test_worker_follows_policy_manager() {
        use crate::policy::{ProviderRegistry, SyncPolicyManager};
        use crate::settings::JsonSettingsStore;
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(JsonSettingsStore::new(
            temp_dir.path().join("sync-settings.json"),
        ));
        let adapter = Arc::new(MemoryAdapter::new());
        let registry = ProviderRegistry::new().register(SyncProvider::Drive, adapter.clone());
        let manager = SyncPolicyManager::init(store, registry);

        manager
            .enable_multi_device(SyncProvider::Drive, None)
            .await
            .unwrap();

        let local = Arc::new(MemoryLocalStore::new());
        local.write(b"managed state".to_vec());
        let worker = SyncWorker::new(
            adapter.clone(),
            local,
            SnapshotCipher::new(SECRET.to_vec()),
            manager.get().device_id.unwrap(),
            manager.subscribe(),
        )
        .with_intervals(Duration::from_millis(1), Duration::from_millis(10));

        let handle = tokio::spawn(worker.run());
        // give the loop a tick, then flip the policy off
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.disable_multi_device(false).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
        assert_eq!(
            adapter.get_manifest().await.unwrap().unwrap().manifest.last_seq,
            1
        );
    }
}
