//! In-memory storage adapter.
//!
//! Implements the exact conditional-write contract of the cloud providers,
//! including create-only manifest writes. Used by the test suite and for
//! local development against a throwaway remote.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::manifest::SyncManifest;

use super::{ETag, ManifestEntry, StorageAdapter};

#[derive(Debug, Clone)]
struct Object {
    bytes: Vec<u8>,
    etag: ETag,
}

/// Adapter backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    objects: Mutex<BTreeMap<String, Object>>,
    manifest: Mutex<Option<(SyncManifest, ETag)>>,
    next_token: AtomicU64,
    writes: AtomicUsize,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accepted writes since construction. Lets tests assert
    /// that an idle tick performed none.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn mint_etag(&self) -> ETag {
        let n = self.next_token.fetch_add(1, Ordering::SeqCst);
        ETag::new(format!("mem-{}", n))
    }

    /// Flips bits in a stored object without touching its token,
    /// simulating remote corruption.
    pub(crate) fn tamper(&self, path: &str) {
        let mut objects = self.objects.lock().expect("objects lock poisoned");
        if let Some(object) = objects.get_mut(path) {
            if let Some(byte) = object.bytes.last_mut() {
                *byte ^= 0xFF;
            }
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn init(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn get_manifest(&self) -> Result<Option<ManifestEntry>, SyncError> {
        let manifest = self.manifest.lock().expect("manifest lock poisoned");
        Ok(manifest
            .as_ref()
            .map(|(manifest, etag)| ManifestEntry {
                manifest: manifest.clone(),
                etag: etag.clone(),
            }))
    }

    async fn put_manifest(
        &self,
        manifest: &SyncManifest,
        if_match: Option<&ETag>,
    ) -> Result<ETag, SyncError> {
        let mut slot = self.manifest.lock().expect("manifest lock poisoned");
        match (slot.as_ref(), if_match) {
            (Some((_, current)), Some(expected)) if current == expected => {}
            (Some((_, current)), Some(expected)) => {
                return Err(SyncError::Conflict(format!(
                    "manifest is {}, expected {}",
                    current, expected
                )))
            }
            (None, Some(expected)) => {
                return Err(SyncError::Conflict(format!(
                    "manifest absent, expected {}",
                    expected
                )))
            }
            // no if_match: create-only
            (Some(_), None) => {
                return Err(SyncError::Conflict("manifest already exists".to_string()))
            }
            (None, None) => {}
        }

        let etag = self.mint_etag();
        *slot = Some((manifest.clone(), etag.clone()));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(etag)
    }

    async fn upload(
        &self,
        path: &str,
        blob: &[u8],
        if_match: Option<&ETag>,
    ) -> Result<ETag, SyncError> {
        let mut objects = self.objects.lock().expect("objects lock poisoned");
        if let Some(expected) = if_match {
            match objects.get(path) {
                Some(object) if &object.etag == expected => {}
                Some(object) => {
                    return Err(SyncError::Conflict(format!(
                        "{} is {}, expected {}",
                        path, object.etag, expected
                    )))
                }
                None => {
                    return Err(SyncError::Conflict(format!(
                        "{} absent, expected {}",
                        path, expected
                    )))
                }
            }
        }

        let etag = self.mint_etag();
        objects.insert(
            path.to_string(),
            Object {
                bytes: blob.to_vec(),
                etag: etag.clone(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(etag)
    }

    async fn download(&self, path: &str) -> Result<(Vec<u8>, ETag), SyncError> {
        let objects = self.objects.lock().expect("objects lock poisoned");
        objects
            .get(path)
            .map(|object| (object.bytes.clone(), object.etag.clone()))
            .ok_or_else(|| SyncError::NotFound(path.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
        let objects = self.objects.lock().expect("objects lock poisoned");
        Ok(objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool, SyncError> {
        let objects = self.objects.lock().expect("objects lock poisoned");
        Ok(objects.contains_key(path))
    }

    async fn unlink(&self) {
        let keys = self.list("").await.unwrap_or_default();
        let mut objects = self.objects.lock().expect("objects lock poisoned");
        for key in keys {
            objects.remove(&key);
        }
        let mut manifest = self.manifest.lock().expect("manifest lock poisoned");
        *manifest = None;
    }
}
