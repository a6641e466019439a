//! Sync policy manager.
//!
//! Owns the persisted policy and mediates enable/disable transitions.
//! Policy intent is a local concern: adapter failures defer sync, they
//! never block or revert a transition, so local-only operation always
//! stays fully functional.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::SyncError;
use crate::settings::{SettingsStore, SyncPolicy, SyncProvider, UserSyncSettings};
use crate::storage::StorageAdapter;

/// Maps a provider selection to its storage adapter.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: HashMap<SyncProvider, Arc<dyn StorageAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter for a provider, replacing any previous one.
    pub fn register(mut self, provider: SyncProvider, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.adapters.insert(provider, adapter);
        self
    }

    pub fn get(&self, provider: SyncProvider) -> Option<Arc<dyn StorageAdapter>> {
        self.adapters.get(&provider).cloned()
    }
}

/// Single owner of the session's sync policy.
///
/// The worker and any UI observe state through [`subscribe`]; only this
/// manager ever writes the settings store.
///
/// [`subscribe`]: SyncPolicyManager::subscribe
pub struct SyncPolicyManager {
    store: Arc<dyn SettingsStore>,
    adapters: ProviderRegistry,
    tx: watch::Sender<UserSyncSettings>,
}

impl SyncPolicyManager {
    /// Loads persisted settings and starts the session.
    ///
    /// A failed or empty load falls back to local-only; startup never
    /// fails on a broken settings file.
    pub fn init(store: Arc<dyn SettingsStore>, adapters: ProviderRegistry) -> Self {
        let settings = match store.load() {
            Ok(Some(settings)) => settings,
            Ok(None) => UserSyncSettings::default(),
            Err(e) => {
                tracing::warn!("failed to load sync settings, falling back to local-only: {}", e);
                UserSyncSettings::default()
            }
        };
        let (tx, _) = watch::channel(settings);
        Self {
            store,
            adapters,
            tx,
        }
    }

    /// Immutable snapshot of current settings.
    pub fn get(&self) -> UserSyncSettings {
        self.tx.borrow().clone()
    }

    /// Observes every settings change.
    ///
    /// The receiver's initial value is the current state; dropping the
    /// receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<UserSyncSettings> {
        self.tx.subscribe()
    }

    /// Enables multi-device sync.
    ///
    /// The `cloud_primary` transition is persisted and announced before
    /// provider initialization; a failed adapter init only defers the
    /// first push to the next worker tick.
    pub async fn enable_multi_device(
        &self,
        provider: SyncProvider,
        device_id: Option<Uuid>,
    ) -> Result<UserSyncSettings, SyncError> {
        let device_id = device_id
            .or(self.get().device_id)
            .unwrap_or_else(Uuid::new_v4);
        let settings = UserSyncSettings {
            policy: SyncPolicy::CloudPrimary,
            provider: Some(provider),
            device_id: Some(device_id),
        };

        self.store.save(&settings)?;
        self.tx.send_replace(settings.clone());

        match self.adapters.get(provider) {
            Some(adapter) => {
                if let Err(e) = adapter.init().await {
                    tracing::warn!("{} init failed, first push deferred: {}", provider, e);
                }
            }
            None => tracing::warn!("no adapter registered for {}", provider),
        }

        Ok(settings)
    }

    /// Disables multi-device sync.
    ///
    /// The `local_only` policy is persisted and announced first; remote
    /// removal is best-effort cleanup that cannot revert it.
    pub async fn disable_multi_device(
        &self,
        remove_remote: bool,
    ) -> Result<UserSyncSettings, SyncError> {
        let previous = self.get();
        let settings = UserSyncSettings {
            policy: SyncPolicy::LocalOnly,
            provider: previous.provider,
            device_id: previous.device_id,
        };

        self.store.save(&settings)?;
        self.tx.send_replace(settings.clone());

        if remove_remote {
            if let Some(adapter) = previous.provider.and_then(|p| self.adapters.get(p)) {
                adapter.unlink().await;
            }
        }

        Ok(settings)
    }
}
