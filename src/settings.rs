//! Persisted sync settings.
//!
//! The settings document is tiny on purpose: the resolved policy, the
//! selected provider, and this device's id. It is loaded once at startup
//! and only the policy manager ever writes it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// Resolved sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// No remote; all data stays on this device.
    LocalOnly,
    /// The remote manifest is authoritative.
    CloudPrimary,
}

/// Remote storage provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncProvider {
    Drive,
    OneDrive,
}

impl std::fmt::Display for SyncProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncProvider::Drive => write!(f, "drive"),
            SyncProvider::OneDrive => write!(f, "one_drive"),
        }
    }
}

/// Persisted user sync settings (JSON wire format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSyncSettings {
    pub policy: SyncPolicy,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub provider: Option<SyncProvider>,
    #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none", default)]
    pub device_id: Option<Uuid>,
}

impl Default for UserSyncSettings {
    fn default() -> Self {
        Self {
            policy: SyncPolicy::LocalOnly,
            provider: None,
            device_id: None,
        }
    }
}

/// Persistence seam for user sync settings.
///
/// The engine ships a JSON file store; host applications that keep settings
/// elsewhere implement this themselves.
pub trait SettingsStore: Send + Sync {
    /// Loads persisted settings. `None` means nothing was ever saved.
    fn load(&self) -> Result<Option<UserSyncSettings>, SyncError>;

    /// Persists settings, replacing any previous document.
    fn save(&self, settings: &UserSyncSettings) -> Result<(), SyncError>;
}

/// File-backed settings store.
///
/// Writes a single JSON document, creating parent directories on demand.
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    /// Creates a store at an explicit path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default settings path under the platform data directory:
    /// - Linux: `~/.local/share/nuvem/sync-settings.json`
    /// - macOS: `~/Library/Application Support/nuvem/sync-settings.json`
    /// - Windows: `%APPDATA%/nuvem/sync-settings.json`
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nuvem")
            .join("sync-settings.json")
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<Option<UserSyncSettings>, SyncError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let settings = serde_json::from_str(&contents).map_err(|e| {
                    SyncError::Settings(format!("{}: {}", self.path.display(), e))
                })?;
                Ok(Some(settings))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Settings(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn save(&self, settings: &UserSyncSettings) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SyncError::Settings(format!("{}: {}", parent.display(), e)))?;
        }
        let contents = serde_json::to_string_pretty(settings)
            .map_err(|e| SyncError::Settings(e.to_string()))?;
        fs::write(&self.path, contents)
            .map_err(|e| SyncError::Settings(format!("{}: {}", self.path.display(), e)))
    }
}
