//! Persisted Session State
//!
//! The connection layer remembers who was logged in across restarts through a
//! small key/value store. The storage medium is pluggable: tests use
//! [`MemoryStore`], the binary uses [`JsonFileStore`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

/// Opaque session token returned by login.
pub const KEY_TOKEN: &str = "token";
/// Player identifier returned by login.
pub const KEY_PLAYER_ID: &str = "playerId";
/// Serialized [`StoredUser`].
pub const KEY_USER_INFO: &str = "userInfo";
/// `"true"` once the user has signed in on this device.
pub const KEY_SIGNED_IN: &str = "isSignedIn";

/// Key/value storage for session state.
pub trait SessionStore: Send {
    /// Read a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value.
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a value. Missing keys are not an error.
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

/// Last known user record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredUser {
    /// Login name; an email for provider identities.
    pub user_id: String,
    /// Provider-side id.
    pub id: String,
    /// Last login location reported by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Avatar path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Cached point balance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<i64>,
}

impl StoredUser {
    /// Minimal record.
    pub fn new(user_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            id: id.into(),
            location: None,
            avatar: None,
            points: None,
        }
    }

    /// Email-shaped user ids belong to the identity-provider flow.
    pub fn is_provider_identity(&self) -> bool {
        self.user_id.contains('@')
    }

    /// Load the record from a store, ignoring corrupt entries.
    pub fn load(store: &dyn SessionStore) -> Option<Self> {
        let raw = store.get(KEY_USER_INFO)?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                debug!("Ignoring unreadable user record: {}", e);
                None
            }
        }
    }

    /// Write the record to a store.
    pub fn save(&self, store: &mut dyn SessionStore) -> Result<(), StoreError> {
        let raw = serde_json::to_string(self)?;
        store.set(KEY_USER_INFO, &raw)
    }
}

/// In-process store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object file, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl JsonFileStore {
    /// Open a store, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, values })
    }

    fn flush(&self) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl SessionStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        if self.values.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}
