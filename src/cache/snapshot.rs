use crate::api::SyncError;
use crate::models::Note;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;

fn key(user_id: &str) -> String {
    format!("glassy_notes_snapshot::{user_id}")
}

/// Durable key-value storage for the boot snapshot.
pub trait SnapshotStorage {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), SyncError>;
    fn remove_item(&self, key: &str);
}

/// `window.localStorage`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BrowserStorage;

impl BrowserStorage {
    fn storage() -> Option<web_sys::Storage> {
        web_sys::window().and_then(|w| w.local_storage().ok().flatten())
    }
}

impl SnapshotStorage for BrowserStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        Self::storage()?.get_item(key).ok().flatten()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let storage =
            Self::storage().ok_or_else(|| SyncError::Storage("localStorage unavailable".into()))?;
        storage
            .set_item(key, value)
            .map_err(|e| SyncError::Storage(format!("{e:?}")))
    }

    fn remove_item(&self, key: &str) {
        if let Some(storage) = Self::storage() {
            let _ = storage.remove_item(key);
        }
    }
}

/// Process-local storage, for embedding outside a browser.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RefCell<HashMap<String, String>>,
}

impl SnapshotStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.borrow().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.items
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        self.items.borrow_mut().remove(key);
    }
}

/// Placeholder lists painted before the first network round trip completes.
/// Never treated as a source of truth.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BootSnapshot {
    pub saved_ms: i64,
    pub user_id: String,
    #[serde(default)]
    pub active: Vec<Note>,
    #[serde(default)]
    pub archived: Vec<Note>,
}

pub fn save_boot_snapshot(
    storage: &dyn SnapshotStorage,
    user_id: &str,
    active: Vec<Note>,
    archived: Vec<Note>,
    saved_ms: i64,
) -> Result<(), SyncError> {
    if user_id.trim().is_empty() {
        return Ok(());
    }

    let snap = BootSnapshot {
        saved_ms,
        user_id: user_id.to_string(),
        active,
        archived,
    };
    let json = serde_json::to_string(&snap).map_err(|e| SyncError::Storage(e.to_string()))?;
    storage.set_item(&key(user_id), &json)
}

pub fn load_boot_snapshot(storage: &dyn SnapshotStorage, user_id: &str) -> Option<BootSnapshot> {
    if user_id.trim().is_empty() {
        return None;
    }
    let json = storage.get_item(&key(user_id))?;
    match serde_json::from_str::<BootSnapshot>(&json) {
        // A snapshot saved under another account must never leak across users.
        Ok(snap) if snap.user_id == user_id => Some(snap),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "discarding unreadable boot snapshot");
            storage.remove_item(&key(user_id));
            None
        }
    }
}

pub fn clear_boot_snapshot(storage: &dyn SnapshotStorage, user_id: &str) {
    if user_id.trim().is_empty() {
        return;
    }
    storage.remove_item(&key(user_id));
}
