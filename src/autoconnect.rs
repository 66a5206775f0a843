//! # Auto-Connect List
//!
//! The ordered set of devices the manager connects to whenever it sees them,
//! and prints to when no explicit target is given. Persistence is delegated
//! to an [`AutoConnectStore`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::TicketlineError;

/// Key-value persistence for the auto-connect identifiers.
pub trait AutoConnectStore: Send + Sync {
    fn load(&self) -> Result<Vec<DeviceId>, TicketlineError>;

    fn save(&self, ids: &[DeviceId]) -> Result<(), TicketlineError>;
}

/// Non-persistent store, for tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ids: Mutex<Vec<DeviceId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(ids: Vec<DeviceId>) -> Self {
        Self {
            ids: Mutex::new(ids),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DeviceId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AutoConnectStore for MemoryStore {
    fn load(&self) -> Result<Vec<DeviceId>, TicketlineError> {
        Ok(self.lock().clone())
    }

    fn save(&self, ids: &[DeviceId]) -> Result<(), TicketlineError> {
        *self.lock() = ids.to_vec();
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredTargets {
    #[serde(rename = "auto.connect.multi.uuid", default)]
    auto_connect: Vec<DeviceId>,
}

/// Store backed by a small JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl AutoConnectStore for JsonFileStore {
    fn load(&self) -> Result<Vec<DeviceId>, TicketlineError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let stored: StoredTargets = serde_json::from_str(&content).map_err(|e| {
            TicketlineError::Storage(format!("Failed to parse {}: {}", self.path.display(), e))
        })?;
        Ok(stored.auto_connect)
    }

    fn save(&self, ids: &[DeviceId]) -> Result<(), TicketlineError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let stored = StoredTargets {
            auto_connect: ids.to_vec(),
        };
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| TicketlineError::Storage(format!("Failed to encode targets: {}", e)))?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

/// In-memory view of the persisted list.
pub struct AutoConnectList {
    store: Box<dyn AutoConnectStore>,
    ids: RwLock<Vec<DeviceId>>,
}

impl AutoConnectList {
    pub fn load(store: Box<dyn AutoConnectStore>) -> Result<Self, TicketlineError> {
        let ids = dedup(store.load()?);
        Ok(Self {
            store,
            ids: RwLock::new(ids),
        })
    }

    /// Replace the list. Duplicates keep their first position.
    pub fn set<I: IntoIterator<Item = DeviceId>>(&self, ids: I) -> Result<(), TicketlineError> {
        let ids = dedup(ids.into_iter().collect());
        self.store.save(&ids)?;
        tracing::info!(count = ids.len(), "auto-connect targets updated");
        *self.ids.write().unwrap_or_else(PoisonError::into_inner) = ids;
        Ok(())
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.read().contains(&id)
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<DeviceId>> {
        self.ids.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn dedup(ids: Vec<DeviceId>) -> Vec<DeviceId> {
    let mut unique = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(&id) {
            unique.push(id);
        }
    }
    unique
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn id(n: u128) -> DeviceId {
        DeviceId::new(Uuid::from_u128(n))
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("ticketline-{}", Uuid::new_v4()))
            .join("auto-connect.json")
    }

    #[test]
    fn test_set_dedups_preserving_order() {
        let list = AutoConnectList::load(Box::new(MemoryStore::new())).unwrap();
        list.set([id(3), id(1), id(3), id(2), id(1)]).unwrap();
        assert_eq!(list.ids(), vec![id(3), id(1), id(2)]);
        assert!(list.contains(id(2)));
        assert!(!list.contains(id(4)));
    }

    #[test]
    fn test_loads_existing_store() {
        let store = MemoryStore::with_ids(vec![id(1), id(1), id(2)]);
        let list = AutoConnectList::load(Box::new(store)).unwrap();
        assert_eq!(list.ids(), vec![id(1), id(2)]);
    }

    #[test]
    fn test_json_store_round_trip() {
        let path = temp_path();
        let store = JsonFileStore::new(&path);
        assert!(store.load().unwrap().is_empty());

        store.save(&[id(1), id(2)]).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("auto.connect.multi.uuid"));
        assert_eq!(JsonFileStore::new(&path).load().unwrap(), vec![id(1), id(2)]);

        fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_json_store_rejects_corrupt_file() {
        let path = temp_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();

        let result = JsonFileStore::new(&path).load();
        fs::remove_dir_all(path.parent().unwrap()).ok();
        assert!(matches!(result, Err(TicketlineError::Storage(_))));
    }
}
