use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage file {path} is not a JSON object: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// String key/value store that outlives the process, the way a browser's
/// local storage does. Implementations must be cheap to clone and clones
/// must observe each other's writes.
#[typetag::serde]
pub trait StorageType: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Vec<String>;
    fn clone_box(&self) -> Box<dyn StorageType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct Storage(pub Box<dyn StorageType>);

impl Storage {
    pub fn in_memory() -> Self {
        Storage(InMemoryStorage::new())
    }

    pub fn into_inner(self) -> Box<dyn StorageType> {
        self.0
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.0.get_item(key)
    }

    pub fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.0.set_item(key, value)
    }

    pub fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.0.remove_item(key)
    }

    /// Keys that start with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .0
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        keys
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Storage(self.0.clone_box())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InMemoryStorage {
    #[serde(skip)]
    items: Arc<DashMap<String, String>>,
}

impl InMemoryStorage {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }
}

#[typetag::serde]
impl StorageType for InMemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.get(key).map(|v| v.value().clone())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.remove(key);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.items.iter().map(|e| e.key().clone()).collect()
    }

    fn clone_box(&self) -> Box<dyn StorageType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("InMemoryStorage({} items)", self.items.len())
    }
}

/// One JSON object on disk. Every mutation rewrites the whole file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileStorage {
    path: PathBuf,
    #[serde(skip)]
    write_lock: Arc<Mutex<()>>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Box<Self> {
        Box::new(Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.path).map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|source| StorageError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let body = serde_json::to_string_pretty(map).map_err(|source| StorageError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        fs::write(&self.path, body).map_err(io_err)
    }

    fn update(
        &self,
        apply: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.read_map()?;
        apply(&mut map);
        self.write_map(&map)
    }
}

#[typetag::serde]
impl StorageType for FileStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        match self.read_map() {
            Ok(mut map) => map.remove(key),
            Err(err) => {
                warn!(error = %err, "could not read storage file");
                None
            }
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.update(|map| {
            map.insert(key.to_string(), value.to_string());
        })
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.update(|map| {
            map.remove(key);
        })
    }

    fn keys(&self) -> Vec<String> {
        self.read_map()
            .map(|map| map.into_keys().collect())
            .unwrap_or_default()
    }

    fn clone_box(&self) -> Box<dyn StorageType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("FileStorage({})", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn in_memory_clones_share_items() {
        let storage = Storage::in_memory();
        let other = storage.clone();
        storage.set_item("a", "1").unwrap();
        assert_eq!(other.get_item("a"), Some("1".to_string()));
        other.remove_item("a").unwrap();
        assert_eq!(storage.get_item("a"), None);
    }

    #[test]
    fn file_storage_persists_between_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("board.json");
        let storage = Storage(FileStorage::new(&path));
        storage.set_item("nodeboard.flow.paused", "true").unwrap();
        storage.set_item("other", "x").unwrap();

        let reopened = Storage(FileStorage::new(&path));
        assert_eq!(reopened.get_item("nodeboard.flow.paused"), Some("true".into()));
        assert_eq!(reopened.keys_with_prefix("nodeboard."), vec!["nodeboard.flow.paused".to_string()]);

        reopened.remove_item("other").unwrap();
        assert_eq!(storage.get_item("other"), None);
    }

    #[test]
    fn corrupt_file_reads_as_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("board.json");
        fs::write(&path, "not json").unwrap();
        let storage = Storage(FileStorage::new(&path));
        assert_eq!(storage.get_item("k"), None);
        assert!(storage.set_item("k", "v").is_err());
    }

    #[test]
    fn storage_handle_round_trips_through_typetag() {
        let storage = Storage(FileStorage::new("/tmp/board.json"));
        let json = serde_json::to_string(&storage).unwrap();
        assert!(json.contains("FileStorage"));
        let back: Storage = serde_json::from_str(&json).unwrap();
        assert_eq!(format!("{back:?}"), "FileStorage(/tmp/board.json)");
    }
}
