//! Remembered session paths, so a new handle reattaches to the same session.
//!
//! Keys are derived from the kernelspec name; values are the session path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::{KernelSessionError, Result};

const KEY_PREFIX: &str = "kernel-session-path";

/// Key under which the session path for `kernel_spec_name` is stored.
pub fn reconnection_key(kernel_spec_name: &str) -> String {
    format!("{}_{}", KEY_PREFIX, kernel_spec_name)
}

pub trait ReconnectionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, path: &str) -> Result<()>;
}

/// Process-local store. Paths are forgotten on exit.
#[derive(Debug, Default)]
pub struct MemoryReconnectionStore {
    paths: Mutex<HashMap<String, String>>,
}

impl MemoryReconnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReconnectionStore for MemoryReconnectionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, path: &str) -> Result<()> {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), path.to_string());
        Ok(())
    }
}

/// Store backed by a JSON object file (`{"<key>": "<path>"}`).
#[derive(Debug)]
pub struct FileReconnectionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileReconnectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            KernelSessionError::Settings(format!("reading {}: {}", self.path.display(), e))
        })?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }
}

impl ReconnectionStore for FileReconnectionStore {
    fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.read() {
            Ok(mut paths) => paths.remove(key),
            Err(e) => {
                log::warn!("[reconnect] Ignoring unreadable {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn set(&self, key: &str, path: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        // An unreadable file is replaced rather than blocking new sessions.
        let mut paths = self.read().unwrap_or_default();
        paths.insert(key.to_string(), path.to_string());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&paths)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnection_key() {
        assert_eq!(reconnection_key("python3"), "kernel-session-path_python3");
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryReconnectionStore::new();
        assert_eq!(store.get("k"), None);
        store.set("k", "path-1").unwrap();
        store.set("k", "path-2").unwrap();
        assert_eq!(store.get("k").as_deref(), Some("path-2"));
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nested").join("reconnect.json");

        let store = FileReconnectionStore::new(&file);
        assert_eq!(store.get("a"), None);
        store.set("a", "path-a").unwrap();
        store.set("b", "path-b").unwrap();

        let reopened = FileReconnectionStore::new(&file);
        assert_eq!(reopened.get("a").as_deref(), Some("path-a"));
        assert_eq!(reopened.get("b").as_deref(), Some("path-b"));
    }

    #[test]
    fn test_file_store_recovers_from_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("reconnect.json");
        std::fs::write(&file, "not json").unwrap();

        let store = FileReconnectionStore::new(&file);
        assert_eq!(store.get("a"), None);
        store.set("a", "path-a").unwrap();
        assert_eq!(store.get("a").as_deref(), Some("path-a"));
    }
}
