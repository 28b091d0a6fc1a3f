//! Durable key-value state.
//!
//! `FileStore` keeps every key in a single JSON document written with the
//! temp-file + rename pattern, so a crash never leaves a torn state file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Key-value storage for node identity and backend state.
pub trait StateStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn write(&self, key: &str, value: &[u8]) -> Result<()>;

    /// True for stores that do not survive a restart.
    fn is_in_memory(&self) -> bool {
        false
    }
}

/// On-disk format: values are base64 so arbitrary bytes survive JSON.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(flatten)]
    entries: BTreeMap<String, String>,
}

/// File-backed store.
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FileStore {
    /// Open (or create on first write) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut cache = BTreeMap::new();

        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read state file: {}", path.display()))?;
            if !content.trim().is_empty() {
                let file: StateFile = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
                for (key, value) in file.entries {
                    let bytes = STANDARD
                        .decode(value)
                        .with_context(|| format!("Corrupt value for key {key:?}"))?;
                    cache.insert(key, bytes);
                }
            }
        }

        debug!(path = %path.display(), keys = cache.len(), "Opened state store");
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, cache: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let file = StateFile {
            entries: cache
                .iter()
                .map(|(k, v)| (k.clone(), STANDARD.encode(v)))
                .collect(),
        };
        let content = serde_json::to_string_pretty(&file).context("Failed to serialize state")?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut cache = self.lock();
        if cache.get(key).map(Vec::as_slice) == Some(value) {
            return Ok(());
        }
        cache.insert(key.to_string(), value.to_vec());
        self.persist(&cache)
    }
}

/// Store that lives only as long as the process.
#[derive(Default)]
pub struct MemStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn is_in_memory(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vnet.state");

        let store = FileStore::open(&path).unwrap();
        assert!(store.read("_machinekey").unwrap().is_none());
        store.write("_machinekey", &[0, 159, 146, 150]).unwrap();
        store.write("profile", b"{}").unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(
            reopened.read("_machinekey").unwrap(),
            Some(vec![0, 159, 146, 150])
        );
        assert_eq!(reopened.read("profile").unwrap(), Some(b"{}".to_vec()));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vnet.state");
        fs::write(&path, "not json").unwrap();

        assert!(FileStore::open(&path).is_err());
    }

    #[test]
    fn test_mem_store() {
        let store = MemStore::new();
        store.write("k", b"v").unwrap();
        assert_eq!(store.read("k").unwrap(), Some(b"v".to_vec()));
        assert!(store.is_in_memory());
        assert!(!FileStore::open("/nonexistent/vnet.state").unwrap().is_in_memory());
    }
}
