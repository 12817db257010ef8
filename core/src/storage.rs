use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

const STORAGE_FILE: &str = "local_storage.json";

/// Persisted string key-value store, the client's equivalent of browser local
/// storage. Every mutation is written through to disk before returning.
/// Storage without a root directory keeps values in memory only.
#[derive(Clone)]
pub struct LocalStorage {
    root: Option<PathBuf>,
    values: Arc<RwLock<BTreeMap<String, String>>>,
}

impl LocalStorage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create storage directory {}", root.display()))?;
        let values = read_values(&root.join(STORAGE_FILE));
        Ok(Self {
            root: Some(root),
            values: Arc::new(RwLock::new(values)),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            root: None,
            values: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    /// Values change only once the file write succeeds.
    pub fn set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let mut values = self.values.write();
        let mut next = values.clone();
        next.insert(key.to_owned(), value.into());
        self.flush(&next)?;
        *values = next;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.write();
        if !values.contains_key(key) {
            return Ok(());
        }
        let mut next = values.clone();
        next.remove(key);
        self.flush(&next)?;
        *values = next;
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, %err, "ignoring unreadable stored value");
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let serialized = serde_json::to_string(value)?;
        self.set(key, serialized)
    }

    fn flush(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let path = root.join(STORAGE_FILE);
        let serialized = serde_json::to_vec_pretty(values)?;
        fs::write(&path, serialized)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

fn read_values(path: &Path) -> BTreeMap<String, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(err) => {
            warn!(%err, "failed to read {}, starting empty", path.display());
            return BTreeMap::new();
        }
    };
    serde_json::from_str(&contents).unwrap_or_else(|err| {
        warn!(%err, "failed to parse {}, starting empty", path.display());
        BTreeMap::new()
    })
}
