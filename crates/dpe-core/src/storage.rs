//! # Storage Ports
//!
//! The engine persists two kinds of records: one JSON document per policy
//! and one append-only record per outcome. Both go through
//! [`KeyValueStore`], which needs only get, put and list-by-prefix.
//!
//! ## Key Layout
//!
//! ```text
//! policies/{policy_id}
//! lifecycle/{policy_id}/{seq}
//! outcomes/{policy_id}/{timestamp_nanos}-{outcome_id}
//! ```
//!
//! Keys are `/`-separated segments drawn from `[A-Za-z0-9_.@:-]`. `..`
//! segments are rejected so a directory-backed store cannot escape its root.
//!
//! ## Failure Semantics
//!
//! Every method returns [`StorageError`]. Callers keep serving reads from
//! their in-memory caches when a store fails, but writes must surface the
//! error.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::StorageError;

/// Minimal document store contract.
pub trait KeyValueStore: Send + Sync {
    /// Read one document.
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Write one document, replacing any previous value.
    fn put(&self, key: &str, value: &Value) -> Result<(), StorageError>;

    /// List every `(key, document)` whose key starts with `prefix`, sorted
    /// by key.
    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError>;
}

/// Validate a storage key against the permitted alphabet.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let ok = !key.is_empty()
        && key.split('/').all(|seg| {
            !seg.is_empty()
                && seg != ".."
                && seg != "."
                && seg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | ':' | '-'))
        });
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Thread-safe, cloneable in-memory store.
///
/// Clones share the same underlying map. The lock is `parking_lot`, which
/// does not poison, and it is never held across calls into caller code.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<String, Value>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while set, every operation fails with
    /// [`StorageError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.check_available()?;
        validate_key(key)?;
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.check_available()?;
        validate_key(key)?;
        self.data.write().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// DirectoryStore
// ---------------------------------------------------------------------------

/// A store backed by one JSON file per key.
///
/// Key `a/b/c` lives at `{base_dir}/a/b/c.json`. Writes go to a sibling
/// temporary file first and are renamed into place, so readers never see a
/// half-written document.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    base_dir: PathBuf,
}

impl DirectoryStore {
    /// Create a store rooted at `base_dir`. The directory is created lazily.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Return the base directory path.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.base_dir.clone();
        let mut segments = key.split('/').peekable();
        while let Some(seg) = segments.next() {
            if segments.peek().is_some() {
                path.push(seg);
            } else {
                path.push(format!("{seg}.json"));
            }
        }
        path
    }

    fn collect(&self, dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<(), StorageError> {
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_rel = if rel.is_empty() {
                name.clone()
            } else {
                format!("{rel}/{name}")
            };
            if entry.file_type()?.is_dir() {
                self.collect(&entry.path(), &child_rel, out)?;
            } else if let Some(stem) = child_rel.strip_suffix(".json") {
                out.push(stem.to_string());
            }
        }
        Ok(())
    }
}

impl KeyValueStore for DirectoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        validate_key(key)?;
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            tracing::warn!(key, error = %e, "stored document is not valid JSON");
            StorageError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })
    }

    fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        validate_key(key)?;
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;
        tracing::debug!(key, bytes = bytes.len(), "document written");
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let mut keys = Vec::new();
        self.collect(&self.base_dir, "", &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key)? {
                out.push((key, value));
            }
        }
        Ok(out)
    }
}
