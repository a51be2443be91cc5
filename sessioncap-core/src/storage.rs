//! Persisted identity.
//!
//! Two storage scopes back a session:
//! - **durable**: survives across sessions (user UUID)
//! - **session**: lives as long as one browsing session (token, page
//!   counter, reset flag)
//!
//! All reads and writes go through [`PersistedState`], which owns the key
//! schema ([`StorageKeys`]). Nothing else touches raw keys.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::StorageKeys;
use crate::error::{Error, Result};

/// A string key/value store.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// In-memory store, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
        Ok(())
    }
}

/// JSON-file-backed store.
///
/// The file is loaded once when the store is opened and rewritten in full on
/// every mutation. A missing file is an empty store.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content).map_err(|e| {
                    Error::Storage(format!("corrupt store {}: {}", path.display(), e))
                })?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
        self.persist(&entries)
    }
}

/// Typed access to the persisted identity fields.
#[derive(Clone)]
pub struct PersistedState {
    keys: StorageKeys,
    session: Arc<dyn Storage>,
    durable: Arc<dyn Storage>,
}

impl PersistedState {
    pub fn new(keys: StorageKeys, session: Arc<dyn Storage>, durable: Arc<dyn Storage>) -> Self {
        Self {
            keys,
            session,
            durable,
        }
    }

    /// Fresh in-memory scopes with default keys.
    pub fn in_memory() -> Self {
        Self::new(
            StorageKeys::default(),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
        )
    }

    fn token_key(&self) -> String {
        self.keys.qualify(&self.keys.token_key)
    }

    fn page_no_key(&self) -> String {
        self.keys.qualify(&self.keys.page_no_key)
    }

    fn reset_key(&self) -> String {
        self.keys.qualify(&self.keys.reset_key)
    }

    fn uuid_key(&self) -> String {
        self.keys.qualify(&self.keys.uuid_key)
    }

    pub fn token(&self) -> Result<Option<String>> {
        self.session.get(&self.token_key())
    }

    pub fn set_token(&self, token: &str) -> Result<()> {
        self.session.set(&self.token_key(), token)
    }

    pub fn clear_token(&self) -> Result<()> {
        self.session.remove(&self.token_key())
    }

    pub fn user_uuid(&self) -> Result<Option<String>> {
        self.durable.get(&self.uuid_key())
    }

    pub fn set_user_uuid(&self, uuid: &str) -> Result<()> {
        self.durable.set(&self.uuid_key(), uuid)
    }

    /// Current page number, if any page has been started in this session.
    pub fn page_no(&self) -> Result<Option<u32>> {
        let Some(raw) = self.session.get(&self.page_no_key())? else {
            return Ok(None);
        };
        match raw.trim().parse::<u32>() {
            Ok(n) => Ok(Some(n)),
            Err(_) => {
                tracing::warn!(value = %raw, "Ignoring unparsable page counter");
                Ok(None)
            }
        }
    }

    /// Advance the page counter and persist it.
    ///
    /// The first page of a session is 0.
    pub fn next_page_no(&self) -> Result<u32> {
        let next = match self.page_no()? {
            Some(n) => n.saturating_add(1),
            None => 0,
        };
        self.session.set(&self.page_no_key(), &next.to_string())?;
        Ok(next)
    }

    /// Read and remove the reset flag left by a previous page.
    pub fn take_reset_flag(&self) -> Result<bool> {
        let key = self.reset_key();
        let flagged = self.session.get(&key)?.is_some();
        self.session.remove(&key)?;
        Ok(flagged)
    }

    pub fn set_reset_flag(&self, flag: bool) -> Result<()> {
        if flag {
            self.session.set(&self.reset_key(), "t")
        } else {
            self.session.remove(&self.reset_key())
        }
    }

    /// Forget every persisted field in both scopes.
    pub fn clear_all(&self) -> Result<()> {
        self.session.clear()?;
        self.durable.clear()
    }
}

impl std::fmt::Debug for PersistedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedState")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}
