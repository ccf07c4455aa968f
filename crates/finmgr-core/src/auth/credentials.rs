use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use keyring::Entry;
use thiserror::Error;
use tracing::{debug, warn};

const SERVICE_NAME: &str = "finmgr";

/// Key under which the bearer token is persisted
pub const TOKEN_KEY: &str = "fm_token";

/// Key under which the last used email is persisted
pub const EMAIL_KEY: &str = "fm_email";

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Durable client-local storage for the persisted session entries.
///
/// Every `set` must be atomic: a reader sees either the old value or the new
/// one, never a partial write.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Remove an entry. Removing a missing entry is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Write several entries as one unit: either all of them land or the
    /// previous values are left in place.
    ///
    /// The default writes one entry at a time and restores the earlier
    /// values when a write fails.
    fn set_entries(&self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        let mut previous: Vec<(&str, Option<String>)> = Vec::with_capacity(entries.len());
        for &(key, value) in entries {
            let old = self.get(key).ok().flatten();
            if let Err(e) = self.set(key, value) {
                for (key, old) in previous.into_iter().rev() {
                    let restored = match old {
                        Some(ref old) => self.set(key, old),
                        None => self.remove(key),
                    };
                    if let Err(e) = restored {
                        warn!(key, error = %e, "Failed to roll back session entry");
                    }
                }
                return Err(e);
            }
            previous.push((key, old));
        }
        Ok(())
    }
}

/// Stores entries in a small JSON file, replaced atomically on every write.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(SESSION_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    /// Entries to start a write from. A corrupt file is discarded so the
    /// session can still be replaced or cleared; the bool reports whether
    /// the file must be rewritten regardless of changes.
    fn read_for_update(&self) -> Result<(BTreeMap<String, String>, bool), StoreError> {
        match self.read_all() {
            Ok(entries) => Ok((entries, false)),
            Err(StoreError::Corrupt(e)) => {
                warn!(path = %self.path.display(), error = %e, "Discarding corrupt session file");
                Ok((BTreeMap::new(), true))
            }
            Err(e) => Err(e),
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set_entries(&[(key, value)])
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let (mut entries, corrupt) = self.read_for_update()?;
        if entries.remove(key).is_some() || corrupt {
            self.write_all(&entries)?;
        }
        Ok(())
    }

    /// All entries go out in a single file replacement.
    fn set_entries(&self, updates: &[(&str, &str)]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let (mut entries, _) = self.read_for_update()?;
        for &(key, value) in updates {
            entries.insert(key.to_string(), value.to_string());
        }
        self.write_all(&entries)
    }
}

/// Stores each entry as its own item in the OS keychain.
pub struct KeyringStore;

impl KeyringStore {
    fn entry(key: &str) -> Result<Entry, StoreError> {
        Ok(Entry::new(SERVICE_NAME, key)?)
    }
}

impl SessionStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match Self::entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        Self::entry(key)?.set_password(value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match Self::entry(key)?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => {
                debug!(key, "Nothing to remove from keychain");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store, used by tests and by callers that opt out of
/// persistence.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls served so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    fn set_entries(&self, updates: &[(&str, &str)]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for &(key, value) in updates {
            entries.insert(key.to_string(), value.to_string());
        }
        self.writes.fetch_add(updates.len(), Ordering::SeqCst);
        Ok(())
    }
}
