//! Persistent key/value storage backends.
//!
//! Every backend is atomic at the key level: a reader observes either the
//! previous value or the new one, never a partial write.
//!
//! - `MemoryStore`: in-process map, used for tests and ephemeral sessions
//! - `KeyringStore`: OS keychain entries for secrets such as the bearer token
//! - `FileStore`: one file per key, optionally sealed with ChaCha20-Poly1305

pub mod file;
pub mod keychain;

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use futures::future::{self, BoxFuture, FutureExt};

pub use self::file::{FileStore, Sealer};
pub use self::keychain::{DeviceKey, KeyringStore};

/// Asynchronous key/value access to device-local storage.
pub trait KeyValueStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Remove a key. Removing an absent key is a no-op.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> T) -> Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("Memory store lock poisoned"))?;
        Ok(f(&mut entries))
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        future::ready(self.with_entries(|e| e.get(key).cloned())).boxed()
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
        future::ready(self.with_entries(|e| {
            e.insert(key.to_string(), value.to_string());
        }))
        .boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        future::ready(self.with_entries(|e| {
            e.remove(key);
        }))
        .boxed()
    }
}

/// Keys are used as file names and keychain accounts, so keep them simple.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(anyhow!("Invalid storage key: {:?}", key))
    }
}
