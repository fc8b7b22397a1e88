use anyhow::{anyhow, Context, Result};
use futures::future::{BoxFuture, FutureExt};
use keyring::Entry;
use rand::RngCore;
use tracing::{debug, info};

use super::{validate_key, KeyValueStore};

/// Default keychain service name
pub const SERVICE_NAME: &str = "nutricoach";

/// Keychain account holding the device sealing key
const DEVICE_KEY_ACCOUNT: &str = "device-key";

/// Secrets in the OS keychain, one entry per key.
///
/// Keychain calls are blocking, so each one runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    async fn blocking<T, F>(&self, key: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Entry) -> Result<T> + Send + 'static,
    {
        validate_key(key)?;
        let service = self.service.clone();
        let account = key.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &account).context("Failed to create keyring entry")?;
            op(entry)
        })
        .await
        .map_err(|e| anyhow!("Keyring task failed: {}", e))?
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl KeyValueStore for KeyringStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        self.blocking(key, |entry| match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to read from keychain"),
        })
        .boxed()
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
        let value = value.to_string();
        self.blocking(key, move |entry| {
            entry
                .set_password(&value)
                .context("Failed to store value in keychain")
        })
        .boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        self.blocking(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        })
        .boxed()
    }
}

/// 32-byte key used to seal local files, kept in the keychain.
pub struct DeviceKey;

impl DeviceKey {
    /// Load the device key, generating and storing a new one on first use
    pub async fn load_or_create(service: &str) -> Result<[u8; 32]> {
        let service = service.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, DEVICE_KEY_ACCOUNT)
                .context("Failed to create keyring entry")?;
            match entry.get_secret() {
                Ok(secret) if secret.len() == 32 => {
                    debug!("Loaded device key from keychain");
                    let mut key = [0u8; 32];
                    key.copy_from_slice(&secret);
                    return Ok(key);
                }
                Ok(_) => info!("Stored device key has wrong length, regenerating"),
                Err(keyring::Error::NoEntry) => info!("No device key found, generating"),
                Err(e) => return Err(e).context("Failed to read device key from keychain"),
            }

            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            entry
                .set_secret(&key)
                .context("Failed to store device key in keychain")?;
            Ok(key)
        })
        .await
        .map_err(|e| anyhow!("Keyring task failed: {}", e))?
    }
}
