use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use futures::future::{BoxFuture, FutureExt};
use rand::RngCore;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{validate_key, KeyValueStore};

/// Size of a ChaCha20-Poly1305 nonce in bytes
const NONCE_LEN: usize = 12;

/// Seals values at rest with ChaCha20-Poly1305.
///
/// Sealed layout: `nonce (12 bytes) || ciphertext+tag`.
#[derive(Clone)]
pub struct Sealer {
    cipher: ChaCha20Poly1305,
}

impl Sealer {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| anyhow!("Failed to seal value"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(anyhow!("Sealed value is truncated"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("Failed to open sealed value (wrong key or corrupted file)"))
    }
}

/// File-per-key store under a directory.
///
/// Writes go to a uniquely named temp file in the same directory that is
/// then renamed over the target, so readers see either the old value or the
/// new one.
pub struct FileStore {
    dir: PathBuf,
    sealer: Option<Sealer>,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, sealer: None }
    }

    pub fn sealed(dir: PathBuf, sealer: Sealer) -> Self {
        Self {
            dir,
            sealer: Some(sealer),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn value_path(&self, key: &str) -> PathBuf {
        let ext = if self.sealer.is_some() { "bin" } else { "json" };
        self.dir.join(format!("{}.{}", key, ext))
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        let path = self.value_path(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let plain = match &self.sealer {
            Some(sealer) => sealer.open(&raw)?,
            None => raw,
        };
        let value = String::from_utf8(plain).context("Stored value is not valid UTF-8")?;
        Ok(Some(value))
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let bytes = match &self.sealer {
            Some(sealer) => sealer.seal(value.as_bytes())?,
            None => value.as_bytes().to_vec(),
        };

        let path = self.value_path(key);
        let dir = self.dir.clone();
        let len = bytes.len();
        // One temp file per write; the rename is what readers observe
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = NamedTempFile::new_in(&dir)
                .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
            tmp.write_all(&bytes)
                .with_context(|| format!("Failed to write temp file for {}", path.display()))?;
            tmp.persist(&path)
                .map_err(|e| e.error)
                .with_context(|| format!("Failed to replace {}", path.display()))?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow!("Store write task failed: {}", e))??;
        debug!(key = key, bytes = len, "Stored value");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let path = self.value_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

impl KeyValueStore for FileStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        self.read(key).boxed()
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
        self.write(key, value).boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        self.delete(key).boxed()
    }
}
