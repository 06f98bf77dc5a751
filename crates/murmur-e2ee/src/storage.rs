//! Local secure storage.
//!
//! Everything the engine persists (account, sessions, queue) goes through
//! [`SecureStorage`] as single-key atomic writes. Records are JSON.
//!
//! [`FileStorage`] keeps one file per key, encrypted with ChaCha20-Poly1305
//! under a caller-supplied storage key, and replaces files atomically via
//! a temporary file plus rename.

use crate::error::{E2eeError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

#[async_trait]
pub trait SecureStorage: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn save(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Load and decode a JSON record.
pub async fn load_json<T: DeserializeOwned>(
    storage: &dyn SecureStorage,
    key: &str,
) -> Result<Option<T>> {
    match storage.load(key).await? {
        Some(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| E2eeError::storage(format!("corrupt record {key}: {e}"))),
        None => Ok(None),
    }
}

/// Encode and save a JSON record.
pub async fn save_json<T: Serialize + ?Sized>(
    storage: &dyn SecureStorage,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = Zeroizing::new(serde_json::to_vec(value).map_err(E2eeError::storage)?);
    storage.save(key, &raw).await
}

/// Volatile storage for tests and demos.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Encrypted one-file-per-key storage.
pub struct FileStorage {
    root: PathBuf,
    cipher: ChaCha20Poly1305,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    pub async fn open(root: impl AsRef<Path>, storage_key: &[u8; 32]) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| E2eeError::storage(format!("{}: {e}", root.display())))?;
        Ok(Self {
            root,
            cipher: ChaCha20Poly1305::new(Key::from_slice(storage_key)),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.rec", URL_SAFE_NO_PAD.encode(key.as_bytes())))
    }
}

#[async_trait]
impl SecureStorage for FileStorage {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        let sealed = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(E2eeError::storage(format!("{}: {e}", path.display()))),
        };

        if sealed.len() < NONCE_LEN {
            return Err(E2eeError::storage(format!("truncated record {key}")));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| E2eeError::storage(format!("record {key} failed authentication")))?;
        Ok(Some(plaintext))
    }

    async fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: value,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| E2eeError::storage(format!("failed to seal record {key}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &sealed)
            .await
            .map_err(|e| E2eeError::storage(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| E2eeError::storage(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(E2eeError::storage(format!("{}: {e}", path.display()))),
        }
    }
}
