//! Identity and prekey bundle manager.
//!
//! Owns the device identity, the current (and recently rotated) signed
//! prekeys and the local pool of one-time prekey secrets. The account is
//! created lazily by [`PrekeyManager::initialize`] and persisted under a
//! single storage key, so every mutation is one atomic write.

use crate::config::E2eeConfig;
use crate::directory::{bounded, KeyDirectory};
use crate::error::{E2eeError, Result};
use crate::storage::{load_json, save_json, SecureStorage};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use murmur_common::helpers::now_ms;
use murmur_common::{PrekeyUpload, UserId};
use murmur_crypto::prekey::generate_one_time_prekeys;
use murmur_crypto::{DeviceKey, IdentityKeypair, IdentitySecret, OneTimePrekey, SignedPrekey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const ACCOUNT_KEY: &str = "account";

/// Material the user must back up before the device goes live.
pub struct RecoveryKit {
    pub user: UserId,
    pub device_key: DeviceKey,
    /// base64url identity secret; recreates the device identity.
    pub secret: Zeroizing<String>,
}

impl fmt::Debug for RecoveryKit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryKit")
            .field("user", &self.user)
            .field("device_key", &self.device_key)
            .finish_non_exhaustive()
    }
}

/// Asks the user to confirm the recovery backup.
#[async_trait]
pub trait BackupAcknowledger: Send + Sync {
    /// Return true once the user has stored the kit.
    async fn acknowledge(&self, kit: &RecoveryKit) -> bool;
}

/// Acknowledges every kit without user interaction.
pub struct AutoAcknowledge;

#[async_trait]
impl BackupAcknowledger for AutoAcknowledge {
    async fn acknowledge(&self, _kit: &RecoveryKit) -> bool {
        true
    }
}

#[derive(Serialize, Deserialize)]
struct AccountRecord {
    identity: IdentitySecret,
    /// Oldest first; the last entry is current.
    signed_prekeys: Vec<SignedPrekey>,
    one_time_prekeys: BTreeMap<u32, OneTimePrekey>,
    next_prekey_id: u32,
    next_signed_prekey_id: u32,
    /// One-time prekey ids generated but not yet confirmed by the directory.
    unpublished: Vec<u32>,
    backup_acknowledged: bool,
    published: bool,
}

impl AccountRecord {
    fn generate(config: &E2eeConfig) -> Self {
        let identity = IdentityKeypair::generate();
        let signed = SignedPrekey::generate(1, now_ms(), &identity);
        let pool = generate_one_time_prekeys(1, config.initial_prekey_count);
        let unpublished = pool.iter().map(|k| k.id).collect();
        Self {
            identity: identity.to_secret(),
            signed_prekeys: vec![signed],
            one_time_prekeys: pool.into_iter().map(|k| (k.id, k)).collect(),
            next_prekey_id: config.initial_prekey_count.saturating_add(1),
            next_signed_prekey_id: 2,
            unpublished,
            backup_acknowledged: false,
            published: false,
        }
    }

    fn identity(&self) -> IdentityKeypair {
        IdentityKeypair::from_secret(&self.identity)
    }

    fn current_signed_prekey(&self) -> Result<&SignedPrekey> {
        self.signed_prekeys.last().ok_or(E2eeError::NotInitialized)
    }

    fn upload(&self, user: &UserId) -> Result<PrekeyUpload> {
        let identity = self.identity();
        Ok(PrekeyUpload {
            user: user.clone(),
            device_key: identity.device_key(),
            signing_key: identity.signing_public(),
            signed_prekey: self.current_signed_prekey()?.public(),
            one_time_prekeys: self
                .unpublished
                .iter()
                .filter_map(|id| self.one_time_prekeys.get(id))
                .map(|k| k.public())
                .collect(),
        })
    }
}

/// Keys the responder needs to accept an initial message.
pub struct ResponderKeys {
    pub identity: IdentityKeypair,
    pub signed_prekey: SignedPrekey,
    pub one_time_prekey: Option<OneTimePrekey>,
}

pub struct PrekeyManager {
    user: UserId,
    storage: Arc<dyn SecureStorage>,
    directory: Arc<dyn KeyDirectory>,
    config: E2eeConfig,
    record: Mutex<Option<AccountRecord>>,
}

impl PrekeyManager {
    pub fn new(
        user: UserId,
        storage: Arc<dyn SecureStorage>,
        directory: Arc<dyn KeyDirectory>,
        config: E2eeConfig,
    ) -> Self {
        Self {
            user,
            storage,
            directory,
            config,
            record: Mutex::new(None),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Create the identity on first use, collect the backup acknowledgment
    /// and publish the bundle. A no-op once the account is published.
    pub async fn initialize(&self, acknowledger: &dyn BackupAcknowledger) -> Result<DeviceKey> {
        let mut guard = self.record.lock().await;
        if guard.is_none() {
            *guard = load_json(self.storage.as_ref(), ACCOUNT_KEY).await?;
        }

        if guard.is_none() {
            let record = AccountRecord::generate(&self.config);
            save_json(self.storage.as_ref(), ACCOUNT_KEY, &record).await?;
            info!(
                user = %self.user,
                device = %record.identity().device_key(),
                prekeys = record.one_time_prekeys.len(),
                "generated device identity"
            );
            *guard = Some(record);
        }
        let record = guard.as_mut().ok_or(E2eeError::NotInitialized)?;
        let device_key = record.identity().device_key();

        if !record.backup_acknowledged {
            let kit = RecoveryKit {
                user: self.user.clone(),
                device_key: device_key.clone(),
                secret: Zeroizing::new(encode_secret(&record.identity)),
            };
            if !acknowledger.acknowledge(&kit).await {
                warn!(user = %self.user, "recovery backup not acknowledged");
                return Err(E2eeError::BackupNotAcknowledged);
            }
            record.backup_acknowledged = true;
            save_json(self.storage.as_ref(), ACCOUNT_KEY, &*record).await?;
        }

        if !record.published {
            let upload = record.upload(&self.user)?;
            self.upload_with_retry(upload)
                .await
                .map_err(|e| E2eeError::InitializationError(e.to_string()))?;
            record.published = true;
            record.unpublished.clear();
            save_json(self.storage.as_ref(), ACCOUNT_KEY, &*record).await?;
            info!(user = %self.user, device = %device_key, "prekey bundle published");
        }

        Ok(device_key)
    }

    async fn upload_with_retry(&self, upload: PrekeyUpload) -> Result<()> {
        let attempts = self.config.upload_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = bounded(
                self.config.claim_timeout(),
                "upload",
                self.directory.upload(upload.clone()),
            )
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    let base = self
                        .config
                        .upload_backoff_ms
                        .saturating_mul(1u64 << (attempt - 1).min(16));
                    let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
                    warn!(attempt, error = %e, "prekey upload failed; retrying");
                    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
                }
            }
        }
    }

    async fn loaded(&self) -> Result<tokio::sync::MutexGuard<'_, Option<AccountRecord>>> {
        let mut guard = self.record.lock().await;
        if guard.is_none() {
            *guard = load_json(self.storage.as_ref(), ACCOUNT_KEY).await?;
        }
        if guard.is_none() {
            return Err(E2eeError::NotInitialized);
        }
        Ok(guard)
    }

    pub async fn is_initialized(&self) -> Result<bool> {
        let guard = self.loaded().await;
        match guard {
            Ok(guard) => Ok(guard.as_ref().map(|r| r.published).unwrap_or(false)),
            Err(E2eeError::NotInitialized) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn identity(&self) -> Result<IdentityKeypair> {
        let guard = self.loaded().await?;
        guard
            .as_ref()
            .map(AccountRecord::identity)
            .ok_or(E2eeError::NotInitialized)
    }

    pub async fn device_key(&self) -> Result<DeviceKey> {
        Ok(self.identity().await?.device_key())
    }

    /// Published one-time prekey count, as reported by the directory.
    pub async fn current_prekey_count(&self) -> Result<usize> {
        let device = self.device_key().await?;
        bounded(
            self.config.claim_timeout(),
            "prekey_count",
            self.directory.prekey_count(&self.user, &device),
        )
        .await
    }

    /// Unconsumed one-time prekey secrets held locally.
    pub async fn local_prekey_count(&self) -> Result<usize> {
        let guard = self.loaded().await?;
        Ok(guard
            .as_ref()
            .map(|r| r.one_time_prekeys.len())
            .unwrap_or(0))
    }

    /// Generate and publish `count` one-time prekeys.
    ///
    /// Keys from an earlier attempt that never got confirmed are published
    /// again instead of generating more, so retrying is safe. The account
    /// lock is not held during the upload.
    pub async fn replenish(&self, count: u32) -> Result<usize> {
        let upload = {
            let mut guard = self.loaded().await?;
            let record = guard.as_mut().ok_or(E2eeError::NotInitialized)?;

            if record.unpublished.is_empty() {
                let keys = generate_one_time_prekeys(record.next_prekey_id, count);
                record.next_prekey_id = record.next_prekey_id.wrapping_add(count);
                for key in keys {
                    record.unpublished.push(key.id);
                    record.one_time_prekeys.insert(key.id, key);
                }
                save_json(self.storage.as_ref(), ACCOUNT_KEY, &*record).await?;
            } else {
                debug!(
                    pending = record.unpublished.len(),
                    "republishing unconfirmed prekeys"
                );
            }
            record.upload(&self.user)?
        };

        let published = self.publish(upload).await?;
        info!(user = %self.user, published, "replenished one-time prekeys");
        Ok(published)
    }

    /// Replace the signed prekey, keeping the most recent ones for
    /// handshakes already in flight. Returns the new id.
    pub async fn rotate_signed_prekey(&self) -> Result<u32> {
        let (id, upload) = {
            let mut guard = self.loaded().await?;
            let record = guard.as_mut().ok_or(E2eeError::NotInitialized)?;

            let id = record.next_signed_prekey_id;
            let signed = SignedPrekey::generate(id, now_ms(), &record.identity());
            record.next_signed_prekey_id = id.wrapping_add(1);
            record.signed_prekeys.push(signed);
            let keep = self.config.signed_prekey_history + 1;
            if record.signed_prekeys.len() > keep {
                let excess = record.signed_prekeys.len() - keep;
                record.signed_prekeys.drain(..excess);
            }
            save_json(self.storage.as_ref(), ACCOUNT_KEY, &*record).await?;
            (id, record.upload(&self.user)?)
        };

        self.publish(upload).await?;
        info!(user = %self.user, signed_prekey = id, "rotated signed prekey");
        Ok(id)
    }

    /// Upload outside the account lock, then mark the carried one-time
    /// prekeys as published. Returns how many were carried.
    async fn publish(&self, upload: PrekeyUpload) -> Result<usize> {
        let ids: Vec<u32> = upload.one_time_prekeys.iter().map(|k| k.id).collect();
        bounded(
            self.config.claim_timeout(),
            "upload",
            self.directory.upload(upload),
        )
        .await?;

        let mut guard = self.loaded().await?;
        let record = guard.as_mut().ok_or(E2eeError::NotInitialized)?;
        record.unpublished.retain(|id| !ids.contains(id));
        save_json(self.storage.as_ref(), ACCOUNT_KEY, &*record).await?;
        Ok(ids.len())
    }

    /// Look up the keys named by a handshake without consuming anything.
    pub async fn responder_keys(
        &self,
        signed_prekey_id: u32,
        one_time_prekey_id: Option<u32>,
    ) -> Result<ResponderKeys> {
        let guard = self.loaded().await?;
        let record = guard.as_ref().ok_or(E2eeError::NotInitialized)?;

        let signed_prekey = record
            .signed_prekeys
            .iter()
            .find(|k| k.id == signed_prekey_id)
            .cloned()
            .ok_or(E2eeError::UnknownPrekey(signed_prekey_id))?;

        let one_time_prekey = match one_time_prekey_id {
            Some(id) => Some(
                record
                    .one_time_prekeys
                    .get(&id)
                    .cloned()
                    .ok_or(E2eeError::UnknownPrekey(id))?,
            ),
            None => None,
        };

        Ok(ResponderKeys {
            identity: record.identity(),
            signed_prekey,
            one_time_prekey,
        })
    }

    /// Retire a one-time prekey after it established a session.
    pub async fn consume_one_time_prekey(&self, id: u32) -> Result<()> {
        let mut guard = self.loaded().await?;
        let record = guard.as_mut().ok_or(E2eeError::NotInitialized)?;

        if record.one_time_prekeys.remove(&id).is_none() {
            return Err(E2eeError::UnknownPrekey(id));
        }
        record.unpublished.retain(|k| *k != id);
        save_json(self.storage.as_ref(), ACCOUNT_KEY, &*record).await?;
        debug!(prekey = id, remaining = record.one_time_prekeys.len(), "consumed one-time prekey");
        Ok(())
    }

    /// Destroy the identity and every prekey.
    pub async fn reset(&self) -> Result<()> {
        let mut guard = self.record.lock().await;
        self.storage.delete(ACCOUNT_KEY).await?;
        *guard = None;
        warn!(user = %self.user, "device identity destroyed");
        Ok(())
    }
}

fn encode_secret(secret: &IdentitySecret) -> String {
    let mut raw = Zeroizing::new(Vec::with_capacity(64));
    raw.extend_from_slice(&secret.agreement);
    raw.extend_from_slice(&secret.signing);
    URL_SAFE_NO_PAD.encode(raw.as_slice())
}
