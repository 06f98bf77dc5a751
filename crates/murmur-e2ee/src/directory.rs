//! Key directory seam.
//!
//! The key distribution service is external and untrusted for
//! confidentiality: it only ever sees public key material. Claims must be
//! linearizable so that a one-time prekey is never handed out twice.

use crate::error::{E2eeError, Result};
use async_trait::async_trait;
use murmur_common::{ClaimedBundle, DeviceInfo, LowPrekeyNotice, PrekeyUpload, UserId};
use murmur_crypto::prekey::{PublicOneTimePrekey, PublicSignedPrekey};
use murmur_crypto::DeviceKey;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Publish (or extend) a device's key material.
    async fn upload(&self, upload: PrekeyUpload) -> Result<()>;

    async fn list_devices(&self, user: &UserId) -> Result<Vec<DeviceInfo>>;

    /// Claim a bundle for one device. The one-time prekey it carries, if
    /// any, is never returned again.
    async fn claim_prekey(&self, user: &UserId, device: &DeviceKey) -> Result<ClaimedBundle>;

    /// Number of one-time prekeys still published for a device.
    async fn prekey_count(&self, user: &UserId, device: &DeviceKey) -> Result<usize>;

    /// Push channel for low-count notices.
    fn subscribe_low_count(&self) -> broadcast::Receiver<LowPrekeyNotice>;
}

/// Run a directory call under the configured timeout.
pub(crate) async fn bounded<T, F>(timeout: Duration, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(E2eeError::DirectoryUnavailable(format!(
            "{op} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

struct DeviceRecord {
    signing_key: [u8; 32],
    signed_prekey: PublicSignedPrekey,
    one_time: BTreeMap<u32, PublicOneTimePrekey>,
}

/// Reference directory held in memory.
///
/// Every operation runs under a single mutex, which makes claims
/// linearizable. Fault injection hooks let tests simulate outages.
pub struct InMemoryKeyDirectory {
    users: Mutex<HashMap<UserId, BTreeMap<DeviceKey, DeviceRecord>>>,
    low_tx: broadcast::Sender<LowPrekeyNotice>,
    low_threshold: usize,
    offline: AtomicBool,
    failing_uploads: AtomicU32,
    delay: Mutex<Option<Duration>>,
    unclaimable: Mutex<HashSet<DeviceKey>>,
}

impl Default for InMemoryKeyDirectory {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_LOW_WATERMARK)
    }
}

impl InMemoryKeyDirectory {
    pub fn new(low_threshold: usize) -> Self {
        let (low_tx, _) = broadcast::channel(64);
        Self {
            users: Mutex::new(HashMap::new()),
            low_tx,
            low_threshold,
            offline: AtomicBool::new(false),
            failing_uploads: AtomicU32::new(0),
            delay: Mutex::new(None),
            unclaimable: Mutex::new(HashSet::new()),
        }
    }

    /// Make every call fail with `DirectoryUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` uploads.
    pub fn fail_next_uploads(&self, count: u32) {
        self.failing_uploads.store(count, Ordering::SeqCst);
    }

    /// Delay every call, to exercise caller timeouts.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().await = delay;
    }

    /// Make claims for a listed device fail as if it had no bundle.
    pub async fn block_claims(&self, device: &DeviceKey) {
        self.unclaimable.lock().await.insert(device.clone());
    }

    /// Remove a device, as if it had been deregistered.
    pub async fn remove_device(&self, user: &UserId, device: &DeviceKey) {
        if let Some(devices) = self.users.lock().await.get_mut(user) {
            devices.remove(device);
        }
    }

    /// Drop all published one-time prekeys of a device.
    pub async fn drain_one_time(&self, user: &UserId, device: &DeviceKey) {
        if let Some(record) = self
            .users
            .lock()
            .await
            .get_mut(user)
            .and_then(|devices| devices.get_mut(device))
        {
            record.one_time.clear();
        }
    }

    async fn gate(&self) -> Result<()> {
        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(E2eeError::DirectoryUnavailable("directory offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyDirectory for InMemoryKeyDirectory {
    async fn upload(&self, upload: PrekeyUpload) -> Result<()> {
        self.gate().await?;
        let failing = self.failing_uploads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_uploads.store(failing - 1, Ordering::SeqCst);
            return Err(E2eeError::DirectoryUnavailable("upload rejected".into()));
        }

        upload
            .signed_prekey
            .verify(&upload.signing_key)
            .map_err(|_| E2eeError::InvalidBundle("signed prekey signature".into()))?;

        let mut users = self.users.lock().await;
        let devices = users.entry(upload.user.clone()).or_default();

        match devices.get_mut(&upload.device_key) {
            Some(record) => {
                if record.signing_key != upload.signing_key {
                    return Err(E2eeError::InvalidBundle(
                        "device is registered under a different signing key".into(),
                    ));
                }
                record.signed_prekey = upload.signed_prekey;
                for key in upload.one_time_prekeys {
                    record.one_time.entry(key.id).or_insert(key);
                }
                debug!(
                    user = %upload.user,
                    device = %upload.device_key,
                    published = record.one_time.len(),
                    "prekeys updated"
                );
            }
            None => {
                let one_time = upload
                    .one_time_prekeys
                    .into_iter()
                    .map(|k| (k.id, k))
                    .collect::<BTreeMap<_, _>>();
                info!(
                    user = %upload.user,
                    device = %upload.device_key,
                    published = one_time.len(),
                    "device registered"
                );
                devices.insert(
                    upload.device_key,
                    DeviceRecord {
                        signing_key: upload.signing_key,
                        signed_prekey: upload.signed_prekey,
                        one_time,
                    },
                );
            }
        }
        Ok(())
    }

    async fn list_devices(&self, user: &UserId) -> Result<Vec<DeviceInfo>> {
        self.gate().await?;
        let users = self.users.lock().await;
        Ok(users
            .get(user)
            .map(|devices| {
                devices
                    .iter()
                    .map(|(key, record)| DeviceInfo {
                        device_key: key.clone(),
                        signing_key: record.signing_key,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn claim_prekey(&self, user: &UserId, device: &DeviceKey) -> Result<ClaimedBundle> {
        self.gate().await?;
        if self.unclaimable.lock().await.contains(device) {
            return Err(E2eeError::ClaimExhausted(device.clone()));
        }
        let mut users = self.users.lock().await;
        let record = users
            .get_mut(user)
            .and_then(|devices| devices.get_mut(device))
            .ok_or_else(|| E2eeError::ClaimExhausted(device.clone()))?;

        let one_time_prekey = record.one_time.pop_first().map(|(_, key)| key);
        let remaining = record.one_time.len();

        if remaining < self.low_threshold {
            let _ = self.low_tx.send(LowPrekeyNotice {
                user: user.clone(),
                device_key: device.clone(),
                remaining,
            });
        }

        Ok(ClaimedBundle {
            device_key: device.clone(),
            signing_key: record.signing_key,
            signed_prekey: record.signed_prekey.clone(),
            one_time_prekey,
        })
    }

    async fn prekey_count(&self, user: &UserId, device: &DeviceKey) -> Result<usize> {
        self.gate().await?;
        let users = self.users.lock().await;
        Ok(users
            .get(user)
            .and_then(|devices| devices.get(device))
            .map(|record| record.one_time.len())
            .unwrap_or(0))
    }

    fn subscribe_low_count(&self) -> broadcast::Receiver<LowPrekeyNotice> {
        self.low_tx.subscribe()
    }
}
