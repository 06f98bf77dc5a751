//! Fan-out encryption: one plaintext, one ciphertext per recipient device.
//!
//! Devices are encrypted to concurrently. A device that cannot be reached
//! (no bundle, directory outage, bad signature) is left out of the
//! envelope and reported; the send only fails when no device at all could
//! be encrypted to. There is no unencrypted fallback.

use crate::account::PrekeyManager;
use crate::config::E2eeConfig;
use crate::directory::{bounded, KeyDirectory};
use crate::error::{E2eeError, Result};
use crate::establish::Establisher;
use crate::store::SessionKey;
use crate::wire;
use futures_util::future::join_all;
use murmur_common::{DeviceInfo, EnvelopeEntry, UserId, WireEnvelope};
use murmur_crypto::{DeviceKey, IdentityKeypair};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A recipient device (or whole user) left out of an envelope.
#[derive(Debug)]
pub struct SkippedDevice {
    pub user: UserId,
    /// `None` when the user's device list itself could not be fetched.
    pub device: Option<DeviceKey>,
    pub reason: E2eeError,
}

#[derive(Debug)]
pub struct FanOutReport {
    pub envelope: WireEnvelope,
    pub skipped: Vec<SkippedDevice>,
}

pub struct FanOutEncryptor {
    account: Arc<PrekeyManager>,
    directory: Arc<dyn KeyDirectory>,
    establisher: Arc<Establisher>,
    config: E2eeConfig,
}

impl FanOutEncryptor {
    pub fn new(
        account: Arc<PrekeyManager>,
        directory: Arc<dyn KeyDirectory>,
        establisher: Arc<Establisher>,
        config: E2eeConfig,
    ) -> Self {
        Self {
            account,
            directory,
            establisher,
            config,
        }
    }

    /// Encrypt `plaintext` for every device of `recipients`.
    pub async fn encrypt(&self, plaintext: &[u8], recipients: &[UserId]) -> Result<FanOutReport> {
        let identity = self.account.identity().await?;
        let own_device = identity.device_key();
        let own_user = self.account.user().clone();

        let mut users: BTreeSet<UserId> = recipients.iter().cloned().collect();
        if self.config.fan_out_to_own_devices {
            users.insert(own_user.clone());
        }

        let mut skipped = Vec::new();
        let mut targets = Vec::new();
        for user in users {
            match self.devices_of(&user).await {
                Ok(devices) => targets.extend(
                    devices
                        .into_iter()
                        .filter(|d| d.device_key != own_device)
                        .map(|d| SessionKey::new(user.clone(), d.device_key)),
                ),
                // Our own device list is best effort.
                Err(e) if user == own_user && !recipients.contains(&own_user) => {
                    debug!(error = %e, "could not list own devices");
                }
                Err(e) => {
                    warn!(user = %user, error = %e, "could not list recipient devices");
                    skipped.push(SkippedDevice {
                        user,
                        device: None,
                        reason: e,
                    });
                }
            }
        }

        let results = join_all(
            targets
                .iter()
                .map(|key| self.encrypt_for(&identity, key, plaintext)),
        )
        .await;

        let mut envelope = WireEnvelope::new(own_device);
        for (key, result) in targets.into_iter().zip(results) {
            match result {
                Ok(entry) => {
                    envelope.recipients.insert(key.device, entry);
                }
                Err(e) if e.is_per_device() => {
                    warn!(session = %key, error = %e, "skipping recipient device");
                    skipped.push(SkippedDevice {
                        user: key.user,
                        device: Some(key.device),
                        reason: e,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        if envelope.is_empty() {
            warn!(skipped = skipped.len(), "send blocked: no device encrypted");
            return Err(E2eeError::SendBlocked {
                skipped: skipped.len(),
            });
        }

        info!(
            devices = envelope.len(),
            skipped = skipped.len(),
            "message encrypted"
        );
        Ok(FanOutReport { envelope, skipped })
    }

    async fn devices_of(&self, user: &UserId) -> Result<Vec<DeviceInfo>> {
        bounded(
            self.config.claim_timeout(),
            "list_devices",
            self.directory.list_devices(user),
        )
        .await
    }

    async fn encrypt_for(
        &self,
        identity: &IdentityKeypair,
        key: &SessionKey,
        plaintext: &[u8],
    ) -> Result<EnvelopeEntry> {
        let store = self.establisher.store();
        let mut locked = store.lock(key).await?;
        self.establisher.ensure_outbound(identity, &mut locked).await?;

        let mut record = locked
            .usable()?
            .cloned()
            .ok_or_else(|| E2eeError::SessionDesync(key.device.clone()))?;
        let message = record.session.encrypt(plaintext)?;
        let entry = wire::encode_entry(&message)?;

        store.commit(&mut locked, record).await?;
        Ok(entry)
    }
}
