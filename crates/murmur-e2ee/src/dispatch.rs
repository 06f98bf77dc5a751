//! Decryption dispatcher.
//!
//! Routes this device's entry of an incoming envelope:
//! - no entry: `NotForThisDevice`, dropped silently
//! - `initial`: inbound establishment, then decryption, then a retry of
//!   anything queued from that sender device; recovered messages are
//!   returned alongside the one that unlocked them
//! - `continuation`: decryption under the current session, or parked in
//!   the undecryptable queue when there is no session for it yet

use crate::account::PrekeyManager;
use crate::error::{E2eeError, Result};
use crate::establish::Establisher;
use crate::queue::{FailureOutcome, UndecryptableEntry, UndecryptableQueue};
use crate::store::{LockedSlot, SessionKey, SessionState};
use crate::wire;
use murmur_common::helpers::now_ms;
use murmur_common::{EnvelopeKind, InboundMessage, UserId};
use murmur_crypto::{DeviceKey, RatchetMessage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A successfully decrypted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedMessage {
    pub message_id: Uuid,
    pub sender_user: UserId,
    pub sender_device: DeviceKey,
    pub plaintext: Vec<u8>,
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Plaintext(DecryptedMessage),
    /// An initial message whose session also unlocked earlier queued
    /// messages from the same device, in receipt order.
    Recovered {
        message: DecryptedMessage,
        recovered: Vec<DecryptedMessage>,
    },
    /// Parked until a session with the sender device exists.
    Queued,
    NotForThisDevice,
    ReplayOrTooOld,
}

impl Inbound {
    /// Every plaintext this result carries, oldest first.
    pub fn into_messages(self) -> Vec<DecryptedMessage> {
        match self {
            Self::Plaintext(message) => vec![message],
            Self::Recovered { message, mut recovered } => {
                recovered.push(message);
                recovered
            }
            _ => Vec::new(),
        }
    }
}

pub struct Dispatcher {
    account: Arc<PrekeyManager>,
    establisher: Arc<Establisher>,
    queue: Arc<UndecryptableQueue>,
}

impl Dispatcher {
    pub fn new(
        account: Arc<PrekeyManager>,
        establisher: Arc<Establisher>,
        queue: Arc<UndecryptableQueue>,
    ) -> Self {
        Self {
            account,
            establisher,
            queue,
        }
    }

    pub async fn dispatch(&self, inbound: &InboundMessage) -> Result<Inbound> {
        let own_device = self.account.device_key().await?;
        let envelope = &inbound.envelope;

        let Some(entry) = envelope.entry_for(&own_device) else {
            debug!(message = %inbound.message_id, "envelope not addressed to this device");
            return Ok(Inbound::NotForThisDevice);
        };

        let key = SessionKey::new(
            inbound.sender_user.clone(),
            envelope.sender_device_key.clone(),
        );
        let message = wire::decode_message(&entry.ciphertext)?;
        if (entry.kind == EnvelopeKind::Initial) != message.is_initial() {
            return Err(E2eeError::malformed("envelope tag does not match ciphertext"));
        }

        match self.decrypt(&key, &message).await {
            Ok((plaintext, established)) => {
                let recovered = if established {
                    self.retry_queued(&key.device).await.unwrap_or_else(|e| {
                        warn!(session = %key, error = %e, "retrying queued messages failed");
                        Vec::new()
                    })
                } else {
                    Vec::new()
                };
                let message = DecryptedMessage {
                    message_id: inbound.message_id,
                    sender_user: key.user,
                    sender_device: key.device,
                    plaintext,
                };
                if recovered.is_empty() {
                    Ok(Inbound::Plaintext(message))
                } else {
                    Ok(Inbound::Recovered { message, recovered })
                }
            }
            Err(E2eeError::QueuedUndecryptable) => {
                let queued = UndecryptableEntry::new(
                    inbound.message_id,
                    key.user.clone(),
                    key.device.clone(),
                    entry.ciphertext.clone(),
                    now_ms(),
                );
                self.queue.push(queued).await?;
                info!(session = %key, message = %inbound.message_id, "message queued until session exists");
                Ok(Inbound::Queued)
            }
            Err(E2eeError::ReplayOrTooOld) => {
                debug!(session = %key, message = %inbound.message_id, "replayed or too old");
                Ok(Inbound::ReplayOrTooOld)
            }
            Err(e) => Err(e),
        }
    }

    /// Decrypt one message; the flag reports whether an inbound session was
    /// established by it.
    async fn decrypt(&self, key: &SessionKey, message: &RatchetMessage) -> Result<(Vec<u8>, bool)> {
        let store = self.establisher.store();
        let mut locked = store.lock(key).await?;

        match locked.state.status_of(&message.session_id) {
            SessionState::Established => {
                let plaintext = self.decrypt_existing(&mut locked, message).await?;
                Ok((plaintext, false))
            }
            SessionState::Superseded => {
                warn!(session = %key, id = %message.session_id, "message for superseded session");
                Err(E2eeError::StaleSession)
            }
            _ if message.is_initial() => {
                let plaintext = self.establisher.accept_initial(&mut locked, message).await?;
                Ok((plaintext, true))
            }
            _ => Err(E2eeError::QueuedUndecryptable),
        }
    }

    async fn decrypt_existing(
        &self,
        locked: &mut LockedSlot,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>> {
        let mut record = locked
            .usable()?
            .cloned()
            .ok_or(E2eeError::QueuedUndecryptable)?;
        let plaintext = record
            .session_mut(&message.session_id)
            .ok_or(E2eeError::QueuedUndecryptable)?
            .decrypt(message)?;
        self.establisher.store().commit(locked, record).await?;
        Ok(plaintext)
    }

    /// Retry queued entries from `device` in receipt order, returning the
    /// ones that now decrypt.
    ///
    /// An entry leaves the queue only once its plaintext is in the
    /// returned list or it can never decrypt.
    async fn retry_queued(&self, device: &DeviceKey) -> Result<Vec<DecryptedMessage>> {
        let entries = self.queue.entries_for(device, now_ms()).await?;
        let mut recovered = Vec::new();
        if entries.is_empty() {
            return Ok(recovered);
        }
        debug!(sender = %device, count = entries.len(), "retrying queued messages");

        for entry in entries {
            let key = SessionKey::new(entry.sender_user.clone(), entry.sender_device.clone());
            let attempt = match wire::decode_message(&entry.ciphertext) {
                Ok(message) => self.decrypt(&key, &message).await.map(|(p, _)| p),
                Err(e) => Err(e),
            };

            match attempt {
                Ok(plaintext) => {
                    info!(session = %key, message = %entry.message_id, "queued message decrypted");
                    self.resolve(device, entry.message_id).await;
                    recovered.push(DecryptedMessage {
                        message_id: entry.message_id,
                        sender_user: entry.sender_user,
                        sender_device: entry.sender_device,
                        plaintext,
                    });
                }
                Err(E2eeError::SessionDesync(d)) => {
                    warn!(session = %key, "session desynced while retrying queue");
                    debug!(detail = %d, "remaining entries stay queued");
                    break;
                }
                Err(E2eeError::ReplayOrTooOld) | Err(E2eeError::Malformed(_)) => {
                    self.resolve(device, entry.message_id).await;
                }
                Err(e) => match self.queue.record_failure(device, entry.message_id).await {
                    Ok(FailureOutcome::Discarded) => {
                        warn!(session = %key, message = %entry.message_id, error = %e, "gave up on queued message");
                    }
                    Ok(outcome) => {
                        debug!(message = %entry.message_id, error = %e, ?outcome, "queued message still undecryptable");
                    }
                    Err(store_err) => {
                        warn!(message = %entry.message_id, error = %store_err, "failed to record queue retry");
                    }
                },
            }
        }
        Ok(recovered)
    }

    async fn resolve(&self, device: &DeviceKey, message_id: Uuid) {
        if let Err(e) = self.queue.resolve(device, message_id).await {
            warn!(message = %message_id, error = %e, "failed to drop resolved queue entry");
        }
    }
}
