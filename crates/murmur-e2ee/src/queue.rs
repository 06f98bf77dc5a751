//! Undecryptable queue.
//!
//! Continuation messages that arrive before their session exists are
//! parked here, grouped by sender device, until an initial message from
//! that device establishes the session. Entries are retried in receipt
//! order and dropped after too many failed retries or when they expire.

use crate::config::E2eeConfig;
use crate::error::Result;
use crate::storage::{load_json, save_json, SecureStorage};
use murmur_common::UserId;
use murmur_crypto::DeviceKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INDEX_KEY: &str = "undecryptable:index";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndecryptableEntry {
    pub message_id: Uuid,
    pub sender_user: UserId,
    pub sender_device: DeviceKey,
    /// Raw per-device ciphertext from the envelope.
    pub ciphertext: Vec<u8>,
    pub received_at_ms: u64,
    pub retry_count: u32,
}

impl UndecryptableEntry {
    pub fn new(
        message_id: Uuid,
        sender_user: UserId,
        sender_device: DeviceKey,
        ciphertext: Vec<u8>,
        received_at_ms: u64,
    ) -> Self {
        Self {
            message_id,
            sender_user,
            sender_device,
            ciphertext,
            received_at_ms,
            retry_count: 0,
        }
    }
}

/// What happened to an entry after a failed retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Kept { retry_count: u32 },
    Discarded,
    Missing,
}

type Groups = BTreeMap<DeviceKey, Vec<UndecryptableEntry>>;

pub struct UndecryptableQueue {
    storage: Arc<dyn SecureStorage>,
    max_retries: u32,
    ttl_ms: u64,
    groups: Mutex<Option<Groups>>,
}

impl UndecryptableQueue {
    pub fn new(storage: Arc<dyn SecureStorage>, config: &E2eeConfig) -> Self {
        Self {
            storage,
            max_retries: config.queue_max_retries,
            ttl_ms: config.queue_ttl_ms(),
            groups: Mutex::new(None),
        }
    }

    fn group_key(device: &DeviceKey) -> String {
        format!("undecryptable:{device}")
    }

    async fn loaded<'a>(&self, groups: &'a mut Option<Groups>) -> Result<&'a mut Groups> {
        if groups.is_none() {
            let index: BTreeSet<DeviceKey> = load_json(self.storage.as_ref(), INDEX_KEY)
                .await?
                .unwrap_or_default();
            let mut loaded = Groups::new();
            for device in index {
                let entries: Vec<UndecryptableEntry> =
                    load_json(self.storage.as_ref(), &Self::group_key(&device))
                        .await?
                        .unwrap_or_default();
                if !entries.is_empty() {
                    loaded.insert(device, entries);
                }
            }
            *groups = Some(loaded);
        }
        Ok(groups.get_or_insert_with(Groups::new))
    }

    async fn persist_group(&self, groups: &mut Groups, device: &DeviceKey) -> Result<()> {
        let key = Self::group_key(device);
        match groups.get(device) {
            Some(entries) if !entries.is_empty() => {
                save_json(self.storage.as_ref(), &key, entries).await?;
            }
            _ => {
                groups.remove(device);
                self.storage.delete(&key).await?;
            }
        }

        let index: BTreeSet<&DeviceKey> = groups.keys().collect();
        save_json(self.storage.as_ref(), INDEX_KEY, &index).await
    }

    /// Park an entry. Duplicate deliveries of the same message are ignored.
    pub async fn push(&self, entry: UndecryptableEntry) -> Result<bool> {
        let mut guard = self.groups.lock().await;
        let groups = self.loaded(&mut guard).await?;
        let device = entry.sender_device.clone();
        let group = groups.entry(device.clone()).or_default();

        if group.iter().any(|e| e.message_id == entry.message_id) {
            debug!(message = %entry.message_id, "undecryptable entry already queued");
            return Ok(false);
        }
        debug!(message = %entry.message_id, sender = %device, "queued undecryptable message");
        group.push(entry);
        self.persist_group(groups, &device).await?;
        Ok(true)
    }

    /// Live entries for a sender device, oldest first. Expired ones are dropped.
    pub async fn entries_for(&self, device: &DeviceKey, now_ms: u64) -> Result<Vec<UndecryptableEntry>> {
        let mut guard = self.groups.lock().await;
        let groups = self.loaded(&mut guard).await?;
        let Some(group) = groups.get_mut(device) else {
            return Ok(Vec::new());
        };

        let before = group.len();
        let ttl = self.ttl_ms;
        group.retain(|e| !is_expired(e, now_ms, ttl));
        let live = group.clone();
        if group.len() != before {
            info!(sender = %device, expired = before - group.len(), "dropped expired undecryptable messages");
            self.persist_group(groups, device).await?;
        }
        Ok(live)
    }

    /// Remove an entry after it decrypted (or can never decrypt).
    pub async fn resolve(&self, device: &DeviceKey, message_id: Uuid) -> Result<bool> {
        let mut guard = self.groups.lock().await;
        let groups = self.loaded(&mut guard).await?;
        let Some(group) = groups.get_mut(device) else {
            return Ok(false);
        };
        let before = group.len();
        group.retain(|e| e.message_id != message_id);
        if group.len() == before {
            return Ok(false);
        }
        self.persist_group(groups, device).await?;
        Ok(true)
    }

    /// Count a failed retry, discarding the entry once it has used them all.
    pub async fn record_failure(&self, device: &DeviceKey, message_id: Uuid) -> Result<FailureOutcome> {
        let mut guard = self.groups.lock().await;
        let groups = self.loaded(&mut guard).await?;
        let Some(group) = groups.get_mut(device) else {
            return Ok(FailureOutcome::Missing);
        };
        let Some(pos) = group.iter().position(|e| e.message_id == message_id) else {
            return Ok(FailureOutcome::Missing);
        };

        group[pos].retry_count += 1;
        let retry_count = group[pos].retry_count;
        let outcome = if retry_count >= self.max_retries {
            group.remove(pos);
            warn!(message = %message_id, sender = %device, retry_count, "discarding undecryptable message");
            FailureOutcome::Discarded
        } else {
            FailureOutcome::Kept { retry_count }
        };
        self.persist_group(groups, device).await?;
        Ok(outcome)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self, now_ms: u64) -> Result<usize> {
        let mut guard = self.groups.lock().await;
        let groups = self.loaded(&mut guard).await?;
        let ttl = self.ttl_ms;

        let mut removed = 0;
        let mut touched = Vec::new();
        for (device, group) in groups.iter_mut() {
            let before = group.len();
            group.retain(|e| !is_expired(e, now_ms, ttl));
            if group.len() != before {
                removed += before - group.len();
                touched.push(device.clone());
            }
        }
        for device in touched {
            self.persist_group(groups, &device).await?;
        }
        if removed > 0 {
            info!(removed, "purged expired undecryptable messages");
        }
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize> {
        let mut guard = self.groups.lock().await;
        let groups = self.loaded(&mut guard).await?;
        Ok(groups.values().map(Vec::len).sum())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drop everything, persisted state included.
    pub async fn clear(&self) -> Result<()> {
        let mut guard = self.groups.lock().await;
        let groups = self.loaded(&mut guard).await?;
        for device in groups.keys() {
            self.storage.delete(&Self::group_key(device)).await?;
        }
        self.storage.delete(INDEX_KEY).await?;
        *guard = Some(Groups::new());
        Ok(())
    }
}

fn is_expired(entry: &UndecryptableEntry, now_ms: u64, ttl_ms: u64) -> bool {
    now_ms.saturating_sub(entry.received_at_ms) > ttl_ms
}
