#![allow(dead_code)]

use async_trait::async_trait;
use murmur_common::{InboundMessage, UserId, WireEnvelope};
use murmur_crypto::DeviceKey;
use murmur_e2ee::{
    AutoAcknowledge, E2eeClient, E2eeConfig, E2eeError, InMemoryKeyDirectory, KeyDirectory,
    MemoryStorage, SecureStorage,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub struct Device {
    pub user: UserId,
    pub client: E2eeClient,
    pub key: DeviceKey,
    pub storage: Arc<FlakyStorage>,
}

pub fn test_config() -> E2eeConfig {
    E2eeConfig {
        initial_prekey_count: 20,
        upload_backoff_ms: 1,
        ..Default::default()
    }
}

pub async fn device(directory: &Arc<InMemoryKeyDirectory>, user: &str) -> Device {
    device_with_config(directory, user, test_config()).await
}

pub async fn device_with_config(
    directory: &Arc<InMemoryKeyDirectory>,
    user: &str,
    config: E2eeConfig,
) -> Device {
    device_on(directory.clone(), user, config).await
}

/// A device talking to an arbitrary directory implementation.
pub async fn device_on(directory: Arc<dyn KeyDirectory>, user: &str, config: E2eeConfig) -> Device {
    let storage = Arc::new(FlakyStorage::default());
    let user = UserId::from(user);
    let client = E2eeClient::new(user.clone(), storage.clone(), directory, config).unwrap();
    let key = client.initialize(&AutoAcknowledge).await.unwrap();
    Device {
        user,
        client,
        key,
        storage,
    }
}

/// Wrap an envelope the way the transport would deliver it.
pub fn inbound(from: &Device, envelope: &WireEnvelope) -> InboundMessage {
    InboundMessage {
        message_id: Uuid::new_v4(),
        sender_user: from.user.clone(),
        envelope: envelope.clone(),
    }
}

/// Memory storage whose writes can be made to fail.
#[derive(Default)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    fail_writes: AtomicBool,
}

impl FlakyStorage {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SecureStorage for FlakyStorage {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, E2eeError> {
        self.inner.load(key).await
    }

    async fn save(&self, key: &str, value: &[u8]) -> Result<(), E2eeError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(E2eeError::storage("disk full"));
        }
        self.inner.save(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), E2eeError> {
        self.inner.delete(key).await
    }
}
