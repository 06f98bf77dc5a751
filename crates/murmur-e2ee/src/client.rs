//! Engine facade used by the application layer.

use crate::account::{BackupAcknowledger, PrekeyManager};
use crate::config::E2eeConfig;
use crate::directory::KeyDirectory;
use crate::dispatch::{Dispatcher, Inbound};
use crate::error::Result;
use crate::establish::Establisher;
use crate::fanout::{FanOutEncryptor, FanOutReport};
use crate::monitor::{MonitorHandle, PrekeyMonitor};
use crate::queue::UndecryptableQueue;
use crate::storage::SecureStorage;
use crate::store::{SessionKey, SessionState, SessionStore};
use murmur_common::helpers::now_ms;
use murmur_common::{InboundMessage, UserId};
use murmur_crypto::DeviceKey;
use std::sync::Arc;
use tracing::{info, warn};

/// One device's end-to-end encryption engine.
pub struct E2eeClient {
    config: E2eeConfig,
    directory: Arc<dyn KeyDirectory>,
    account: Arc<PrekeyManager>,
    store: Arc<SessionStore>,
    queue: Arc<UndecryptableQueue>,
    fanout: FanOutEncryptor,
    dispatcher: Dispatcher,
}

impl E2eeClient {
    pub fn new(
        user: UserId,
        storage: Arc<dyn SecureStorage>,
        directory: Arc<dyn KeyDirectory>,
        config: E2eeConfig,
    ) -> Result<Self> {
        config.validate()?;

        let account = Arc::new(PrekeyManager::new(
            user,
            storage.clone(),
            directory.clone(),
            config.clone(),
        ));
        let store = Arc::new(SessionStore::new(storage.clone()));
        let queue = Arc::new(UndecryptableQueue::new(storage, &config));
        let establisher = Arc::new(Establisher::new(
            account.clone(),
            directory.clone(),
            store.clone(),
            config.clone(),
        ));
        let fanout = FanOutEncryptor::new(
            account.clone(),
            directory.clone(),
            establisher.clone(),
            config.clone(),
        );
        let dispatcher = Dispatcher::new(account.clone(), establisher, queue.clone());

        Ok(Self {
            config,
            directory,
            account,
            store,
            queue,
            fanout,
            dispatcher,
        })
    }

    pub fn user(&self) -> &UserId {
        self.account.user()
    }

    pub fn account(&self) -> &Arc<PrekeyManager> {
        &self.account
    }

    /// Create and publish the device identity on first use.
    pub async fn initialize(&self, acknowledger: &dyn BackupAcknowledger) -> Result<DeviceKey> {
        self.account.initialize(acknowledger).await
    }

    pub async fn device_key(&self) -> Result<DeviceKey> {
        self.account.device_key().await
    }

    /// Encrypt `plaintext` to every device of `recipients`.
    pub async fn send_encrypted(
        &self,
        plaintext: &[u8],
        recipients: &[UserId],
    ) -> Result<FanOutReport> {
        self.fanout.encrypt(plaintext, recipients).await
    }

    pub async fn handle_incoming(&self, message: &InboundMessage) -> Result<Inbound> {
        self.dispatcher.dispatch(message).await
    }

    pub async fn session_state(&self, user: &UserId, device: &DeviceKey) -> Result<SessionState> {
        self.store
            .state(&SessionKey::new(user.clone(), device.clone()))
            .await
    }

    /// Forget the session with one device; the next send starts a new one.
    pub async fn reset_session(&self, user: &UserId, device: &DeviceKey) -> Result<()> {
        self.store
            .reset(&SessionKey::new(user.clone(), device.clone()))
            .await
    }

    /// Destroy identity, prekeys, sessions and queued messages.
    pub async fn reset_device(&self) -> Result<()> {
        self.store.clear().await?;
        self.queue.clear().await?;
        self.account.reset().await?;
        warn!(user = %self.user(), "device reset");
        Ok(())
    }

    pub async fn queued_len(&self) -> Result<usize> {
        self.queue.len().await
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.queue.purge_expired(now_ms()).await
    }

    /// Start the background prekey replenishment monitor.
    pub fn spawn_prekey_monitor(&self) -> MonitorHandle {
        info!(
            interval_secs = self.config.poll_interval_secs,
            low_watermark = self.config.low_watermark,
            "starting prekey monitor"
        );
        PrekeyMonitor::new(self.account.clone(), self.config.clone())
            .spawn(self.directory.subscribe_low_count())
    }
}
