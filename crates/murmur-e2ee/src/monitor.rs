//! Prekey replenishment monitor.
//!
//! Keeps the published one-time prekey pool from running dry. Two triggers
//! lead to the same check: a low-count notice pushed by the directory for
//! this device, and a periodic poll. Either way the published count is
//! read and, when it is below the low watermark, a batch is replenished.

use crate::account::PrekeyManager;
use crate::config::E2eeConfig;
use crate::error::Result;
use murmur_common::LowPrekeyNotice;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct PrekeyMonitor {
    account: Arc<PrekeyManager>,
    config: E2eeConfig,
}

impl PrekeyMonitor {
    pub fn new(account: Arc<PrekeyManager>, config: E2eeConfig) -> Self {
        Self { account, config }
    }

    /// Run one check. Returns the number of prekeys published, if any.
    pub async fn check_once(&self) -> Result<Option<usize>> {
        let count = self.account.current_prekey_count().await?;
        if count >= self.config.low_watermark {
            debug!(count, "prekey pool healthy");
            return Ok(None);
        }

        info!(
            count,
            low_watermark = self.config.low_watermark,
            "prekey pool low; replenishing"
        );
        let published = self.account.replenish(self.config.replenish_batch).await?;
        Ok(Some(published))
    }

    async fn check_logged(&self) {
        if let Err(e) = self.check_once().await {
            warn!(error = %e, "prekey check failed");
        }
    }

    async fn is_for_us(&self, notice: &LowPrekeyNotice) -> bool {
        if notice.user != *self.account.user() {
            return false;
        }
        match self.account.device_key().await {
            Ok(device) => device == notice.device_key,
            Err(_) => false,
        }
    }

    /// Start the monitor on the current runtime.
    pub fn spawn(self, mut notices: broadcast::Receiver<LowPrekeyNotice>) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut poll = tokio::time::interval(self.config.poll_interval());
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut push_open = true;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = poll.tick() => self.check_logged().await,
                    notice = notices.recv(), if push_open => match notice {
                        Ok(notice) => {
                            if self.is_for_us(&notice).await {
                                debug!(remaining = notice.remaining, "low prekey notice");
                                self.check_logged().await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "missed low prekey notices");
                            self.check_logged().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("low prekey push channel closed; polling only");
                            push_open = false;
                        }
                    },
                }
            }
            debug!("prekey monitor stopped");
        });

        MonitorHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running [`PrekeyMonitor`].
pub struct MonitorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the monitor and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}
