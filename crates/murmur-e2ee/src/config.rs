//! Engine configuration.

use crate::error::{E2eeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default size of the published one-time prekey pool.
pub const DEFAULT_PREKEY_POOL: u32 = 50;
/// Published count below which the pool is replenished.
pub const DEFAULT_LOW_WATERMARK: usize = 10;
/// Periodic prekey count check.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 24 * 60 * 60;
/// Upper bound on every key directory call.
pub const DEFAULT_CLAIM_TIMEOUT_MS: u64 = 10_000;
/// Undecryptable entries expire after 30 days.
pub const DEFAULT_QUEUE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct E2eeConfig {
    /// One-time prekeys generated on first initialization.
    pub initial_prekey_count: u32,
    /// One-time prekeys generated per replenish.
    pub replenish_batch: u32,
    pub low_watermark: usize,
    pub poll_interval_secs: u64,
    pub claim_timeout_ms: u64,
    /// Upload attempts before initialization gives up.
    pub upload_attempts: u32,
    pub upload_backoff_ms: u64,
    /// How far ahead of the receiving chain a message may be.
    pub max_skip: u64,
    /// Parked out-of-order keys per session.
    pub max_skipped_keys: usize,
    pub queue_max_retries: u32,
    pub queue_ttl_secs: u64,
    /// Previous signed prekeys kept after rotation.
    pub signed_prekey_history: usize,
    /// Also encrypt outgoing messages to the sender's other devices.
    pub fan_out_to_own_devices: bool,
}

impl Default for E2eeConfig {
    fn default() -> Self {
        Self {
            initial_prekey_count: DEFAULT_PREKEY_POOL,
            replenish_batch: DEFAULT_PREKEY_POOL,
            low_watermark: DEFAULT_LOW_WATERMARK,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            claim_timeout_ms: DEFAULT_CLAIM_TIMEOUT_MS,
            upload_attempts: 3,
            upload_backoff_ms: 250,
            max_skip: 1000,
            max_skipped_keys: 1000,
            queue_max_retries: 3,
            queue_ttl_secs: DEFAULT_QUEUE_TTL_SECS,
            signed_prekey_history: 3,
            fan_out_to_own_devices: true,
        }
    }
}

impl E2eeConfig {
    /// Load configuration from a JSON file; missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)
            .map_err(|e| E2eeError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_slice(&raw)
            .map_err(|e| E2eeError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload_attempts == 0 {
            return Err(E2eeError::Config("upload_attempts must be at least 1".into()));
        }
        if self.max_skipped_keys == 0 {
            return Err(E2eeError::Config("max_skipped_keys must be at least 1".into()));
        }
        if self.claim_timeout_ms == 0 {
            return Err(E2eeError::Config("claim_timeout_ms must be positive".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(E2eeError::Config("poll_interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn queue_ttl_ms(&self) -> u64 {
        self.queue_ttl_secs.saturating_mul(1000)
    }
}
