//! Engine error type.

use murmur_crypto::{CryptoError, DeviceKey};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, E2eeError>;

#[derive(Debug, Error)]
pub enum E2eeError {
    /// The directory had no bundle to hand out for this device.
    #[error("no prekey bundle available for device {0}")]
    ClaimExhausted(DeviceKey),

    /// Session state could not be persisted; the session needs a manual reset.
    #[error("session with device {0} is desynchronized")]
    SessionDesync(DeviceKey),

    #[error("message replayed or outside the skip window")]
    ReplayOrTooOld,

    #[error("envelope has no entry for this device")]
    NotForThisDevice,

    /// Not a single recipient device could be encrypted to.
    #[error("send blocked: no recipient device could be encrypted to ({skipped} skipped)")]
    SendBlocked { skipped: usize },

    #[error("message queued until a session is established")]
    QueuedUndecryptable,

    #[error("key directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("message belongs to a superseded session")]
    StaleSession,

    #[error("initialization failed: {0}")]
    InitializationError(String),

    #[error("recovery backup was not acknowledged")]
    BackupNotAcknowledged,

    #[error("account is not initialized")]
    NotInitialized,

    #[error("invalid prekey bundle: {0}")]
    InvalidBundle(String),

    #[error("unknown prekey {0}")]
    UnknownPrekey(u32),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(CryptoError),
}

impl E2eeError {
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        Self::Storage(msg.to_string())
    }

    pub fn malformed(msg: impl std::fmt::Display) -> Self {
        Self::Malformed(msg.to_string())
    }

    /// True for failures that only affect one recipient device during fan-out.
    ///
    /// Only problems with this device's own account stop a send outright.
    pub fn is_per_device(&self) -> bool {
        !matches!(
            self,
            Self::NotInitialized
                | Self::BackupNotAcknowledged
                | Self::InitializationError(_)
                | Self::Config(_)
        )
    }
}

impl From<CryptoError> for E2eeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Replay(_) | CryptoError::OutsideWindow { .. } => Self::ReplayOrTooOld,
            CryptoError::SignatureInvalid => Self::InvalidBundle(err.to_string()),
            CryptoError::UnknownSignedPrekey(id) => Self::UnknownPrekey(id),
            other => Self::Crypto(other),
        }
    }
}

impl From<murmur_common::Error> for E2eeError {
    fn from(err: murmur_common::Error) -> Self {
        match err {
            murmur_common::Error::Crypto(e) => e.into(),
            murmur_common::Error::Io(e) => Self::storage(e),
            murmur_common::Error::Config(msg) => Self::Config(msg),
            other => Self::malformed(other),
        }
    }
}

impl From<bincode::Error> for E2eeError {
    fn from(err: bincode::Error) -> Self {
        Self::malformed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_errors_collapse() {
        assert!(matches!(
            E2eeError::from(CryptoError::Replay(4)),
            E2eeError::ReplayOrTooOld
        ));
        assert!(matches!(
            E2eeError::from(CryptoError::OutsideWindow { index: 9, next: 0 }),
            E2eeError::ReplayOrTooOld
        ));
    }

    #[test]
    fn test_bad_signature_is_invalid_bundle() {
        assert!(matches!(
            E2eeError::from(CryptoError::SignatureInvalid),
            E2eeError::InvalidBundle(_)
        ));
    }

    #[test]
    fn test_per_device_classification() {
        let device = DeviceKey::from_bytes(&[1; 32]);
        assert!(E2eeError::ClaimExhausted(device).is_per_device());
        assert!(E2eeError::DirectoryUnavailable("timeout".into()).is_per_device());
        assert!(E2eeError::Crypto(CryptoError::NonContributory).is_per_device());
        assert!(E2eeError::storage("disk full").is_per_device());
        assert!(!E2eeError::NotInitialized.is_per_device());
    }
}
