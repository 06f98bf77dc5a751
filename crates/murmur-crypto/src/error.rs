//! Cryptographic error types.

use thiserror::Error;

/// Errors raised by key handling, agreement and session operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid device key: {0}")]
    InvalidDeviceKey(String),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("signature verification failed")]
    SignatureInvalid,

    /// Agreement produced an all-zero secret (low-order peer point).
    #[error("key agreement was not contributory")]
    NonContributory,

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: authentication tag mismatch")]
    Decryption,

    #[error("message belongs to session {actual}, expected {expected}")]
    SessionMismatch { expected: String, actual: String },

    #[error("message {0} already consumed")]
    Replay(u64),

    #[error("message {index} outside skip window (next expected {next})")]
    OutsideWindow { index: u64, next: u64 },

    #[error("handshake header missing from initial message")]
    MissingHandshake,

    #[error("signed prekey {0} not available")]
    UnknownSignedPrekey(u32),
}

impl CryptoError {
    /// True for failures caused by a replayed or out-of-window message.
    pub fn is_replay_or_too_old(&self) -> bool {
        matches!(self, Self::Replay(_) | Self::OutsideWindow { .. })
    }
}

/// Result alias for this crate.
pub type CryptoResult<T> = Result<T, CryptoError>;
