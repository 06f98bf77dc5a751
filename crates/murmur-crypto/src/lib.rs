//! Cryptographic primitives for Murmur.
//!
//! This crate provides:
//! - X25519/Ed25519 device identity keys and device keys
//! - Signed and one-time prekeys
//! - Asynchronous (X3DH-style) key agreement against a published prekey bundle
//! - Chain-ratchet sessions with a bounded out-of-order skip window
//!
//! # Design
//!
//! Session bootstrap never needs the peer to be online: the initiator
//! claims one of the peer's published prekeys, derives a root key and
//! attaches a handshake header to its first message. Every message after
//! that is encrypted with a fresh key from a one-way chain, so a
//! compromised chain key never exposes earlier messages.
//!
//! Message keys are indexed explicitly, which lets the receiver decrypt
//! messages that arrive out of order as long as they fall inside the
//! skip window.

#![forbid(unsafe_code)]

pub mod agreement;
pub mod cipher;
pub mod error;
pub mod identity;
pub mod prekey;
pub mod session;
pub mod skip_window;

pub use agreement::{HandshakeHeader, PrekeyBundle, SessionId};
pub use error::{CryptoError, CryptoResult};
pub use identity::{DeviceKey, IdentityKeypair, IdentitySecret};
pub use prekey::{OneTimePrekey, PublicOneTimePrekey, PublicSignedPrekey, SignedPrekey};
pub use session::{RatchetMessage, RatchetSession, Role};
pub use skip_window::SkipWindow;
