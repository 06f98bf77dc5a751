//! Signed and one-time prekeys.
//!
//! A device publishes one signed prekey (rotated periodically) and a pool
//! of one-time prekeys. Each one-time prekey is handed out to at most one
//! initiator by the key directory and deleted locally after first use.

use crate::error::{CryptoError, CryptoResult};
use crate::identity::{verify_signature, IdentityKeypair};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

const SIGNED_PREKEY_CONTEXT: &[u8] = b"murmur-signed-prekey";

/// Private half of a one-time prekey.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct OneTimePrekey {
    #[zeroize(skip)]
    pub id: u32,
    secret: [u8; 32],
}

impl OneTimePrekey {
    pub fn generate(id: u32) -> Self {
        Self {
            id,
            secret: StaticSecret::random_from_rng(OsRng).to_bytes(),
        }
    }

    pub fn public(&self) -> PublicOneTimePrekey {
        PublicOneTimePrekey {
            id: self.id,
            key: *PublicKey::from(&self.static_secret()).as_bytes(),
        }
    }

    pub(crate) fn static_secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }
}

impl fmt::Debug for OneTimePrekey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneTimePrekey").field("id", &self.id).finish()
    }
}

/// Published half of a one-time prekey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicOneTimePrekey {
    pub id: u32,
    pub key: [u8; 32],
}

/// Generate `count` one-time prekeys with consecutive ids starting at `start_id`.
pub fn generate_one_time_prekeys(start_id: u32, count: u32) -> Vec<OneTimePrekey> {
    (0..count)
        .map(|i| OneTimePrekey::generate(start_id.wrapping_add(i)))
        .collect()
}

/// Private half of a signed prekey, plus the identity signature over its public half.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SignedPrekey {
    #[zeroize(skip)]
    pub id: u32,
    /// Unix timestamp (ms) when the prekey was generated.
    #[zeroize(skip)]
    pub created_at_ms: u64,
    secret: [u8; 32],
    #[zeroize(skip)]
    signature: Vec<u8>,
}

impl SignedPrekey {
    /// Generate a new signed prekey and sign it with `identity`.
    pub fn generate(id: u32, created_at_ms: u64, identity: &IdentityKeypair) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let signature = identity.sign(&signed_prekey_message(id, public.as_bytes()));
        Self {
            id,
            created_at_ms,
            secret: secret.to_bytes(),
            signature: signature.to_vec(),
        }
    }

    pub fn public(&self) -> PublicSignedPrekey {
        PublicSignedPrekey {
            id: self.id,
            key: *PublicKey::from(&self.static_secret()).as_bytes(),
            signature: self.signature.clone(),
        }
    }

    pub(crate) fn static_secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }
}

impl fmt::Debug for SignedPrekey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedPrekey")
            .field("id", &self.id)
            .field("created_at_ms", &self.created_at_ms)
            .finish()
    }
}

/// Published half of a signed prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicSignedPrekey {
    pub id: u32,
    pub key: [u8; 32],
    pub signature: Vec<u8>,
}

impl PublicSignedPrekey {
    /// Check the signature against the owning device's signing key.
    pub fn verify(&self, signing_public: &[u8; 32]) -> CryptoResult<()> {
        let message = signed_prekey_message(self.id, &self.key);
        if verify_signature(signing_public, &message, &self.signature) {
            Ok(())
        } else {
            Err(CryptoError::SignatureInvalid)
        }
    }
}

fn signed_prekey_message(id: u32, key: &[u8; 32]) -> Vec<u8> {
    let mut message = Vec::with_capacity(SIGNED_PREKEY_CONTEXT.len() + 4 + 32);
    message.extend_from_slice(SIGNED_PREKEY_CONTEXT);
    message.extend_from_slice(&id.to_be_bytes());
    message.extend_from_slice(key);
    message
}
