//! Device identity keys and device keys.
//!
//! Every device owns two long-lived keys:
//! - an X25519 agreement key, whose public half is the **device key**
//! - an Ed25519 signing key, used to sign the device's signed prekeys
//!
//! A [`DeviceKey`] is the base64url-encoded X25519 public key (32 bytes →
//! 43 characters). It is the address used for routing envelopes and for
//! keying sessions.
//!
//! # Example
//!
//! ```
//! use murmur_crypto::identity::IdentityKeypair;
//!
//! let identity = IdentityKeypair::generate();
//! let device_key = identity.device_key();
//! assert_eq!(device_key.as_str().len(), 43);
//!
//! let signature = identity.sign(b"prekey bytes");
//! assert!(murmur_crypto::identity::verify_signature(
//!     &identity.signing_public(),
//!     b"prekey bytes",
//!     &signature,
//! ));
//! ```

use crate::error::{CryptoError, CryptoResult};
use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Device key: base64url-encoded X25519 public key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceKey(String);

impl DeviceKey {
    /// Create a device key from raw public key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Parse a device key from its string representation.
    pub fn parse(s: &str) -> CryptoResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| CryptoError::InvalidDeviceKey(e.to_string()))?;

        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }

        Ok(Self(s.to_string()))
    }

    /// Get the raw public key bytes.
    pub fn to_bytes(&self) -> CryptoResult<[u8; 32]> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.0)
            .map_err(|e| CryptoError::InvalidDeviceKey(e.to_string()))?;
        let len = bytes.len();
        bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: len,
        })
    }

    /// Get the X25519 public key.
    pub fn public_key(&self) -> CryptoResult<PublicKey> {
        Ok(PublicKey::from(self.to_bytes()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceKey({})", self.0)
    }
}

/// Serializable secret material of an [`IdentityKeypair`].
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct IdentitySecret {
    pub agreement: [u8; 32],
    pub signing: [u8; 32],
}

impl fmt::Debug for IdentitySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentitySecret(..)")
    }
}

/// Long-lived device identity.
///
/// Secret halves are zeroized on drop by the underlying key types.
#[derive(Clone)]
pub struct IdentityKeypair {
    agreement: StaticSecret,
    signing: SigningKey,
}

impl IdentityKeypair {
    /// Generate a new random identity using the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            agreement: StaticSecret::random_from_rng(OsRng),
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its secret material.
    pub fn from_secret(secret: &IdentitySecret) -> Self {
        Self {
            agreement: StaticSecret::from(secret.agreement),
            signing: SigningKey::from_bytes(&secret.signing),
        }
    }

    /// Export the secret material.
    ///
    /// # Security
    /// Handle with care! These bytes can recreate the identity.
    pub fn to_secret(&self) -> IdentitySecret {
        IdentitySecret {
            agreement: self.agreement.to_bytes(),
            signing: self.signing.to_bytes(),
        }
    }

    pub fn device_key(&self) -> DeviceKey {
        DeviceKey::from_bytes(self.agreement_public().as_bytes())
    }

    pub fn agreement_public(&self) -> PublicKey {
        PublicKey::from(&self.agreement)
    }

    pub fn signing_public(&self) -> [u8; 32] {
        *self.signing.verifying_key().as_bytes()
    }

    /// Sign a message with the identity signing key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Diffie-Hellman with the identity agreement key.
    ///
    /// Rejects low-order peer keys that would yield an all-zero secret.
    pub fn agree(&self, peer: &PublicKey) -> CryptoResult<SharedSecret> {
        contributory(self.agreement.diffie_hellman(peer))
    }

    /// Save the identity to a file with restricted permissions (0600 on Unix).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut secret = self.to_secret();
        let mut raw = Vec::with_capacity(64);
        raw.extend_from_slice(&secret.agreement);
        raw.extend_from_slice(&secret.signing);
        let encoded = URL_SAFE_NO_PAD.encode(&raw);
        raw.zeroize();
        secret.zeroize();

        fs::write(path, encoded)
            .with_context(|| format!("failed to write identity to {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// Load an identity previously written by [`IdentityKeypair::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let encoded = fs::read_to_string(path)
            .with_context(|| format!("failed to read identity from {}", path.display()))?;
        let mut raw = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .context("invalid base64url encoding")?;

        if raw.len() != 64 {
            raw.zeroize();
            anyhow::bail!("invalid identity length: expected 64 bytes");
        }

        let mut secret = IdentitySecret {
            agreement: [0u8; 32],
            signing: [0u8; 32],
        };
        secret.agreement.copy_from_slice(&raw[..32]);
        secret.signing.copy_from_slice(&raw[32..]);
        raw.zeroize();

        Ok(Self::from_secret(&secret))
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("device_key", &self.device_key())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature made by `signing_public`.
pub fn verify_signature(signing_public: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(signing_public) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

pub(crate) fn contributory(shared: SharedSecret) -> CryptoResult<SharedSecret> {
    if shared.was_contributory() {
        Ok(shared)
    } else {
        Err(CryptoError::NonContributory)
    }
}
