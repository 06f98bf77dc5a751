//! Asynchronous key agreement against a published prekey bundle.
//!
//! The initiator combines four Diffie-Hellman outputs:
//!
//! ```text
//! DH1 = DH(IK_a,  SPK_b)
//! DH2 = DH(EK_a,  IK_b)
//! DH3 = DH(EK_a,  SPK_b)
//! DH4 = DH(EK_a,  OPK_b)   (only when a one-time prekey was claimed)
//! ```
//!
//! and feeds them through HKDF-SHA256 to obtain the session root key and
//! a session id both sides agree on. The responder recomputes the same
//! values from the [`HandshakeHeader`] carried by the first message.

use crate::error::{CryptoError, CryptoResult};
use crate::identity::{contributory, DeviceKey, IdentityKeypair};
use crate::prekey::{OneTimePrekey, PublicOneTimePrekey, PublicSignedPrekey, SignedPrekey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

const KDF_ROOT_INFO: &[u8] = b"murmur-x3dh-root";
const KDF_SESSION_ID_INFO: &[u8] = b"murmur-x3dh-session-id";

/// Identifier both ends of a session derive independently.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub [u8; 16]);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

/// A device's published key material, as returned by a prekey claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyBundle {
    pub device_key: DeviceKey,
    pub signing_key: [u8; 32],
    pub signed_prekey: PublicSignedPrekey,
    /// Absent when the device's one-time pool was exhausted.
    pub one_time_prekey: Option<PublicOneTimePrekey>,
}

impl PrekeyBundle {
    /// Verify the signed prekey signature against the bundle's signing key.
    pub fn verify(&self) -> CryptoResult<()> {
        self.device_key.to_bytes()?;
        self.signed_prekey.verify(&self.signing_key)
    }
}

/// Agreement parameters attached to the first message of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeHeader {
    /// Initiator's device key.
    pub identity_key: DeviceKey,
    pub ephemeral_key: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

/// Shared values produced by a successful agreement.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AgreementOutput {
    pub root_key: [u8; 32],
    #[zeroize(skip)]
    pub associated_data: Vec<u8>,
    #[zeroize(skip)]
    pub session_id: SessionId,
}

/// Run the initiator side against a verified bundle.
pub fn initiate(
    local: &IdentityKeypair,
    bundle: &PrekeyBundle,
) -> CryptoResult<(AgreementOutput, HandshakeHeader)> {
    bundle.verify()?;

    let remote_identity = bundle.device_key.public_key()?;
    let remote_spk = PublicKey::from(bundle.signed_prekey.key);
    let ephemeral = StaticSecret::random_from_rng(OsRng);

    let dh1 = local.agree(&remote_spk)?;
    let dh2 = contributory(ephemeral.diffie_hellman(&remote_identity))?;
    let dh3 = contributory(ephemeral.diffie_hellman(&remote_spk))?;

    let mut material = Vec::with_capacity(32 * 5);
    material.extend_from_slice(&[0xFF; 32]);
    material.extend_from_slice(dh1.as_bytes());
    material.extend_from_slice(dh2.as_bytes());
    material.extend_from_slice(dh3.as_bytes());
    if let Some(otk) = &bundle.one_time_prekey {
        let dh4 = contributory(ephemeral.diffie_hellman(&PublicKey::from(otk.key)))?;
        material.extend_from_slice(dh4.as_bytes());
    }

    let local_key = local.device_key();
    let output = derive(
        &mut material,
        associated_data(&local_key, &bundle.device_key)?,
    );

    let header = HandshakeHeader {
        identity_key: local_key,
        ephemeral_key: *PublicKey::from(&ephemeral).as_bytes(),
        signed_prekey_id: bundle.signed_prekey.id,
        one_time_prekey_id: bundle.one_time_prekey.map(|k| k.id),
    };

    Ok((output, header))
}

/// Run the responder side using the prekeys named in `header`.
pub fn respond(
    local: &IdentityKeypair,
    signed_prekey: &SignedPrekey,
    one_time_prekey: Option<&OneTimePrekey>,
    header: &HandshakeHeader,
) -> CryptoResult<AgreementOutput> {
    if signed_prekey.id != header.signed_prekey_id {
        return Err(CryptoError::UnknownSignedPrekey(header.signed_prekey_id));
    }
    if one_time_prekey.map(|k| k.id) != header.one_time_prekey_id {
        return Err(CryptoError::InvalidPublicKey);
    }

    let remote_identity = header.identity_key.public_key()?;
    let remote_ephemeral = PublicKey::from(header.ephemeral_key);
    let spk = signed_prekey.static_secret();

    let dh1 = contributory(spk.diffie_hellman(&remote_identity))?;
    let dh2 = local.agree(&remote_ephemeral)?;
    let dh3 = contributory(spk.diffie_hellman(&remote_ephemeral))?;

    let mut material = Vec::with_capacity(32 * 5);
    material.extend_from_slice(&[0xFF; 32]);
    material.extend_from_slice(dh1.as_bytes());
    material.extend_from_slice(dh2.as_bytes());
    material.extend_from_slice(dh3.as_bytes());
    if let Some(otk) = one_time_prekey {
        let dh4 = contributory(otk.static_secret().diffie_hellman(&remote_ephemeral))?;
        material.extend_from_slice(dh4.as_bytes());
    }

    Ok(derive(
        &mut material,
        associated_data(&header.identity_key, &local.device_key())?,
    ))
}

fn associated_data(initiator: &DeviceKey, responder: &DeviceKey) -> CryptoResult<Vec<u8>> {
    let mut ad = Vec::with_capacity(64);
    ad.extend_from_slice(&initiator.to_bytes()?);
    ad.extend_from_slice(&responder.to_bytes()?);
    Ok(ad)
}

fn derive(material: &mut Vec<u8>, associated_data: Vec<u8>) -> AgreementOutput {
    let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), material);
    let mut root_key = [0u8; 32];
    let mut session_id = [0u8; 16];
    // 32 and 16 bytes are far below the HKDF-SHA256 output limit.
    let _ = hk.expand(KDF_ROOT_INFO, &mut root_key);
    let _ = hk.expand(KDF_SESSION_ID_INFO, &mut session_id);
    material.zeroize();

    AgreementOutput {
        root_key,
        associated_data,
        session_id: SessionId(session_id),
    }
}
