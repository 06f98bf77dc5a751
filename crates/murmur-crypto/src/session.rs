//! Chain-ratchet sessions.
//!
//! A session is created from the output of key agreement. The root key is
//! split into two one-way chains, one per direction. Each message consumes
//! the next key from the sending chain; the receiver walks its chain to
//! the message index, parking keys for any gap in the [`SkipWindow`].
//!
//! Decryption is transactional: state only changes once the AEAD tag has
//! verified, so a forged or corrupted message never advances a chain.

use crate::agreement::{self, AgreementOutput, HandshakeHeader, PrekeyBundle, SessionId};
use crate::cipher::MessageKey;
use crate::error::{CryptoError, CryptoResult};
use crate::identity::{DeviceKey, IdentityKeypair};
use crate::prekey::{OneTimePrekey, SignedPrekey};
use crate::skip_window::SkipWindow;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

const CHAIN_INITIATOR_INFO: &[u8] = b"murmur-chain-initiator";
const CHAIN_RESPONDER_INFO: &[u8] = b"murmur-chain-responder";
const MESSAGE_KEY_INFO: &[u8] = b"murmur-msg";
const NEXT_CHAIN_INFO: &[u8] = b"murmur-chain";

/// Which side of the agreement this session was created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct ChainKey {
    key: [u8; 32],
    #[zeroize(skip)]
    index: u64,
}

impl ChainKey {
    /// Derive the message key for the current index and advance the chain.
    fn step(&mut self) -> CryptoResult<MessageKey> {
        let hk = Hkdf::<Sha256>::from_prk(&self.key).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: self.key.len(),
            }
        })?;

        let mut okm = [0u8; 44];
        let mut next = [0u8; 32];
        // Output lengths are fixed and far below the HKDF limit.
        let _ = hk.expand(MESSAGE_KEY_INFO, &mut okm);
        let _ = hk.expand(NEXT_CHAIN_INFO, &mut next);

        let mut key = [0u8; 32];
        let mut nonce = [0u8; 12];
        key.copy_from_slice(&okm[..32]);
        nonce.copy_from_slice(&okm[32..]);
        okm.zeroize();

        self.key.zeroize();
        self.key = next;
        self.index += 1;
        Ok(MessageKey::from_parts(key, nonce))
    }
}

/// One encrypted message of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    pub session_id: SessionId,
    pub index: u64,
    /// Present only on the initiator's first message.
    pub handshake: Option<HandshakeHeader>,
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// True when this message can bootstrap a session on the receiver.
    pub fn is_initial(&self) -> bool {
        self.handshake.is_some()
    }
}

/// Pairwise session with one remote device.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetSession {
    session_id: SessionId,
    role: Role,
    remote: DeviceKey,
    associated_data: Vec<u8>,
    sending: ChainKey,
    receiving: ChainKey,
    skipped: SkipWindow,
    /// Attached to the first outgoing message of an initiator session.
    handshake: Option<HandshakeHeader>,
}

impl RatchetSession {
    /// Start a session against a claimed bundle.
    pub fn initiate(local: &IdentityKeypair, bundle: &PrekeyBundle) -> CryptoResult<Self> {
        Self::initiate_with_window(local, bundle, SkipWindow::new())
    }

    pub fn initiate_with_window(
        local: &IdentityKeypair,
        bundle: &PrekeyBundle,
        window: SkipWindow,
    ) -> CryptoResult<Self> {
        let (output, header) = agreement::initiate(local, bundle)?;
        Self::from_agreement(
            &output,
            Role::Initiator,
            bundle.device_key.clone(),
            Some(header),
            window,
        )
    }

    /// Accept a session from the handshake header of an initial message.
    pub fn respond(
        local: &IdentityKeypair,
        signed_prekey: &SignedPrekey,
        one_time_prekey: Option<&OneTimePrekey>,
        header: &HandshakeHeader,
    ) -> CryptoResult<Self> {
        Self::respond_with_window(
            local,
            signed_prekey,
            one_time_prekey,
            header,
            SkipWindow::new(),
        )
    }

    pub fn respond_with_window(
        local: &IdentityKeypair,
        signed_prekey: &SignedPrekey,
        one_time_prekey: Option<&OneTimePrekey>,
        header: &HandshakeHeader,
        window: SkipWindow,
    ) -> CryptoResult<Self> {
        let output = agreement::respond(local, signed_prekey, one_time_prekey, header)?;
        Self::from_agreement(
            &output,
            Role::Responder,
            header.identity_key.clone(),
            None,
            window,
        )
    }

    fn from_agreement(
        output: &AgreementOutput,
        role: Role,
        remote: DeviceKey,
        handshake: Option<HandshakeHeader>,
        skipped: SkipWindow,
    ) -> CryptoResult<Self> {
        let hk = Hkdf::<Sha256>::from_prk(&output.root_key).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: output.root_key.len(),
            }
        })?;
        let mut initiator_chain = [0u8; 32];
        let mut responder_chain = [0u8; 32];
        let _ = hk.expand(CHAIN_INITIATOR_INFO, &mut initiator_chain);
        let _ = hk.expand(CHAIN_RESPONDER_INFO, &mut responder_chain);

        let (send, recv) = match role {
            Role::Initiator => (initiator_chain, responder_chain),
            Role::Responder => (responder_chain, initiator_chain),
        };

        Ok(Self {
            session_id: output.session_id,
            role,
            remote,
            associated_data: output.associated_data.clone(),
            sending: ChainKey {
                key: send,
                index: 0,
            },
            receiving: ChainKey {
                key: recv,
                index: 0,
            },
            skipped,
            handshake,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote(&self) -> &DeviceKey {
        &self.remote
    }

    /// Number of messages encrypted so far.
    pub fn sent_count(&self) -> u64 {
        self.sending.index
    }

    /// Next receiving index expected in order.
    pub fn next_receive_index(&self) -> u64 {
        self.receiving.index
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Encrypt `plaintext`, advancing the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CryptoResult<RatchetMessage> {
        let index = self.sending.index;
        let handshake = if index == 0 {
            self.handshake.clone()
        } else {
            None
        };

        let mut chain = self.sending.clone();
        let key = chain.step()?;
        let ciphertext = key.seal(&self.message_ad(index), plaintext)?;
        self.sending = chain;

        Ok(RatchetMessage {
            session_id: self.session_id,
            index,
            handshake,
            ciphertext,
        })
    }

    /// Decrypt a message of this session.
    ///
    /// Fails with [`CryptoError::Replay`] when the index was already
    /// consumed (or its parked key evicted), and with
    /// [`CryptoError::OutsideWindow`] when it is too far ahead.
    pub fn decrypt(&mut self, message: &RatchetMessage) -> CryptoResult<Vec<u8>> {
        if message.session_id != self.session_id {
            return Err(CryptoError::SessionMismatch {
                expected: self.session_id.to_string(),
                actual: message.session_id.to_string(),
            });
        }

        let index = message.index;
        let ad = self.message_ad(index);

        if index < self.receiving.index {
            let key = self.skipped.get(index).ok_or(CryptoError::Replay(index))?;
            let plaintext = key.open(&ad, &message.ciphertext)?;
            self.skipped.take(index);
            return Ok(plaintext);
        }

        self.skipped.check_ahead(self.receiving.index, index)?;

        let mut chain = self.receiving.clone();
        let mut gap = Vec::with_capacity((index - chain.index) as usize);
        while chain.index < index {
            gap.push((chain.index, chain.step()?));
        }
        let key = chain.step()?;
        let plaintext = key.open(&ad, &message.ciphertext)?;

        self.receiving = chain;
        for (skipped_index, skipped_key) in gap {
            self.skipped.insert(skipped_index, skipped_key);
        }
        Ok(plaintext)
    }

    fn message_ad(&self, index: u64) -> Vec<u8> {
        let mut ad = Vec::with_capacity(self.associated_data.len() + 16 + 8);
        ad.extend_from_slice(&self.associated_data);
        ad.extend_from_slice(&self.session_id.0);
        ad.extend_from_slice(&index.to_be_bytes());
        ad
    }
}

impl fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetSession")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("remote", &self.remote)
            .field("sent", &self.sending.index)
            .field("received", &self.receiving.index)
            .field("skipped", &self.skipped.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (RatchetSession, RatchetSession, RatchetMessage) {
        let alice = IdentityKeypair::generate();
        let bob = IdentityKeypair::generate();
        let spk = SignedPrekey::generate(1, 0, &bob);
        let otk = OneTimePrekey::generate(1);
        let bundle = PrekeyBundle {
            device_key: bob.device_key(),
            signing_key: bob.signing_public(),
            signed_prekey: spk.public(),
            one_time_prekey: Some(otk.public()),
        };

        let mut a = RatchetSession::initiate(&alice, &bundle).unwrap();
        let first = a.encrypt(b"hello").unwrap();
        let header = first.handshake.clone().unwrap();
        let b = RatchetSession::respond(&bob, &spk, Some(&otk), &header).unwrap();
        (a, b, first)
    }

    #[test]
    fn test_initial_message_carries_handshake() {
        let (mut a, mut b, first) = pair();
        assert!(first.is_initial());
        assert_eq!(first.index, 0);
        assert_eq!(b.decrypt(&first).unwrap(), b"hello");

        let second = a.encrypt(b"again").unwrap();
        assert!(!second.is_initial());
        assert_eq!(b.decrypt(&second).unwrap(), b"again");
    }

    #[test]
    fn test_bidirectional() {
        let (mut a, mut b, first) = pair();
        b.decrypt(&first).unwrap();

        let reply = b.encrypt(b"hi alice").unwrap();
        assert!(!reply.is_initial());
        assert_eq!(a.decrypt(&reply).unwrap(), b"hi alice");
        assert_eq!(a.session_id(), b.session_id());
        assert_eq!(a.role(), Role::Initiator);
        assert_eq!(b.role(), Role::Responder);
    }

    #[test]
    fn test_replay_rejected() {
        let (_, mut b, first) = pair();
        b.decrypt(&first).unwrap();
        assert_eq!(b.decrypt(&first), Err(CryptoError::Replay(0)));
    }

    #[test]
    fn test_out_of_order_within_window() {
        let (mut a, mut b, first) = pair();
        let m1 = a.encrypt(b"one").unwrap();
        let m2 = a.encrypt(b"two").unwrap();
        let m3 = a.encrypt(b"three").unwrap();

        assert_eq!(b.decrypt(&m3).unwrap(), b"three");
        assert_eq!(b.skipped_len(), 3);
        assert_eq!(b.decrypt(&m1).unwrap(), b"one");
        assert_eq!(b.decrypt(&first).unwrap(), b"hello");
        assert_eq!(b.decrypt(&m2).unwrap(), b"two");
        assert_eq!(b.skipped_len(), 0);
        assert_eq!(b.decrypt(&m2), Err(CryptoError::Replay(2)));
    }

    #[test]
    fn test_outside_window_rejected() {
        let alice = IdentityKeypair::generate();
        let bob = IdentityKeypair::generate();
        let spk = SignedPrekey::generate(1, 0, &bob);
        let bundle = PrekeyBundle {
            device_key: bob.device_key(),
            signing_key: bob.signing_public(),
            signed_prekey: spk.public(),
            one_time_prekey: None,
        };

        let mut a = RatchetSession::initiate(&alice, &bundle).unwrap();
        let first = a.encrypt(b"0").unwrap();
        let mut b = RatchetSession::respond_with_window(
            &bob,
            &spk,
            None,
            first.handshake.as_ref().unwrap(),
            SkipWindow::with_limits(2, 2),
        )
        .unwrap();

        let mut last = first.clone();
        for _ in 0..4 {
            last = a.encrypt(b"x").unwrap();
        }
        let err = b.decrypt(&last).unwrap_err();
        assert!(err.is_replay_or_too_old());
        assert_eq!(b.next_receive_index(), 0);
    }

    #[test]
    fn test_tampered_message_does_not_advance() {
        let (_, mut b, first) = pair();
        let mut forged = first.clone();
        forged.ciphertext[0] ^= 1;

        assert_eq!(b.decrypt(&forged), Err(CryptoError::Decryption));
        assert_eq!(b.next_receive_index(), 0);
        assert_eq!(b.decrypt(&first).unwrap(), b"hello");
    }

    #[test]
    fn test_other_session_rejected() {
        let (_, mut b, _) = pair();
        let (_, _, foreign) = pair();
        assert!(matches!(
            b.decrypt(&foreign),
            Err(CryptoError::SessionMismatch { .. })
        ));
    }

    #[test]
    fn test_session_survives_serialization() {
        let (mut a, b, first) = pair();
        let json = serde_json::to_vec(&b).unwrap();
        let mut restored: RatchetSession = serde_json::from_slice(&json).unwrap();

        assert_eq!(restored.decrypt(&first).unwrap(), b"hello");
        let next = a.encrypt(b"after restore").unwrap();
        assert_eq!(restored.decrypt(&next).unwrap(), b"after restore");
    }
}
