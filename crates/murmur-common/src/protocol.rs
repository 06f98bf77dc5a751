use crate::error::{Error, Result};
use crate::helpers::base64_bytes;
use murmur_crypto::prekey::{PublicOneTimePrekey, PublicSignedPrekey};
use murmur_crypto::DeviceKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use murmur_crypto::PrekeyBundle as ClaimedBundle;

/// Opaque account identifier issued by the authentication service.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

/// Whether a ciphertext can bootstrap a session on the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Initial,
    Continuation,
}

/// Ciphertext addressed to a single device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeEntry {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// One logical message fanned out to every recipient device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub sender_device_key: DeviceKey,
    pub recipients: BTreeMap<DeviceKey, EnvelopeEntry>,
}

impl WireEnvelope {
    pub fn new(sender_device_key: DeviceKey) -> Self {
        Self {
            sender_device_key,
            recipients: BTreeMap::new(),
        }
    }

    /// Entry addressed to `device`, if any.
    pub fn entry_for(&self, device: &DeviceKey) -> Option<&EnvelopeEntry> {
        self.recipients.get(device)
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::protocol(format!("bad envelope: {e}")))
    }
}

/// Message handed over by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: uuid::Uuid,
    pub sender_user: UserId,
    pub envelope: WireEnvelope,
}

/// A device registered for a user in the key directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_key: DeviceKey,
    pub signing_key: [u8; 32],
}

/// Public key material published by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyUpload {
    pub user: UserId,
    pub device_key: DeviceKey,
    pub signing_key: [u8; 32],
    pub signed_prekey: PublicSignedPrekey,
    pub one_time_prekeys: Vec<PublicOneTimePrekey>,
}

/// Push notification that a device's published pool is running low.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowPrekeyNotice {
    pub user: UserId,
    pub device_key: DeviceKey,
    pub remaining: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(n: u8) -> DeviceKey {
        DeviceKey::from_bytes(&[n; 32])
    }

    #[test]
    fn test_envelope_json_shape() {
        let mut envelope = WireEnvelope::new(device(1));
        envelope.recipients.insert(
            device(2),
            EnvelopeEntry {
                kind: EnvelopeKind::Initial,
                ciphertext: vec![1, 2, 3],
            },
        );

        let json: serde_json::Value =
            serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();
        let entry = &json["recipients"][device(2).as_str()];
        assert_eq!(entry["type"], "initial");
        assert_eq!(entry["ciphertext"], "AQID");
        assert_eq!(json["sender_device_key"], device(1).as_str());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let mut envelope = WireEnvelope::new(device(1));
        envelope.recipients.insert(
            device(3),
            EnvelopeEntry {
                kind: EnvelopeKind::Continuation,
                ciphertext: vec![9; 40],
            },
        );

        let parsed = WireEnvelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(parsed, envelope);
        assert!(parsed.entry_for(&device(3)).is_some());
        assert!(parsed.entry_for(&device(4)).is_none());
    }

    #[test]
    fn test_malformed_envelope() {
        assert!(matches!(
            WireEnvelope::from_json(b"{\"recipients\": 5}"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_user_id_display() {
        let user = UserId::from("alice");
        assert_eq!(user.to_string(), "alice");
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"alice\"");
    }
}
