//! Per-device ciphertext encoding.

use crate::error::Result;
use murmur_common::{EnvelopeEntry, EnvelopeKind};
use murmur_crypto::RatchetMessage;

pub(crate) fn encode_entry(message: &RatchetMessage) -> Result<EnvelopeEntry> {
    let kind = if message.is_initial() {
        EnvelopeKind::Initial
    } else {
        EnvelopeKind::Continuation
    };
    Ok(EnvelopeEntry {
        kind,
        ciphertext: bincode::serialize(message)?,
    })
}

pub(crate) fn decode_message(ciphertext: &[u8]) -> Result<RatchetMessage> {
    Ok(bincode::deserialize(ciphertext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::E2eeError;

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            decode_message(&[0xFF; 3]),
            Err(E2eeError::Malformed(_))
        ));
    }
}
