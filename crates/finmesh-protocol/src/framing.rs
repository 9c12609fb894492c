//! Length-prefixed envelope framing.
//!
//! Envelopes travel as a 4-byte big-endian length prefix followed by the
//! JSON body, one envelope per logical write:
//!
//! ```text
//! +----------------+------------------+
//! | length (4 BE)  |  JSON envelope   |
//! +----------------+------------------+
//! ```

use crate::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, ProtocolResult};
use crate::types::Envelope;

/// Encodes an envelope into a framed byte buffer ready for transmission.
///
/// Fails only when the serialized body exceeds [`MAX_MESSAGE_SIZE`] or the
/// envelope cannot be serialized.
pub fn encode_envelope(envelope: &Envelope) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(envelope)?;
    let len = json.len() as u32;

    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buffer = Vec::with_capacity(4 + json.len());
    buffer.extend_from_slice(&len.to_be_bytes());
    buffer.extend_from_slice(&json);
    Ok(buffer)
}

/// Decodes a complete framed message back into a validated envelope.
///
/// Never panics: truncated input, oversize claims, unparseable JSON, and
/// missing required fields all come back as a [`ProtocolError`].
pub fn decode_envelope(data: &[u8]) -> ProtocolResult<Envelope> {
    if data.len() < 4 {
        return Err(ProtocolError::IncompleteMessage {
            expected: 4,
            received: data.len(),
        });
    }

    let len_bytes: [u8; 4] = data[0..4].try_into().expect("slice length checked");
    let len = u32::from_be_bytes(len_bytes);

    if len == 0 {
        return Err(ProtocolError::EmptyMessage);
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let len = len as usize;
    if data.len() < 4 + len {
        return Err(ProtocolError::IncompleteMessage {
            expected: 4 + len,
            received: data.len(),
        });
    }

    Envelope::from_json_slice(&data[4..4 + len])
}
