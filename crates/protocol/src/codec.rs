//! Wire codec for gateway messages.
//!
//! Two encodings are supported, chosen by the transport frame type:
//!
//! - text frames carry JSON, with byte payloads as UTF-8 strings
//! - binary frames carry MessagePack maps, with byte payloads as raw binary
//!
//! Process output arrives in arbitrary chunks, so a multi-byte UTF-8
//! character can be split across two `output` messages. [`TextEncoder`]
//! holds back an incomplete trailing sequence until the rest arrives.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::messages::{ClientMessage, ServerMessage};

/// Decodes a JSON text frame into a client message.
pub fn decode_text(text: &str) -> Result<ClientMessage> {
    let value: Value = serde_json::from_str(text)?;
    check_type(value.get("type").and_then(Value::as_str))?;
    Ok(serde_json::from_value(value)?)
}

/// Decodes a MessagePack binary frame into a client message.
pub fn decode_binary(bytes: &[u8]) -> Result<ClientMessage> {
    #[derive(Deserialize)]
    struct TypeProbe {
        #[serde(rename = "type")]
        kind: Option<String>,
    }

    let probe: TypeProbe = rmp_serde::from_slice(bytes)?;
    check_type(probe.kind.as_deref())?;
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Encodes a server message as a MessagePack binary frame.
pub fn encode_binary(message: &ServerMessage) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(message)?)
}

fn check_type(kind: Option<&str>) -> Result<()> {
    match kind {
        None => Err(ProtocolError::Malformed(
            "missing message type".to_string(),
        )),
        Some(kind) if ClientMessage::TYPES.contains(&kind) => Ok(()),
        Some(kind) => Err(ProtocolError::UnknownMessageType(kind.to_string())),
    }
}

/// Stateful JSON encoder for server messages.
///
/// Output payloads are cut at UTF-8 character boundaries; an incomplete
/// trailing sequence is carried into the next `output` message for the
/// same session.
#[derive(Debug, Default)]
pub struct TextEncoder {
    /// Session whose bytes are being carried.
    carry_session: Option<String>,
    /// Incomplete UTF-8 sequence held back from the last output.
    carry: Vec<u8>,
}

impl TextEncoder {
    /// Creates an encoder with nothing carried.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops any carried bytes.
    pub fn reset(&mut self) {
        self.carry_session = None;
        self.carry.clear();
    }

    /// Returns the number of bytes currently held back.
    pub fn carried(&self) -> usize {
        self.carry.len()
    }

    /// Encodes a message as a JSON text frame.
    ///
    /// Returns `None` when an `output` payload was entirely held back
    /// waiting for the rest of a character.
    pub fn encode(&mut self, message: ServerMessage) -> Result<Option<String>> {
        let message = match message {
            ServerMessage::Output { session_id, data } => {
                if self.carry_session.as_deref() != Some(session_id.as_str()) {
                    self.carry.clear();
                    self.carry_session = Some(session_id.clone());
                }
                let data = self.take_complete(&data);
                if data.is_empty() {
                    return Ok(None);
                }
                ServerMessage::Output { session_id, data }
            }
            other => {
                if matches!(other, ServerMessage::Exit { .. } | ServerMessage::Detached { .. }) {
                    self.reset();
                }
                other
            }
        };

        serde_json::to_string(&message)
            .map(Some)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Joins the carry with `data` and splits off a new incomplete tail.
    fn take_complete(&mut self, data: &[u8]) -> Vec<u8> {
        let mut joined = std::mem::take(&mut self.carry);
        joined.extend_from_slice(data);
        let keep = incomplete_tail_len(&joined);
        self.carry = joined.split_off(joined.len() - keep);
        joined
    }
}

/// Length of a trailing UTF-8 sequence that is a valid prefix but not yet
/// complete. Zero when the buffer ends on a character boundary.
fn incomplete_tail_len(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(3) {
        let byte = buf[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            // continuation byte, keep looking for the lead byte
            continue;
        }
        let needed = match byte {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}
