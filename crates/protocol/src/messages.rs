//! Gateway message definitions for Nomacode.
//!
//! This module defines the messages exchanged between a viewer connection and
//! the daemon's session gateway. Every message is an object tagged by a `type`
//! field, with camelCase field names:
//!
//! ```json
//! {"type": "attach", "sessionId": "5b0c..."}
//! {"type": "output", "sessionId": "5b0c...", "data": "hello\r\n"}
//! ```
//!
//! Byte payloads are carried as strings in JSON and as raw binary in
//! MessagePack (see [`crate::codec`]).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Messages sent by a viewer to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Bind this connection as the session's output sink.
    Attach {
        /// Session to attach to.
        session_id: String,
    },
    /// Keystrokes or pasted data for the session's process.
    Input {
        /// Target session.
        session_id: String,
        /// Raw input bytes.
        #[serde(with = "wire_bytes")]
        data: Vec<u8>,
    },
    /// Terminal size change.
    Resize {
        /// Target session.
        session_id: String,
        /// New terminal columns.
        cols: u16,
        /// New terminal rows.
        rows: u16,
    },
    /// Unbind this connection from whatever session it is attached to.
    Detach,
}

impl ClientMessage {
    /// The wire names of every client message type.
    pub const TYPES: &'static [&'static str] = &["attach", "input", "resize", "detach"];

    /// The session this message refers to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Attach { session_id }
            | ClientMessage::Input { session_id, .. }
            | ClientMessage::Resize { session_id, .. } => Some(session_id),
            ClientMessage::Detach => None,
        }
    }
}

/// Messages sent by the daemon to a viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Process output, either replayed from the buffer or live.
    Output {
        /// Session that produced the output.
        session_id: String,
        /// Raw output bytes.
        #[serde(with = "wire_bytes")]
        data: Vec<u8>,
    },
    /// The session's process has exited.
    Exit {
        /// Session that stopped.
        session_id: String,
        /// Final exit code.
        code: i32,
    },
    /// Another connection took over this connection's attachment.
    Detached {
        /// Session this connection no longer receives output from.
        session_id: String,
        /// Why the attachment ended.
        reason: DetachReason,
    },
    /// A request could not be handled.
    Error {
        /// Session the failed request referred to, if any.
        session_id: Option<String>,
        /// Error code for programmatic handling.
        code: ErrorCode,
        /// Human-readable error message.
        message: String,
    },
}

impl ServerMessage {
    /// Builds an error reply.
    pub fn error(session_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            session_id,
            code,
            message: message.into(),
        }
    }
}

/// Why a connection stopped receiving a session's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetachReason {
    /// A different connection attached to the same session.
    AttachedElsewhere,
    /// The connection fell too far behind on output. Attaching again
    /// resumes from the replay buffer.
    Overflow,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    /// Referenced session does not exist.
    NotFound,
    /// The `type` tag names no known message.
    UnknownMessageType,
    /// The frame could not be parsed.
    Malformed,
    /// Internal daemon error.
    Internal,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// The process is alive.
    Running,
    /// The process has exited or was killed.
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => f.write_str("running"),
            SessionStatus::Stopped => f.write_str("stopped"),
        }
    }
}

/// Point-in-time description of a session, for listing and status APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Unique session identifier.
    pub id: String,
    /// OS process ID of the hosted command, if known.
    pub process_id: Option<u32>,
    /// Tool the session was created for, `None` for the default shell.
    pub tool_name: Option<String>,
    /// Absolute working directory of the process.
    pub working_directory: PathBuf,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Creation time as Unix seconds.
    pub created_at: u64,
    /// Exit code once stopped.
    pub exit_code: Option<i32>,
}

/// Serde adapter for byte payloads.
///
/// Human-readable formats (JSON) carry bytes as a string; binary formats
/// (MessagePack) carry them as a binary blob. Decoding accepts a string, a
/// binary blob or an array of integers.
pub(crate) mod wire_bytes {
    use std::fmt;

    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&String::from_utf8_lossy(data))
        } else {
            serde_bytes::serialize(data, serializer)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(BytesVisitor)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string, byte blob or byte array")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(v.as_bytes().to_vec())
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
            Ok(v.into_bytes())
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }
    }
}
