//! # Nomacode Protocol Library
//!
//! This crate defines the message contract between a remote terminal viewer
//! and the Nomacode daemon's session gateway.
//!
//! ## Overview
//!
//! - **Message Definitions**: the four viewer requests (`attach`, `input`,
//!   `resize`, `detach`) and the daemon's replies and events (`output`,
//!   `exit`, `detached`, `error`)
//! - **Session Summaries**: the shared shape used by listing and status APIs
//! - **Wire Codec**: JSON for text frames, MessagePack for binary frames
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{codec, ClientMessage, ServerMessage, TextEncoder};
//!
//! let msg = codec::decode_text(r#"{"type":"attach","sessionId":"abc"}"#).unwrap();
//! assert_eq!(msg, ClientMessage::Attach { session_id: "abc".to_string() });
//!
//! let mut encoder = TextEncoder::new();
//! let frame = encoder
//!     .encode(ServerMessage::Output { session_id: "abc".to_string(), data: b"hi".to_vec() })
//!     .unwrap();
//! assert!(frame.unwrap().contains("\"data\":\"hi\""));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Message definitions
//! - [`codec`]: Frame decoding and encoding
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{decode_binary, decode_text, encode_binary, TextEncoder};
pub use error::{ProtocolError, Result};
pub use messages::{
    ClientMessage, DetachReason, ErrorCode, ServerMessage, SessionStatus, SessionSummary,
};
