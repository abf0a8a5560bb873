//! Session management module.
//!
//! This module hosts processes behind one of the backend strategies and
//! tracks their lifecycle. Sessions can be created, attached to, detached
//! from, resized, killed, restarted and deleted.

pub mod backend;
pub mod buffer;
pub mod instance;
pub mod registry;
pub mod sink;

pub use backend::{
    detect_backend, BackendError, BackendEvent, BackendKind, BackendPreference, KillSignal,
    ProcessBackend, ProcessHandle, ResizeOutcome, SpawnRequest, SpawnedProcess,
};
pub use buffer::{OutputBuffer, DEFAULT_BUFFER_CAPACITY};
pub use instance::{AttachOutcome, Session, SessionError, SessionId};
pub use registry::{SessionRegistry, SessionSettings, SpawnParams};
pub use sink::{ConnectionId, Delivery, Sink, DEFAULT_SINK_CAPACITY};
