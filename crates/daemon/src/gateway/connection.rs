//! Per-connection protocol handler.
//!
//! A `GatewayConnection` turns decoded viewer messages into session
//! operations. It is transport-agnostic: replies and session events are
//! queued on one outbound channel, which the transport drains in order.

use std::sync::Arc;

use protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::session::{ConnectionId, SessionId, SessionRegistry, Sink};

/// Reply text for operations on an unknown session.
pub const SESSION_NOT_FOUND: &str = "Session not found";

/// Protocol state of one viewer connection.
pub struct GatewayConnection {
    /// Unique connection identifier.
    id: ConnectionId,
    registry: Arc<SessionRegistry>,
    /// This connection's outbound queue, handed to sessions on attach.
    sink: Sink,
    /// Session this connection last attached to.
    attached: Option<SessionId>,
}

impl GatewayConnection {
    /// Creates a handler and the receiver of its outbound messages.
    pub fn new(registry: Arc<SessionRegistry>) -> (Self, mpsc::Receiver<ServerMessage>) {
        let id = Uuid::new_v4().to_string();
        let (sink, rx) = Sink::new(id.clone());
        let connection = Self {
            id,
            registry,
            sink,
            attached: None,
        };
        (connection, rx)
    }

    /// Returns the connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The session this connection is attached to, if any.
    pub fn attached_session(&self) -> Option<&str> {
        self.attached.as_deref()
    }

    /// Applies one inbound message.
    pub fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Attach { session_id } => self.handle_attach(session_id),
            ClientMessage::Input { session_id, data } => self.handle_input(&session_id, &data),
            ClientMessage::Resize {
                session_id,
                cols,
                rows,
            } => self.handle_resize(&session_id, cols, rows),
            ClientMessage::Detach => self.detach(),
        }
    }

    /// Replies to a frame that could not be decoded. Session state is
    /// untouched.
    pub fn handle_decode_error(&self, error: &ProtocolError) {
        tracing::debug!(connection = %self.id, error = %error, "Rejected inbound frame");
        let message = match error {
            ProtocolError::UnknownMessageType(kind) => format!("Unknown message type: {}", kind),
            ProtocolError::Malformed(reason) => format!("Invalid message format: {}", reason),
            ProtocolError::Serialization(reason) => format!("Internal error: {}", reason),
        };
        self.sink
            .send(ServerMessage::error(None, error.code(), message));
    }

    /// Cleans up after the transport closed. Same as an explicit detach.
    pub fn close(&mut self) {
        self.detach();
        tracing::debug!(connection = %self.id, "Connection closed");
    }

    fn handle_attach(&mut self, session_id: SessionId) {
        let Some(session) = self.registry.get(&session_id) else {
            self.sink.send(ServerMessage::error(
                Some(session_id),
                ErrorCode::NotFound,
                SESSION_NOT_FOUND,
            ));
            return;
        };

        if self.attached.as_deref() != Some(session_id.as_str()) {
            self.detach();
        }

        let outcome = session.attach(self.sink.clone());
        tracing::info!(
            connection = %self.id,
            session_id = %session_id,
            replayed = outcome.replayed,
            live = outcome.live,
            "Attached to session"
        );
        self.attached = outcome.live.then_some(session_id);
    }

    fn handle_input(&self, session_id: &str, data: &[u8]) {
        let Some(session) = self.registry.get(session_id).filter(|s| s.is_running()) else {
            tracing::trace!(connection = %self.id, session_id = %session_id, "Dropped input");
            return;
        };
        if let Err(e) = session.write(data) {
            tracing::debug!(session_id = %session_id, error = %e, "Input not delivered");
        }
    }

    fn handle_resize(&self, session_id: &str, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            return;
        }
        let Some(session) = self.registry.get(session_id).filter(|s| s.is_running()) else {
            return;
        };
        if let Err(e) = session.resize(cols, rows) {
            tracing::debug!(session_id = %session_id, error = %e, "Resize not applied");
        }
    }

    /// Releases this connection's attachment. A no-op when not attached.
    pub fn detach(&mut self) {
        let Some(session_id) = self.attached.take() else {
            return;
        };
        if let Some(session) = self.registry.get(&session_id) {
            session.detach(&self.id);
        }
        tracing::debug!(connection = %self.id, session_id = %session_id, "Detached from session");
    }
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        self.detach();
    }
}
