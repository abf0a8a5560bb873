//! IPC message types for CLI-daemon communication.
//!
//! This module defines the request and response types used for communication
//! between the CLI and the daemon over Unix Domain Sockets.

use std::path::PathBuf;

use protocol::SessionSummary;
use serde::{Deserialize, Serialize};

use crate::session::BackendKind;
use crate::tools::ToolStatus;

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List all sessions, running and stopped.
    ListSessions,
    /// Describe one session.
    GetSession {
        /// The session to describe.
        session_id: String,
    },
    /// Spawn a new session.
    CreateSession {
        /// Absolute working directory; the daemon user's home when omitted.
        working_directory: Option<PathBuf>,
        /// Tool to launch; the default shell when omitted.
        tool: Option<String>,
        /// Initial terminal columns.
        cols: Option<u16>,
        /// Initial terminal rows.
        rows: Option<u16>,
    },
    /// Kill a session's process. The session stays listed as stopped.
    KillSession {
        /// The unique identifier of the session to kill.
        session_id: String,
        /// Skip the polite termination request.
        #[serde(default)]
        force: bool,
    },
    /// Kill a session if needed and forget it.
    CloseSession {
        /// The session to close.
        session_id: String,
    },
    /// Replace a session's process with a fresh one.
    RestartSession {
        /// The session to restart.
        session_id: String,
    },
    /// Report which tools are installed.
    ListTools,
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of known sessions.
        session_count: usize,
        /// Number of sessions whose process is alive.
        running_sessions: usize,
        /// Number of open viewer connections.
        connection_count: usize,
        /// Process backend in use.
        backend: BackendKind,
        /// Address the gateway listens on.
        gateway_addr: String,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// All sessions.
    Sessions {
        /// Summary of each session.
        sessions: Vec<SessionSummary>,
    },
    /// One session, in reply to get, create or restart.
    Session {
        /// The session's current summary.
        session: SessionSummary,
    },
    /// Confirmation that a kill was requested.
    SessionKilled {
        /// The ID of the killed session.
        session_id: String,
    },
    /// Confirmation that a session was removed.
    SessionClosed {
        /// The ID of the removed session.
        session_id: String,
    },
    /// Detection results for every known tool.
    Tools {
        /// One entry per tool.
        tools: Vec<ToolStatus>,
    },
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}
