//! Process hosting strategies.
//!
//! A backend runs a command behind a byte-stream interface: input goes in
//! through [`ProcessHandle::write`], output and the final exit code come back
//! as [`BackendEvent`]s on a per-process channel. Three strategies exist:
//!
//! - [`BackendKind::Pty`]: a real pseudo-terminal via `portable-pty`
//! - [`BackendKind::Script`]: pipes around the `script` utility, which
//!   allocates the terminal on our behalf
//! - [`BackendKind::Pipe`]: plain pipes, always available
//!
//! The strategy is chosen once at startup by [`detect_backend`] and handed to
//! the session registry explicitly.

mod pipe;
mod pty;
mod script;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use pipe::PipeBackend;
pub use pty::PtyBackend;
pub use script::ScriptBackend;

use crate::tools::{probe_command, Availability};

/// Buffer size for reading process output.
pub(crate) const READ_BUFFER_SIZE: usize = 4096;

/// Exit code reported when the process fails at the OS level after spawning.
pub const SYNTHETIC_FAILURE_CODE: i32 = 1;

/// Errors raised by a backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The executable could not be found on `PATH`.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// The OS refused to start the process.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// The process input stream is gone.
    #[error("process input is closed")]
    InputClosed,

    /// The terminal could not be resized.
    #[error("failed to resize terminal: {0}")]
    ResizeFailed(String),

    /// The process could not be signalled.
    #[error("failed to signal process: {0}")]
    KillFailed(String),
}

/// The available process hosting strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Native pseudo-terminal.
    Pty,
    /// Pseudo-terminal allocated by the external `script` utility.
    Script,
    /// Plain pipes, no terminal semantics.
    Pipe,
}

impl BackendKind {
    /// Returns the wire/config name of the strategy.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Pty => "pty",
            BackendKind::Script => "script",
            BackendKind::Pipe => "pipe",
        }
    }

    /// Instantiates the strategy.
    pub fn create(self) -> Arc<dyn ProcessBackend> {
        match self {
            BackendKind::Pty => Arc::new(PtyBackend::new()),
            BackendKind::Script => Arc::new(ScriptBackend::new()),
            BackendKind::Pipe => Arc::new(PipeBackend::new()),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured backend choice: probe, or force a specific strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Probe the platform and pick the best strategy.
    #[default]
    Auto,
    /// Always use a native pseudo-terminal.
    Pty,
    /// Always wrap commands in `script`.
    Script,
    /// Always use plain pipes.
    Pipe,
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "pty" => Ok(BackendPreference::Pty),
            "script" => Ok(BackendPreference::Script),
            "pipe" => Ok(BackendPreference::Pipe),
            other => Err(format!(
                "unknown backend '{}', expected one of: auto, pty, script, pipe",
                other
            )),
        }
    }
}

/// Result of a resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// The terminal now has the requested size.
    Applied,
    /// The backend cannot resize; the request was accepted and ignored.
    Unsupported,
}

/// How hard to ask a process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Polite termination (SIGTERM, or terminal hang-up for a PTY).
    Terminate,
    /// Immediate termination (SIGKILL).
    Force,
}

/// Events pushed by a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// A chunk of output, in emission order.
    Data(Bytes),
    /// The process is gone. Always the last event.
    Exit(i32),
}

/// Everything needed to start a process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Executable name or path.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Absolute working directory.
    pub cwd: PathBuf,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Initial terminal columns.
    pub cols: u16,
    /// Initial terminal rows.
    pub rows: u16,
}

impl SpawnRequest {
    /// Environment variables layered over the daemon's own environment.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars = self.env.clone();
        vars.push(("TERM".to_string(), "xterm-256color".to_string()));
        vars.push(("COLORTERM".to_string(), "truecolor".to_string()));
        vars.push(("COLUMNS".to_string(), self.cols.to_string()));
        vars.push(("LINES".to_string(), self.rows.to_string()));
        vars
    }
}

/// A freshly started process: its control handle and its event stream.
pub struct SpawnedProcess {
    /// Control handle, owned by the session.
    pub handle: Box<dyn ProcessHandle>,
    /// Output and exit events, in order.
    pub events: mpsc::UnboundedReceiver<BackendEvent>,
}

/// A process hosting strategy.
pub trait ProcessBackend: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> BackendKind;

    /// Whether [`ProcessHandle::resize`] can actually change the size.
    fn supports_resize(&self) -> bool;

    /// Starts a process. Must be called from within a Tokio runtime.
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, BackendError>;
}

/// Control surface of a running process.
pub trait ProcessHandle: Send + Sync {
    /// OS process ID, if known.
    fn pid(&self) -> Option<u32>;

    /// Queues bytes for the process input. Never blocks on the process.
    fn write(&self, data: &[u8]) -> Result<(), BackendError>;

    /// Changes the terminal size.
    fn resize(&self, cols: u16, rows: u16) -> Result<ResizeOutcome, BackendError>;

    /// Signals the process. Does not wait for it to exit.
    fn kill(&self, signal: KillSignal) -> Result<(), BackendError>;

    /// Drops the I/O resources held for a live process. Called once the
    /// exit has been reported; later writes fail with
    /// [`BackendError::InputClosed`].
    fn release(&self) {}
}

/// Picks the process hosting strategy.
///
/// With [`BackendPreference::Auto`] the first working strategy wins: a native
/// PTY, then `script`, then plain pipes.
pub async fn detect_backend(preference: BackendPreference) -> BackendKind {
    let kind = match preference {
        BackendPreference::Pty => BackendKind::Pty,
        BackendPreference::Script => BackendKind::Script,
        BackendPreference::Pipe => BackendKind::Pipe,
        BackendPreference::Auto => {
            if PtyBackend::probe() {
                BackendKind::Pty
            } else {
                match probe_command(script::SCRIPT_COMMAND).await {
                    Availability::Available => BackendKind::Script,
                    other => {
                        tracing::debug!(script = ?other, "script wrapper unavailable");
                        BackendKind::Pipe
                    }
                }
            }
        }
    };

    tracing::info!(backend = %kind, preference = ?preference, "Selected process backend");
    kind
}

/// Resolves a command to an executable path through `PATH`.
pub(crate) fn resolve_executable(command: &str) -> Result<PathBuf, BackendError> {
    if command.is_empty() {
        return Err(BackendError::CommandNotFound(command.to_string()));
    }
    let path = Path::new(command);
    if path.is_absolute() {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(BackendError::CommandNotFound(command.to_string()))
        };
    }
    which::which(command).map_err(|_| BackendError::CommandNotFound(command.to_string()))
}

/// Maps a process exit status to a numeric code.
///
/// Death by signal `N` is reported as `128 + N`, like a shell does.
pub(crate) fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    SYNTHETIC_FAILURE_CODE
}
