//! A single hosted process and its attach state.
//!
//! A session owns the backend handle of one process, a bounded history of
//! its output and at most one attached sink. Backend events are applied by
//! a dedicated pump task; attach, detach and the pump all serialize on the
//! session's state lock, which is what keeps replay ahead of live output.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use protocol::{DetachReason, ServerMessage, SessionStatus, SessionSummary};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backend::{
    BackendError, BackendEvent, KillSignal, ProcessBackend, ProcessHandle, ResizeOutcome,
    SpawnRequest, SYNTHETIC_FAILURE_CODE,
};
use super::buffer::OutputBuffer;
use super::sink::{ConnectionId, Delivery, Sink};

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// A session with this ID already exists.
    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),

    /// The session's process has already stopped.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// The working directory is not an existing absolute directory.
    #[error("invalid working directory: {}", .0.display())]
    InvalidWorkingDirectory(PathBuf),

    /// Too many sessions are running.
    #[error("session limit reached ({0} running)")]
    LimitReached(usize),

    /// The process could not be started.
    #[error("failed to spawn session: {0}")]
    SpawnFailed(#[source] BackendError),

    /// Failed to write to the process.
    #[error("failed to write to session: {0}")]
    WriteFailed(String),

    /// Failed to resize the terminal.
    #[error("failed to resize session: {0}")]
    ResizeFailed(String),

    /// Failed to signal the process.
    #[error("failed to kill session: {0}")]
    KillFailed(String),
}

/// What happened when a sink attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOutcome {
    /// Bytes replayed from the output buffer.
    pub replayed: usize,
    /// Connection that lost the attachment, if another one held it.
    pub displaced: Option<ConnectionId>,
    /// Whether the sink now receives live output. False for a stopped session.
    pub live: bool,
}

struct SessionState {
    status: SessionStatus,
    exit_code: Option<i32>,
    buffer: OutputBuffer,
    sink: Option<Sink>,
    cols: u16,
    rows: u16,
}

/// A hosted process.
pub struct Session {
    id: SessionId,
    tool: Option<String>,
    command: String,
    args: Vec<String>,
    working_directory: PathBuf,
    created_at: SystemTime,
    handle: Box<dyn ProcessHandle>,
    state: Mutex<SessionState>,
    stopped: CancellationToken,
}

impl Session {
    /// Spawns the process described by `request` and starts the event pump.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        id: SessionId,
        tool: Option<String>,
        request: SpawnRequest,
        backend: &dyn ProcessBackend,
        buffer_capacity: usize,
    ) -> Result<Arc<Self>, SessionError> {
        let spawned = backend.spawn(&request).map_err(SessionError::SpawnFailed)?;

        let session = Arc::new(Session {
            id,
            tool,
            command: request.command,
            args: request.args,
            working_directory: request.cwd,
            created_at: SystemTime::now(),
            handle: spawned.handle,
            state: Mutex::new(SessionState {
                status: SessionStatus::Running,
                exit_code: None,
                buffer: OutputBuffer::new(buffer_capacity),
                sink: None,
                cols: request.cols,
                rows: request.rows,
            }),
            stopped: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&session).pump(spawned.events));

        tracing::info!(
            session_id = %session.id,
            pid = ?session.pid(),
            command = %session.command,
            backend = %backend.kind(),
            "Spawned session process"
        );

        Ok(session)
    }

    async fn pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<BackendEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                BackendEvent::Data(chunk) => self.on_data(&chunk),
                BackendEvent::Exit(code) => {
                    self.on_exit(code);
                    return;
                }
            }
        }
        tracing::warn!(session_id = %self.id, "Backend closed without reporting exit");
        self.on_exit(SYNTHETIC_FAILURE_CODE);
    }

    fn on_data(&self, chunk: &[u8]) {
        let mut state = self.state.lock();
        if state.status == SessionStatus::Stopped {
            return;
        }
        state.buffer.push(chunk);

        let delivery = state.sink.as_ref().map(|sink| {
            sink.send(ServerMessage::Output {
                session_id: self.id.clone(),
                data: chunk.to_vec(),
            })
        });
        match delivery {
            None | Some(Delivery::Queued) => {}
            // viewer vanished without detaching
            Some(Delivery::Closed) => state.sink = None,
            Some(Delivery::Full) => {
                if let Some(sink) = state.sink.take() {
                    tracing::warn!(
                        session_id = %self.id,
                        connection = %sink.connection(),
                        "Viewer fell behind, detaching"
                    );
                    self.notify_overflow(&sink);
                }
            }
        }
    }

    fn notify_overflow(&self, sink: &Sink) {
        sink.send_final(ServerMessage::Detached {
            session_id: self.id.clone(),
            reason: DetachReason::Overflow,
        });
    }

    fn on_exit(&self, code: i32) {
        {
            let mut state = self.state.lock();
            if state.status == SessionStatus::Stopped {
                return;
            }
            state.status = SessionStatus::Stopped;
            state.exit_code = Some(code);
            if let Some(sink) = state.sink.take() {
                sink.send_final(ServerMessage::Exit {
                    session_id: self.id.clone(),
                    code,
                });
            }
        }
        self.handle.release();
        self.stopped.cancel();

        tracing::info!(session_id = %self.id, exit_code = code, "Session stopped");
    }

    /// Makes `sink` the session's viewer.
    ///
    /// The buffered output is replayed first, all under the state lock, so
    /// nothing emitted afterwards can overtake it. A previous viewer on a
    /// different connection is told it was displaced. On a stopped session
    /// the replay is followed by the exit code and the sink is not kept.
    pub fn attach(&self, sink: Sink) -> AttachOutcome {
        let mut state = self.state.lock();

        let replay = state.buffer.snapshot();
        let replayed = replay.len();
        if !replay.is_empty() {
            let delivery = sink.send(ServerMessage::Output {
                session_id: self.id.clone(),
                data: replay,
            });
            if delivery == Delivery::Full {
                self.notify_overflow(&sink);
                return AttachOutcome {
                    replayed: 0,
                    displaced: None,
                    live: false,
                };
            }
        }

        if state.status == SessionStatus::Stopped {
            sink.send_final(ServerMessage::Exit {
                session_id: self.id.clone(),
                code: state.exit_code.unwrap_or(SYNTHETIC_FAILURE_CODE),
            });
            return AttachOutcome {
                replayed,
                displaced: None,
                live: false,
            };
        }

        let connection = sink.connection().clone();
        let displaced = state
            .sink
            .replace(sink)
            .filter(|previous| previous.connection() != &connection)
            .map(|previous| {
                previous.send_final(ServerMessage::Detached {
                    session_id: self.id.clone(),
                    reason: DetachReason::AttachedElsewhere,
                });
                previous.connection().clone()
            });
        drop(state);

        tracing::debug!(
            session_id = %self.id,
            connection = %connection,
            replayed = replayed,
            displaced = ?displaced,
            "Viewer attached"
        );

        AttachOutcome {
            replayed,
            displaced,
            live: true,
        }
    }

    /// Removes the sink if `connection` owns it. Returns whether it did.
    pub fn detach(&self, connection: &str) -> bool {
        let mut state = self.state.lock();
        let owned = state
            .sink
            .as_ref()
            .is_some_and(|sink| sink.connection() == connection);
        if owned {
            state.sink = None;
            tracing::debug!(session_id = %self.id, connection = %connection, "Viewer detached");
        }
        owned
    }

    /// Queues input for the process.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }
        self.handle
            .write(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    /// Changes the terminal size. Backends without resize support accept
    /// the request and report [`ResizeOutcome::Unsupported`].
    pub fn resize(&self, cols: u16, rows: u16) -> Result<ResizeOutcome, SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }
        let outcome = self
            .handle
            .resize(cols, rows)
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        let mut state = self.state.lock();
        state.cols = cols;
        state.rows = rows;
        drop(state);

        tracing::debug!(
            session_id = %self.id,
            cols = cols,
            rows = rows,
            outcome = ?outcome,
            "Resized session"
        );
        Ok(outcome)
    }

    /// Signals the process. The session stops once the backend reports
    /// the exit.
    pub fn kill(&self, signal: KillSignal) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }
        self.handle
            .kill(signal)
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;
        tracing::debug!(session_id = %self.id, signal = ?signal, "Signalled session");
        Ok(())
    }

    /// Resolves once the session has stopped.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Tool the session was created for, if any.
    pub fn tool(&self) -> Option<&str> {
        self.tool.as_deref()
    }

    /// The executable that was launched.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == SessionStatus::Running
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.lock().exit_code
    }

    /// Current terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        let state = self.state.lock();
        (state.cols, state.rows)
    }

    /// Connection currently receiving live output.
    pub fn attached_connection(&self) -> Option<ConnectionId> {
        self.state
            .lock()
            .sink
            .as_ref()
            .map(|sink| sink.connection().clone())
    }

    /// Copy of the buffered output.
    pub fn buffered_output(&self) -> Vec<u8> {
        self.state.lock().buffer.snapshot()
    }

    /// Point-in-time description for listings.
    pub fn summary(&self) -> SessionSummary {
        let (status, exit_code) = {
            let state = self.state.lock();
            (state.status, state.exit_code)
        };
        SessionSummary {
            id: self.id.clone(),
            process_id: self.pid(),
            tool_name: self.tool.clone(),
            working_directory: self.working_directory.clone(),
            status,
            created_at: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            exit_code,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::backend::{BackendKind, PipeBackend, SpawnedProcess};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh(script: &str) -> SpawnRequest {
        SpawnRequest {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            env: vec![],
            cols: 80,
            rows: 24,
        }
    }

    fn spawn(script: &str) -> Arc<Session> {
        Session::spawn(
            "test-session".to_string(),
            None,
            sh(script),
            &PipeBackend::new(),
            1024,
        )
        .unwrap()
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("sink closed")
    }

    async fn wait_stopped(session: &Session) {
        timeout(Duration::from_secs(5), session.stopped())
            .await
            .expect("session did not stop");
    }

    #[tokio::test]
    async fn test_output_is_buffered_without_sink() {
        let session = spawn("printf hello");
        wait_stopped(&session).await;
        assert_eq!(session.buffered_output(), b"hello");
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert_eq!(session.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_attach_replays_then_streams_live() {
        let session = spawn("printf A; read x; printf B");
        // let the first chunk land in the buffer
        for _ in 0..100 {
            if !session.buffered_output().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (sink, mut rx) = Sink::new("conn-1".to_string());
        let outcome = session.attach(sink);
        assert_eq!(outcome.replayed, 1);
        assert!(outcome.live);

        session.write(b"go\n").unwrap();

        let mut seen = Vec::new();
        loop {
            match next(&mut rx).await {
                ServerMessage::Output { data, .. } => seen.extend_from_slice(&data),
                ServerMessage::Exit { code, .. } => {
                    assert_eq!(code, 0);
                    break;
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(seen, b"AB");
        assert_eq!(session.attached_connection(), None);
    }

    #[tokio::test]
    async fn test_second_attach_displaces_first() {
        let session = spawn("read x; printf after");
        let (first, mut first_rx) = Sink::new("conn-1".to_string());
        let (second, mut second_rx) = Sink::new("conn-2".to_string());

        session.attach(first);
        let outcome = session.attach(second);
        assert_eq!(outcome.displaced, Some("conn-1".to_string()));

        assert_eq!(
            next(&mut first_rx).await,
            ServerMessage::Detached {
                session_id: "test-session".to_string(),
                reason: DetachReason::AttachedElsewhere,
            }
        );

        session.write(b"\n").unwrap();
        assert!(matches!(next(&mut second_rx).await, ServerMessage::Output { .. }));
        wait_stopped(&session).await;
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reattach_same_connection_is_silent() {
        let session = spawn("read x");
        let (sink, mut rx) = Sink::new("conn-1".to_string());
        session.attach(sink.clone());
        let outcome = session.attach(sink);
        assert_eq!(outcome.displaced, None);
        assert!(rx.try_recv().is_err());
        session.kill(KillSignal::Force).unwrap();
        wait_stopped(&session).await;
    }

    #[tokio::test]
    async fn test_detach_only_by_owner() {
        let session = spawn("read x");
        let (sink, _rx) = Sink::new("conn-1".to_string());
        session.attach(sink);

        assert!(!session.detach("conn-2"));
        assert_eq!(session.attached_connection(), Some("conn-1".to_string()));
        assert!(session.detach("conn-1"));
        assert!(!session.detach("conn-1"));
        assert_eq!(session.attached_connection(), None);

        session.kill(KillSignal::Force).unwrap();
        wait_stopped(&session).await;
    }

    #[tokio::test]
    async fn test_attach_to_stopped_session() {
        let session = spawn("printf done; exit 7");
        wait_stopped(&session).await;

        let (sink, mut rx) = Sink::new("conn-1".to_string());
        let outcome = session.attach(sink);
        assert!(!outcome.live);
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Output {
                session_id: "test-session".to_string(),
                data: b"done".to_vec(),
            }
        );
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Exit {
                session_id: "test-session".to_string(),
                code: 7,
            }
        );
        assert_eq!(session.attached_connection(), None);
    }

    #[tokio::test]
    async fn test_stopped_session_rejects_io() {
        let session = spawn("exit 0");
        wait_stopped(&session).await;
        assert!(matches!(
            session.write(b"x"),
            Err(SessionError::AlreadyTerminated(_))
        ));
        assert!(matches!(
            session.resize(10, 10),
            Err(SessionError::AlreadyTerminated(_))
        ));
        assert!(matches!(
            session.kill(KillSignal::Terminate),
            Err(SessionError::AlreadyTerminated(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_code_set_once() {
        let session = spawn("exit 3");
        wait_stopped(&session).await;
        session.on_exit(99);
        assert_eq!(session.exit_code(), Some(3));
        assert_eq!(session.status(), SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_resize_on_pipe_is_unsupported_but_recorded() {
        let session = spawn("read x");
        assert_eq!(session.resize(132, 50).unwrap(), ResizeOutcome::Unsupported);
        assert_eq!(session.size(), (132, 50));
        session.kill(KillSignal::Force).unwrap();
        wait_stopped(&session).await;
    }

    #[tokio::test]
    async fn test_buffer_respects_capacity() {
        let session = Session::spawn(
            "cap".to_string(),
            None,
            sh("i=0; while [ $i -lt 100 ]; do printf 0123456789; i=$((i+1)); done"),
            &PipeBackend::new(),
            64,
        )
        .unwrap();
        wait_stopped(&session).await;
        let buffered = session.buffered_output();
        assert_eq!(buffered.len(), 64);
        assert!(buffered.ends_with(b"0123456789"));
    }

    #[tokio::test]
    async fn test_closed_sink_is_dropped() {
        let session = spawn("read x; printf late; read y");
        let (sink, rx) = Sink::new("conn-1".to_string());
        session.attach(sink);
        drop(rx);

        session.write(b"\n").unwrap();
        for _ in 0..100 {
            if session.attached_connection().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.attached_connection(), None);
        session.kill(KillSignal::Force).unwrap();
        wait_stopped(&session).await;
    }

    #[tokio::test]
    async fn test_summary() {
        let session = Session::spawn(
            "sum".to_string(),
            Some("shell".to_string()),
            sh("read x"),
            &PipeBackend::new(),
            1024,
        )
        .unwrap();
        let summary = session.summary();
        assert_eq!(summary.id, "sum");
        assert_eq!(summary.tool_name.as_deref(), Some("shell"));
        assert_eq!(summary.status, SessionStatus::Running);
        assert!(summary.process_id.is_some());
        assert!(summary.created_at > 0);
        assert_eq!(summary.exit_code, None);

        session.kill(KillSignal::Terminate).unwrap();
        wait_stopped(&session).await;
        assert!(session.summary().exit_code.is_some());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let mut request = sh("true");
        request.command = "definitely-not-a-real-command-42".to_string();
        let result = Session::spawn("x".to_string(), None, request, &PipeBackend::new(), 1024);
        assert!(matches!(
            result,
            Err(SessionError::SpawnFailed(BackendError::CommandNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_stalled_viewer_is_detached() {
        let session = Session::spawn(
            "flood".to_string(),
            None,
            sh("head -c 2000000 /dev/zero"),
            &PipeBackend::new(),
            1024,
        )
        .unwrap();
        let (sink, mut rx) = Sink::with_capacity("conn-1".to_string(), 4);
        assert!(session.attach(sink).live);

        wait_stopped(&session).await;
        assert_eq!(session.attached_connection(), None);
        assert_eq!(session.buffered_output().len(), 1024);

        let mut queued = Vec::new();
        while let Ok(message) = rx.try_recv() {
            queued.push(message);
        }
        assert!(queued.len() <= 4, "queued {} messages", queued.len());
        assert_eq!(
            queued.last(),
            Some(&ServerMessage::Detached {
                session_id: "flood".to_string(),
                reason: DetachReason::Overflow,
            })
        );
    }

    struct TrackedHandle {
        inner: Box<dyn ProcessHandle>,
        released: Arc<AtomicBool>,
    }

    impl ProcessHandle for TrackedHandle {
        fn pid(&self) -> Option<u32> {
            self.inner.pid()
        }

        fn write(&self, data: &[u8]) -> Result<(), BackendError> {
            self.inner.write(data)
        }

        fn resize(&self, cols: u16, rows: u16) -> Result<ResizeOutcome, BackendError> {
            self.inner.resize(cols, rows)
        }

        fn kill(&self, signal: KillSignal) -> Result<(), BackendError> {
            self.inner.kill(signal)
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
            self.inner.release();
        }
    }

    struct TrackedBackend {
        released: Arc<AtomicBool>,
    }

    impl ProcessBackend for TrackedBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Pipe
        }

        fn supports_resize(&self) -> bool {
            false
        }

        fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, BackendError> {
            let spawned = PipeBackend::new().spawn(request)?;
            Ok(SpawnedProcess {
                handle: Box::new(TrackedHandle {
                    inner: spawned.handle,
                    released: Arc::clone(&self.released),
                }),
                events: spawned.events,
            })
        }
    }

    #[tokio::test]
    async fn test_handle_released_on_exit() {
        let released = Arc::new(AtomicBool::new(false));
        let backend = TrackedBackend {
            released: Arc::clone(&released),
        };
        let session = Session::spawn("rel".to_string(), None, sh("read x"), &backend, 1024).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!released.load(Ordering::SeqCst));

        session.kill(KillSignal::Force).unwrap();
        wait_stopped(&session).await;
        assert!(released.load(Ordering::SeqCst));
    }
}
