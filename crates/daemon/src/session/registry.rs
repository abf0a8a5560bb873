//! Registry of all sessions.
//!
//! This module provides a thread-safe registry that creates, looks up,
//! restarts and tears down sessions concurrently. The process backend is
//! chosen once at startup and handed in explicitly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use protocol::SessionSummary;

use super::backend::{BackendKind, KillSignal, ProcessBackend, SpawnRequest};
use super::buffer::DEFAULT_BUFFER_CAPACITY;
use super::instance::{Session, SessionError, SessionId};
use crate::tools::ToolRegistry;

/// Default terminal columns.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal rows.
pub const DEFAULT_ROWS: u16 = 24;

/// How long to wait for exits after a forced kill during shutdown.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(1);

/// Limits and defaults applied to every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Maximum number of running sessions; 0 means unlimited.
    pub max_sessions: usize,
    /// Output bytes retained per session for replay.
    pub buffer_capacity: usize,
    /// Terminal size used when a request does not give one.
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_sessions: 0,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            default_cols: DEFAULT_COLS,
            default_rows: DEFAULT_ROWS,
        }
    }
}

/// Parameters for creating a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnParams {
    /// Absolute working directory; the home directory when unset.
    pub working_directory: Option<PathBuf>,
    /// Tool to launch; the default shell when unset.
    pub tool: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl SpawnParams {
    /// Parameters for the default shell in `working_directory`.
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: Some(working_directory.into()),
            ..Default::default()
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = Some(cols);
        self.rows = Some(rows);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Thread-safe session registry using DashMap.
///
/// Stopped sessions stay registered, with their output and exit code, until
/// deleted. Deleted sessions whose process has not exited yet are tracked
/// until it does, so shutdown still reaches them.
pub struct SessionRegistry {
    /// Map of session ID to session.
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Deleted sessions that were still running when removed.
    draining: Mutex<Vec<Arc<Session>>>,
    /// Creations admitted under `max_sessions` but not registered yet.
    pending: Mutex<usize>,
    backend: Arc<dyn ProcessBackend>,
    tools: Arc<ToolRegistry>,
    settings: SessionSettings,
}

impl SessionRegistry {
    /// Creates an empty registry that spawns through `backend`.
    pub fn new(
        backend: Arc<dyn ProcessBackend>,
        tools: Arc<ToolRegistry>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            draining: Mutex::new(Vec::new()),
            pending: Mutex::new(0),
            backend,
            tools,
            settings,
        }
    }

    /// The active process backend.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Creates and registers a session under `id`.
    ///
    /// Nothing is registered if the process fails to start. The process is
    /// spawned without holding any map lock.
    pub fn create(&self, id: SessionId, params: SpawnParams) -> Result<Arc<Session>, SessionError> {
        let cwd = match params.working_directory {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| SessionError::InvalidWorkingDirectory(PathBuf::new()))?,
        };
        if !cwd.is_absolute() || !cwd.is_dir() {
            return Err(SessionError::InvalidWorkingDirectory(cwd));
        }

        if self.sessions.contains_key(&id) {
            return Err(SessionError::AlreadyExists(id));
        }
        let admission = self.admit()?;

        let (command, args) = self.tools.resolve(params.tool.as_deref());
        let request = SpawnRequest {
            command,
            args,
            cwd,
            env: params.env,
            cols: params.cols.unwrap_or(self.settings.default_cols),
            rows: params.rows.unwrap_or(self.settings.default_rows),
        };

        let session = Session::spawn(
            id,
            params.tool,
            request,
            self.backend.as_ref(),
            self.settings.buffer_capacity,
        )?;
        if let Err(session) = self.register(admission, Arc::clone(&session)) {
            // lost a race for the same ID
            if let Err(e) = session.kill(KillSignal::Force) {
                tracing::warn!(session_id = %session.id(), error = %e, "Failed to kill duplicate session");
            }
            return Err(SessionError::AlreadyExists(session.id().to_string()));
        }

        let (cols, rows) = session.size();
        tracing::info!(
            session_id = %session.id(),
            pid = ?session.pid(),
            tool = ?session.tool(),
            cwd = %session.working_directory().display(),
            cols = cols,
            rows = rows,
            "Created new session"
        );

        Ok(session)
    }

    /// Reserves a running slot under `max_sessions`.
    fn admit(&self) -> Result<Admission<'_>, SessionError> {
        let mut pending = self.pending.lock();
        if self.settings.max_sessions > 0 {
            let taken = self.running_count() + *pending;
            if taken >= self.settings.max_sessions {
                return Err(SessionError::LimitReached(taken));
            }
        }
        *pending += 1;
        Ok(Admission {
            pending: &self.pending,
            settled: false,
        })
    }

    /// Inserts a freshly spawned session, handing it back if the ID was
    /// taken meanwhile. The reservation is settled under the same lock so
    /// the slot is never counted twice.
    fn register(
        &self,
        mut admission: Admission<'_>,
        session: Arc<Session>,
    ) -> Result<(), Arc<Session>> {
        let mut pending = self.pending.lock();
        let result = match self.sessions.entry(session.id().to_string()) {
            Entry::Occupied(_) => Err(session),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        };
        *pending -= 1;
        admission.settled = true;
        result
    }

    /// Looks up a session.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Looks up a session, failing with [`SessionError::NotFound`].
    pub fn require(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Summaries of every session, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Signals a session's process but keeps the entry.
    pub fn kill(&self, id: &str, signal: KillSignal) -> Result<(), SessionError> {
        self.require(id)?.kill(signal)
    }

    /// Removes a session, terminating it first if it is still running.
    ///
    /// Returns the removed session, or `None` if `id` was unknown.
    pub fn delete(&self, id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        if session.is_running() {
            if let Err(e) = session.kill(KillSignal::Terminate) {
                tracing::warn!(session_id = %id, error = %e, "Failed to terminate deleted session");
            }
            let mut draining = self.draining.lock();
            draining.retain(|s| s.is_running());
            draining.push(Arc::clone(&session));
        }
        tracing::info!(session_id = %id, "Session removed");
        Some(session)
    }

    /// Replaces a session with a fresh process under the same ID, working
    /// directory, tool and terminal size.
    pub fn restart(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let old = self.require(id)?;
        let (cols, rows) = old.size();
        let params = SpawnParams {
            working_directory: Some(old.working_directory().to_path_buf()),
            tool: old.tool().map(str::to_string),
            cols: Some(cols),
            rows: Some(rows),
            env: Vec::new(),
        };

        self.delete(id);
        tracing::info!(session_id = %id, "Restarting session");
        self.create(id.to_string(), params)
    }

    /// Signals every running session, including deleted ones that have not
    /// exited yet. Entries are kept.
    ///
    /// Returns how many sessions were signalled.
    pub fn kill_all(&self, signal: KillSignal) -> usize {
        let running: Vec<_> = self
            .all_sessions()
            .into_iter()
            .filter(|session| session.is_running())
            .collect();

        let mut signalled = 0;
        for session in running {
            match session.kill(signal) {
                Ok(()) => signalled += 1,
                // exited in the meantime
                Err(SessionError::AlreadyTerminated(_)) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session.id(), error = %e, "Failed to signal session")
                }
            }
        }
        signalled
    }

    /// Terminates every session, forcing those still running after `grace`.
    ///
    /// Returns true if every session stopped within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let signalled = self.kill_all(KillSignal::Terminate);
        if signalled == 0 {
            return true;
        }
        tracing::info!(sessions = signalled, grace = ?grace, "Terminating sessions");

        if tokio::time::timeout(grace, self.wait_all_stopped()).await.is_ok() {
            return true;
        }

        let forced = self.kill_all(KillSignal::Force);
        tracing::warn!(sessions = forced, "Sessions did not stop in time, killing");
        if tokio::time::timeout(FORCE_KILL_WAIT, self.wait_all_stopped())
            .await
            .is_err()
        {
            tracing::error!("Some sessions survived a forced kill");
        }
        false
    }

    async fn wait_all_stopped(&self) {
        for session in self.all_sessions() {
            session.stopped().await;
        }
    }

    /// Registered sessions plus deleted ones still running.
    fn all_sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut draining = self.draining.lock();
        draining.retain(|s| s.is_running());
        sessions.extend(draining.iter().cloned());
        sessions
    }

    /// Number of deleted sessions whose process has not exited yet.
    pub fn draining_count(&self) -> usize {
        let mut draining = self.draining.lock();
        draining.retain(|s| s.is_running());
        draining.len()
    }

    /// Total number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions whose process is still running.
    pub fn running_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_running())
            .count()
    }
}

/// A running slot reserved by [`SessionRegistry::admit`]. Released on drop
/// unless the session was registered.
struct Admission<'a> {
    pending: &'a Mutex<usize>,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            *self.pending.lock() -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::backend::PipeBackend;
    use crate::session::sink::Sink;
    use protocol::{ServerMessage, SessionStatus};
    use tokio::time::timeout;

    fn registry_with(settings: SessionSettings) -> SessionRegistry {
        SessionRegistry::new(
            Arc::new(PipeBackend::new()),
            Arc::new(ToolRegistry::new(Some("/bin/sh".to_string()), Duration::from_secs(30))),
            settings,
        )
    }

    fn registry() -> SessionRegistry {
        registry_with(SessionSettings::default())
    }

    fn tmp() -> SpawnParams {
        SpawnParams::new(std::env::temp_dir())
    }

    async fn wait_stopped(session: &Session) {
        timeout(Duration::from_secs(5), session.stopped())
            .await
            .expect("session did not stop");
    }

    #[tokio::test]
    async fn test_registry_create_session() {
        let registry = registry();
        let session = registry.create("a".to_string(), tmp()).unwrap();

        assert_eq!(session.id(), "a");
        assert_eq!(session.command(), "/bin/sh");
        assert_eq!(session.size(), (DEFAULT_COLS, DEFAULT_ROWS));
        assert!(registry.get("a").is_some());
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.backend_kind(), BackendKind::Pipe);

        registry.kill_all(KillSignal::Force);
    }

    #[tokio::test]
    async fn test_registry_duplicate_id() {
        let registry = registry();
        registry.create("a".to_string(), tmp()).unwrap();
        let result = registry.create("a".to_string(), tmp());
        assert!(matches!(result, Err(SessionError::AlreadyExists(_))));
        assert_eq!(registry.count(), 1);
        registry.kill_all(KillSignal::Force);
    }

    #[tokio::test]
    async fn test_registry_invalid_working_directory() {
        let registry = registry();
        let relative = registry.create("a".to_string(), SpawnParams::new("relative/dir"));
        assert!(matches!(relative, Err(SessionError::InvalidWorkingDirectory(_))));
        let missing = registry.create("b".to_string(), SpawnParams::new("/nonexistent/nomacode"));
        assert!(matches!(missing, Err(SessionError::InvalidWorkingDirectory(_))));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_registry_spawn_failure_registers_nothing() {
        let registry = SessionRegistry::new(
            Arc::new(PipeBackend::new()),
            Arc::new(ToolRegistry::new(
                Some("definitely-not-a-real-shell-42".to_string()),
                Duration::from_secs(30),
            )),
            SessionSettings::default(),
        );
        let result = registry.create("a".to_string(), tmp());
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
        assert!(registry.get("a").is_none());
    }

    #[tokio::test]
    async fn test_registry_limit() {
        let registry = registry_with(SessionSettings {
            max_sessions: 1,
            ..Default::default()
        });
        registry.create("a".to_string(), tmp()).unwrap();
        let result = registry.create("b".to_string(), tmp());
        assert!(matches!(result, Err(SessionError::LimitReached(1))));

        // stopped sessions do not count against the limit
        let a = registry.get("a").unwrap();
        registry.kill("a", KillSignal::Force).unwrap();
        wait_stopped(&a).await;
        registry.create("b".to_string(), tmp()).unwrap();
        registry.kill_all(KillSignal::Force);
    }

    #[tokio::test]
    async fn test_registry_kill_keeps_entry() {
        let registry = registry();
        let session = registry.create("a".to_string(), tmp()).unwrap();
        registry.kill("a", KillSignal::Terminate).unwrap();
        wait_stopped(&session).await;

        let summary = &registry.list()[0];
        assert_eq!(summary.status, SessionStatus::Stopped);
        assert!(summary.exit_code.is_some());
        assert!(registry.get("a").is_some());
    }

    #[tokio::test]
    async fn test_registry_kill_nonexistent() {
        let registry = registry();
        let result = registry.kill("nonexistent", KillSignal::Terminate);
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_registry_delete() {
        let registry = registry();
        registry.create("a".to_string(), tmp()).unwrap();

        let removed = registry.delete("a").unwrap();
        assert!(registry.get("a").is_none());
        wait_stopped(&removed).await;
        assert_eq!(registry.draining_count(), 0);

        assert!(registry.delete("a").is_none());
    }

    #[tokio::test]
    async fn test_registry_shutdown_reaches_deleted_sessions() {
        let registry = registry();
        // ignores SIGTERM, so delete alone leaves it running
        registry
            .create("a".to_string(), tmp())
            .unwrap()
            .write(b"trap '' TERM; exec sleep 30\n")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let removed = registry.delete("a").unwrap();
        assert_eq!(registry.count(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(removed.is_running());
        assert_eq!(registry.draining_count(), 1);

        let clean = registry.shutdown(Duration::from_millis(300)).await;
        assert!(!clean);
        wait_stopped(&removed).await;
        assert!(!removed.is_running());
        assert_eq!(registry.draining_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_registry_limit_holds_under_concurrent_creates() {
        let registry = Arc::new(registry_with(SessionSettings {
            max_sessions: 2,
            ..Default::default()
        }));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    registry.create(format!("s{}", i), tmp())
                })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert!(matches!(e, SessionError::LimitReached(_)), "{:?}", e),
            }
        }
        assert_eq!(created, 2);
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.running_count(), 2);

        registry.kill_all(KillSignal::Force);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_registry_concurrent_creates_same_id() {
        let registry = Arc::new(registry());
        let barrier = Arc::new(std::sync::Barrier::new(4));
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    registry.create("a".to_string(), tmp())
                })
            })
            .collect();

        let mut winners = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(session) => winners.push(session),
                Err(e) => assert!(matches!(e, SessionError::AlreadyExists(_)), "{:?}", e),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(registry.count(), 1);
        assert!(Arc::ptr_eq(&registry.get("a").unwrap(), &winners[0]));

        registry.kill_all(KillSignal::Force);
    }

    #[tokio::test]
    async fn test_registry_list() {
        let registry = registry();
        registry.create("a".to_string(), tmp()).unwrap();
        registry
            .create("b".to_string(), tmp().with_tool("shell").with_size(100, 30))
            .unwrap();

        let list = registry.list();
        assert_eq!(list.len(), 2);
        let ids: Vec<_> = list.iter().map(|s| s.id.as_str()).collect();
        assert!(ids.contains(&"a"));
        assert!(ids.contains(&"b"));
        let b = list.iter().find(|s| s.id == "b").unwrap();
        assert_eq!(b.tool_name.as_deref(), Some("shell"));

        registry.kill_all(KillSignal::Force);
    }

    #[tokio::test]
    async fn test_registry_restart_keeps_identity() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        let first = registry
            .create(
                "a".to_string(),
                SpawnParams::new(dir.path()).with_tool("shell").with_size(120, 40),
            )
            .unwrap();
        let first_pid = first.pid();

        let second = registry.restart("a").unwrap();
        wait_stopped(&first).await;

        assert_eq!(second.id(), "a");
        assert_eq!(second.working_directory(), dir.path());
        assert_eq!(second.tool(), Some("shell"));
        assert_eq!(second.size(), (120, 40));
        assert!(second.is_running());
        assert_ne!(second.pid(), first_pid);
        assert!(Arc::ptr_eq(&registry.get("a").unwrap(), &second));

        registry.kill_all(KillSignal::Force);
    }

    #[tokio::test]
    async fn test_registry_restart_nonexistent() {
        let registry = registry();
        assert!(matches!(
            registry.restart("missing"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_echo_roundtrip() {
        let registry = registry();
        let session = registry.create("a".to_string(), tmp()).unwrap();
        let (sink, mut rx) = Sink::new("conn".to_string());
        session.attach(sink);

        session.write(b"echo roundtrip_test_marker\n").unwrap();

        let mut found = false;
        while let Ok(Some(message)) = timeout(Duration::from_secs(5), rx.recv()).await {
            if let ServerMessage::Output { data, .. } = message {
                if String::from_utf8_lossy(&data).contains("roundtrip_test_marker") {
                    found = true;
                    break;
                }
            }
        }
        assert!(found, "Did not receive expected output");

        registry.kill("a", KillSignal::Terminate).unwrap();
        let mut exit_code = None;
        while let Ok(Some(message)) = timeout(Duration::from_secs(5), rx.recv()).await {
            if let ServerMessage::Exit { code, .. } = message {
                exit_code = Some(code);
                break;
            }
        }
        assert!(exit_code.is_some());
        assert_eq!(session.status(), SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_registry_kill_all_keeps_entries() {
        let registry = registry();
        registry.create("a".to_string(), tmp()).unwrap();
        registry.create("b".to_string(), tmp()).unwrap();
        assert_eq!(registry.running_count(), 2);

        assert_eq!(registry.kill_all(KillSignal::Force), 2);
        assert_eq!(registry.count(), 2);
    }

    #[tokio::test]
    async fn test_registry_env_reaches_process() {
        let registry = registry();
        let session = registry
            .create("a".to_string(), tmp().with_env("NOMACODE_TEST", "env_marker"))
            .unwrap();
        session.write(b"echo $NOMACODE_TEST $TERM; exit\n").unwrap();
        wait_stopped(&session).await;
        let output = String::from_utf8_lossy(&session.buffered_output()).into_owned();
        assert!(output.contains("env_marker xterm-256color"));
    }

    #[tokio::test]
    async fn test_registry_shutdown() {
        let registry = registry();
        registry.create("a".to_string(), tmp()).unwrap();
        // ignores SIGTERM, needs the forced kill
        registry
            .create("b".to_string(), tmp())
            .unwrap()
            .write(b"trap '' TERM; exec sleep 30\n")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let clean = registry.shutdown(Duration::from_millis(300)).await;
        assert!(!clean);
        assert_eq!(registry.running_count(), 0);
        assert_eq!(registry.count(), 2);
    }

    #[tokio::test]
    async fn test_registry_shutdown_empty() {
        assert!(registry().shutdown(Duration::from_millis(10)).await);
    }
}
