//! Native pseudo-terminal backend.
//!
//! Spawns the command on the slave side of a PTY pair and moves all blocking
//! I/O onto dedicated threads: one reader, one writer and one waiter. The
//! waiter only reports the exit once the reader has drained the terminal, so
//! the exit event always follows the last output chunk.

use std::io::{Read, Write};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use super::{
    resolve_executable, BackendError, BackendEvent, BackendKind, KillSignal, ProcessBackend,
    ProcessHandle, ResizeOutcome, SpawnRequest, SpawnedProcess, READ_BUFFER_SIZE,
    SYNTHETIC_FAILURE_CODE,
};

/// How long the waiter gives the reader to drain output after the child exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Hosts processes on a native pseudo-terminal.
#[derive(Debug, Default)]
pub struct PtyBackend;

impl PtyBackend {
    pub fn new() -> Self {
        Self
    }

    /// Returns true if the platform can open a pseudo-terminal.
    pub fn probe() -> bool {
        match native_pty_system().openpty(pty_size(1, 1)) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "PTY probe failed");
                false
            }
        }
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl ProcessBackend for PtyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pty
    }

    fn supports_resize(&self) -> bool {
        true
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, BackendError> {
        let program = resolve_executable(&request.command)?;

        let pair = native_pty_system()
            .openpty(pty_size(request.cols, request.rows))
            .map_err(|e| BackendError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&request.args);
        cmd.cwd(&request.cwd);
        for (key, value) in request.environment() {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BackendError::SpawnFailed(e.to_string()))?;

        // The reader only sees EOF once no slave handle remains in this process.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BackendError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BackendError::SpawnFailed(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (drained_tx, drained_rx) = std_mpsc::channel::<()>();

        spawn_reader(reader, events_tx.clone(), drained_tx)?;
        spawn_writer(writer, input_rx)?;

        thread::Builder::new()
            .name("pty-wait".to_string())
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        tracing::warn!(pid = ?pid, error = %e, "Failed to wait for PTY child");
                        SYNTHETIC_FAILURE_CODE
                    }
                };
                if drained_rx.recv_timeout(READER_DRAIN_TIMEOUT).is_err() {
                    tracing::debug!(pid = ?pid, "PTY reader did not drain before exit");
                }
                let _ = events_tx.send(BackendEvent::Exit(code));
            })
            .map_err(|e| BackendError::SpawnFailed(e.to_string()))?;

        tracing::debug!(pid = ?pid, program = %program.display(), "Spawned PTY process");

        Ok(SpawnedProcess {
            handle: Box::new(PtyHandle {
                pid,
                master: Mutex::new(Some(pair.master)),
                killer: Mutex::new(killer),
                input_tx: Mutex::new(Some(input_tx)),
            }),
            events: events_rx,
        })
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    drained_tx: std_mpsc::Sender<()>,
) -> Result<(), BackendError> {
    thread::Builder::new()
        .name("pty-read".to_string())
        .spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buffer[..n]);
                        if events_tx.send(BackendEvent::Data(chunk)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO once the slave side is gone
                    Err(_) => break,
                }
            }
            let _ = drained_tx.send(());
        })
        .map(|_| ())
        .map_err(|e| BackendError::SpawnFailed(e.to_string()))
}

fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<(), BackendError> {
    thread::Builder::new()
        .name("pty-write".to_string())
        .spawn(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    tracing::debug!(error = %e, "PTY input closed");
                    break;
                }
            }
        })
        .map(|_| ())
        .map_err(|e| BackendError::SpawnFailed(e.to_string()))
}

struct PtyHandle {
    pid: Option<u32>,
    /// Taken on release, closing the terminal.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Taken on release, which ends the writer thread.
    input_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl ProcessHandle for PtyHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&self, data: &[u8]) -> Result<(), BackendError> {
        self.input_tx
            .lock()
            .as_ref()
            .ok_or(BackendError::InputClosed)?
            .send(data.to_vec())
            .map_err(|_| BackendError::InputClosed)
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<ResizeOutcome, BackendError> {
        self.master
            .lock()
            .as_ref()
            .ok_or_else(|| BackendError::ResizeFailed("terminal closed".to_string()))?
            .resize(pty_size(cols, rows))
            .map_err(|e| BackendError::ResizeFailed(e.to_string()))?;
        Ok(ResizeOutcome::Applied)
    }

    fn kill(&self, signal: KillSignal) -> Result<(), BackendError> {
        #[cfg(unix)]
        {
            if let (KillSignal::Force, Some(pid)) = (signal, self.pid) {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                return kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
                    .map_err(|e| BackendError::KillFailed(e.to_string()));
            }
        }
        #[cfg(not(unix))]
        let _ = signal;
        self.killer
            .lock()
            .kill()
            .map_err(|e| BackendError::KillFailed(e.to_string()))
    }

    fn release(&self) {
        self.input_tx.lock().take();
        self.master.lock().take();
        tracing::trace!(pid = ?self.pid, "Released PTY");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh(script: &str) -> SpawnRequest {
        SpawnRequest {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            env: vec![("TEST_VAR".to_string(), "test_value".to_string())],
            cols: 80,
            rows: 24,
        }
    }

    async fn collect(events: &mut mpsc::UnboundedReceiver<BackendEvent>) -> (Vec<u8>, i32) {
        let mut output = Vec::new();
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(BackendEvent::Data(chunk))) => output.extend_from_slice(&chunk),
                Ok(Some(BackendEvent::Exit(code))) => return (output, code),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_probe() {
        assert!(PtyBackend::probe());
    }

    #[tokio::test]
    async fn test_output_then_exit() {
        let mut spawned = PtyBackend::new()
            .spawn(&sh("echo $TEST_VAR; exit 42"))
            .unwrap();
        assert!(spawned.handle.pid().is_some());

        let (output, code) = collect(&mut spawned.events).await;
        assert!(String::from_utf8_lossy(&output).contains("test_value"));
        assert_eq!(code, 42);
    }

    #[tokio::test]
    async fn test_terminal_environment() {
        let mut spawned = PtyBackend::new().spawn(&sh("echo $TERM $COLUMNS")).unwrap();
        let (output, _) = collect(&mut spawned.events).await;
        assert!(String::from_utf8_lossy(&output).contains("xterm-256color 80"));
    }

    #[tokio::test]
    async fn test_write_and_resize() {
        let mut spawned = PtyBackend::new().spawn(&sh("read line; echo got:$line")).unwrap();

        assert_eq!(
            spawned.handle.resize(120, 40).unwrap(),
            ResizeOutcome::Applied
        );
        spawned.handle.write(b"marker\n").unwrap();

        let (output, code) = collect(&mut spawned.events).await;
        assert!(String::from_utf8_lossy(&output).contains("got:marker"));
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_force_kill() {
        let mut spawned = PtyBackend::new().spawn(&sh("sleep 30")).unwrap();
        spawned.handle.kill(KillSignal::Force).unwrap();

        let (_, code) = collect(&mut spawned.events).await;
        assert_ne!(code, 0);
    }

    #[tokio::test]
    async fn test_release_closes_input_and_terminal() {
        let mut spawned = PtyBackend::new().spawn(&sh("exit 0")).unwrap();
        collect(&mut spawned.events).await;

        spawned.handle.release();
        assert!(matches!(
            spawned.handle.write(b"late\n"),
            Err(BackendError::InputClosed)
        ));
        assert!(matches!(
            spawned.handle.resize(100, 30),
            Err(BackendError::ResizeFailed(_))
        ));
        // releasing twice is harmless
        spawned.handle.release();
    }

    #[tokio::test]
    async fn test_missing_command() {
        let mut request = sh("true");
        request.command = "definitely-not-a-real-command-42".to_string();
        let result = PtyBackend::new().spawn(&request);
        assert!(matches!(result, Err(BackendError::CommandNotFound(_))));
    }
}
