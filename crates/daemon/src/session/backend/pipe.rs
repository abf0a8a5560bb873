//! Plain-pipe backend.
//!
//! The process gets piped stdin, stdout and stderr; stdout and stderr are
//! interleaved in arrival order. There is no terminal, so resizing is a
//! no-op. The same machinery hosts the `script` wrapper.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    exit_code, resolve_executable, BackendError, BackendEvent, BackendKind, KillSignal,
    ProcessBackend, ProcessHandle, ResizeOutcome, SpawnRequest, SpawnedProcess,
    READ_BUFFER_SIZE, SYNTHETIC_FAILURE_CODE,
};

/// How long the waiter gives the output readers to finish after exit.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Hosts processes on plain pipes.
#[derive(Debug, Default)]
pub struct PipeBackend;

impl PipeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessBackend for PipeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pipe
    }

    fn supports_resize(&self) -> bool {
        false
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, BackendError> {
        let program = resolve_executable(&request.command)?;
        spawn_piped(&program, &request.args, request)
    }
}

/// Starts `program` with piped stdio and wires it to the event stream.
pub(super) fn spawn_piped(
    program: &Path,
    args: &[String],
    request: &SpawnRequest,
) -> Result<SpawnedProcess, BackendError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&request.cwd)
        .envs(request.environment())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| BackendError::SpawnFailed(e.to_string()))?;
    let pid = child.id();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (kill_tx, kill_rx) = mpsc::unbounded_channel::<KillSignal>();

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, events_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, events_tx.clone()));
    }

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                let result = async {
                    stdin.write_all(&data).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = result {
                    tracing::debug!(pid = ?pid, error = %e, "Process input closed");
                    break;
                }
            }
        });
    }

    tokio::spawn(async move {
        let code = wait_for_exit(&mut child, kill_rx, pid).await;
        let drain = futures_util::future::join_all(readers);
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::debug!(pid = ?pid, "Output readers did not drain before exit");
        }
        let _ = events_tx.send(BackendEvent::Exit(code));
    });

    tracing::debug!(pid = ?pid, program = %program.display(), "Spawned piped process");

    Ok(SpawnedProcess {
        handle: Box::new(PipeHandle {
            pid,
            input_tx: Mutex::new(Some(input_tx)),
            kill_tx,
        }),
        events: events_rx,
    })
}

fn spawn_reader<R>(mut stream: R, events_tx: mpsc::UnboundedSender<BackendEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match stream.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buffer[..n]);
                    if events_tx.send(BackendEvent::Data(chunk)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Waits for the child, delivering kill requests as they arrive.
async fn wait_for_exit(
    child: &mut Child,
    mut kill_rx: mpsc::UnboundedReceiver<KillSignal>,
    pid: Option<u32>,
) -> i32 {
    loop {
        tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) => exit_code(status),
                    Err(e) => {
                        tracing::warn!(pid = ?pid, error = %e, "Failed to wait for process");
                        SYNTHETIC_FAILURE_CODE
                    }
                };
            }
            Some(signal) = kill_rx.recv() => {
                if let Err(e) = deliver(child, signal, pid) {
                    tracing::warn!(pid = ?pid, signal = ?signal, error = %e, "Failed to signal process");
                }
            }
        }
    }
}

fn deliver(child: &mut Child, signal: KillSignal, pid: Option<u32>) -> Result<(), BackendError> {
    #[cfg(unix)]
    {
        if let (KillSignal::Terminate, Some(pid)) = (signal, pid) {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            return kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .map_err(|e| BackendError::KillFailed(e.to_string()));
        }
    }
    #[cfg(not(unix))]
    let _ = (signal, pid);
    child
        .start_kill()
        .map_err(|e| BackendError::KillFailed(e.to_string()))
}

struct PipeHandle {
    pid: Option<u32>,
    /// Taken on release, which ends the stdin writer task.
    input_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    kill_tx: mpsc::UnboundedSender<KillSignal>,
}

impl ProcessHandle for PipeHandle {
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

    fn resize(&self, _cols: u16, _rows: u16) -> Result<ResizeOutcome, BackendError> {
        Ok(ResizeOutcome::Unsupported)
    }

    fn kill(&self, signal: KillSignal) -> Result<(), BackendError> {
        // A closed channel means the process already exited.
        let _ = self.kill_tx.send(signal);
        Ok(())
    }

    fn release(&self) {
        self.input_tx.lock().take();
    }
}
