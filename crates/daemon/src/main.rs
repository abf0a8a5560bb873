//! Nomacode Daemon
//!
//! Terminal session multiplexer for remote viewers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{get_pid_file_path, get_socket_path, IpcClient, IpcError, IpcResponse, PidFile};
use daemon::orchestrator::DaemonOrchestrator;
use daemon::protocol::SessionSummary;
use daemon::session::KillSignal;
use daemon::tools::ToolStatus;
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Timeout for connecting to the control socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Nomacode Daemon - hosts terminal sessions for remote viewers.
#[derive(Parser, Debug)]
#[command(name = "nomacode-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Kill the daemon immediately (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Seconds to wait for a graceful shutdown
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Show which tools are installed
    Tools {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show one session
    Show {
        /// Session ID
        session_id: String,
    },

    /// Start a new session
    Create {
        /// Working directory (defaults to the daemon user's home)
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,

        /// Tool to launch (defaults to the shell)
        #[arg(long, short)]
        tool: Option<String>,

        /// Terminal columns
        #[arg(long, requires = "rows")]
        cols: Option<u16>,

        /// Terminal rows
        #[arg(long, requires = "cols")]
        rows: Option<u16>,
    },

    /// Kill a session's process; the session stays listed as stopped
    Kill {
        /// Session ID to kill
        session_id: String,

        /// Kill immediately instead of asking the process to terminate
        #[arg(long, short)]
        force: bool,
    },

    /// Kill a session if needed and remove it
    Close {
        /// Session ID to close
        session_id: String,
    },

    /// Replace a session's process with a fresh one
    Restart {
        /// Session ID to restart
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = daemon::logging::init(&config, cli.verbose)?;

    match cli.command {
        Commands::Start => {
            let pid_file = match PidFile::create(&get_pid_file_path()) {
                Ok(pid_file) => pid_file,
                Err(IpcError::AlreadyRunning(pid)) => {
                    eprintln!("Error: Daemon already running (PID: {})", pid);
                    eprintln!();
                    eprintln!("To stop the existing daemon, run:");
                    eprintln!("  nomacode-daemon stop");
                    std::process::exit(1);
                }
                Err(e) => return Err(e).context("Failed to write PID file"),
            };

            tracing::info!("Nomacode daemon starting...");
            let orchestrator = DaemonOrchestrator::new(config)
                .await?
                .with_control_socket(get_socket_path());
            run_daemon(orchestrator, pid_file).await?;
        }
        Commands::Stop { force, timeout } => {
            if force {
                force_stop_daemon()?;
                println!("Daemon forcefully terminated");
            } else {
                graceful_stop_daemon(timeout).await?;
                println!("Daemon stopped successfully");
            }
        }
        Commands::Status => match connect().await?.status().await? {
            IpcResponse::Status {
                running,
                uptime_secs,
                session_count,
                running_sessions,
                connection_count,
                backend,
                gateway_addr,
            } => {
                println!(
                    "Daemon Status: {}",
                    if running { "running" } else { "stopping" }
                );
                println!("  Uptime:   {}", format_duration(uptime_secs));
                println!("  Backend:  {}", backend);
                println!("  Gateway:  ws://{}", gateway_addr);
                println!("  Sessions: {} running, {} total", running_sessions, session_count);
                println!("  Viewers:  {}", connection_count);
            }
            other => return Err(unexpected(other)),
        },
        Commands::Sessions(cmd) => run_sessions_command(cmd).await?,
        Commands::Tools { json } => match connect().await?.list_tools().await? {
            IpcResponse::Tools { tools } => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&tools)?);
                } else {
                    print_tools_table(&tools);
                }
            }
            other => return Err(unexpected(other)),
        },
    }

    Ok(())
}

async fn run_sessions_command(cmd: SessionsCommands) -> anyhow::Result<()> {
    let mut client = connect().await?;

    match cmd {
        SessionsCommands::List { json } => match client.list_sessions().await? {
            IpcResponse::Sessions { sessions } => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&sessions)?);
                } else {
                    print_sessions_table(&sessions);
                }
            }
            other => return Err(unexpected(other)),
        },
        SessionsCommands::Show { session_id } => {
            let session = expect_session(client.get_session(session_id).await?)?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        SessionsCommands::Create {
            cwd,
            tool,
            cols,
            rows,
        } => {
            let cwd = match cwd {
                Some(dir) if dir.is_relative() => Some(std::env::current_dir()?.join(dir)),
                other => other,
            };
            let size = cols.zip(rows);
            let session = expect_session(client.create_session(cwd, tool, size).await?)?;
            println!("Created session {}", session.id);
        }
        SessionsCommands::Kill { session_id, force } => {
            match client.kill_session(session_id, force).await? {
                IpcResponse::SessionKilled { session_id } => {
                    println!("Session {} killed", session_id)
                }
                other => return Err(unexpected(other)),
            }
        }
        SessionsCommands::Close { session_id } => match client.close_session(session_id).await? {
            IpcResponse::SessionClosed { session_id } => println!("Session {} closed", session_id),
            other => return Err(unexpected(other)),
        },
        SessionsCommands::Restart { session_id } => {
            let session = expect_session(client.restart_session(session_id).await?)?;
            println!(
                "Session {} restarted (PID {})",
                session.id,
                session
                    .process_id
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }

    Ok(())
}

/// Runs until a signal or a control `Stop`, then shuts down. A second
/// signal during shutdown kills every session and exits at once.
async fn run_daemon(mut orchestrator: DaemonOrchestrator, pid_file: PidFile) -> anyhow::Result<()> {
    let mut signals = ShutdownSignals::new()?;

    orchestrator.start().await?;
    if let Some(addr) = orchestrator.gateway_addr() {
        println!("Nomacode daemon listening on ws://{}", addr);
    }

    let stop_requested = orchestrator.stop_requested();
    tokio::select! {
        name = signals.recv() => {
            tracing::info!(signal = name, "Received shutdown signal");
        }
        _ = stop_requested.cancelled() => {
            tracing::info!("Shutdown requested by control client");
        }
    }

    let registry = Arc::clone(orchestrator.registry());
    tokio::select! {
        result = orchestrator.stop() => result?,
        name = signals.recv() => {
            tracing::warn!(signal = name, "Received second signal, forcing exit");
            registry.kill_all(KillSignal::Force);
            drop(pid_file);
            let _ = std::fs::remove_file(get_socket_path());
            std::process::exit(1);
        }
    }

    drop(pid_file);
    Ok(())
}

/// SIGTERM and SIGINT listeners.
struct ShutdownSignals {
    sigterm: Signal,
    sigint: Signal,
}

impl ShutdownSignals {
    fn new() -> anyhow::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?,
            sigint: signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

async fn connect() -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(&get_socket_path(), CONNECT_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

fn expect_session(response: IpcResponse) -> anyhow::Result<SessionSummary> {
    match response {
        IpcResponse::Session { session } => Ok(session),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: IpcResponse) -> anyhow::Error {
    match response {
        IpcResponse::Error { message } => anyhow::anyhow!("Daemon returned error: {}", message),
        other => anyhow::anyhow!("Unexpected response from daemon: {:?}", other),
    }
}

/// Gracefully stop the daemon via IPC and wait for it to exit.
async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();
    let mut client = connect().await?;

    println!("Sending shutdown request...");
    match client.stop().await? {
        IpcResponse::Stopping => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        other => return Err(unexpected(other)),
    }
    drop(client);

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }

        if IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Force stop the daemon using SIGKILL.
fn force_stop_daemon() -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = daemon::ipc::get_daemon_pid()
        .ok_or_else(|| anyhow::anyhow!("No running daemon found (PID file missing or stale)"))?;
    let raw = i32::try_from(pid).context("PID out of range")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {})", pid))?;

    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(get_pid_file_path());
    let _ = std::fs::remove_file(get_socket_path());

    Ok(())
}

fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let id_width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(8).max(8);

    println!(
        "{:<id_width$}  {:<8}  {:<12}  {:>8}  {:>10}  DIRECTORY",
        "ID",
        "STATUS",
        "TOOL",
        "PID",
        "CREATED",
        id_width = id_width
    );
    println!("{}", "-".repeat(id_width + 56));

    for session in sessions {
        let status = match session.exit_code {
            Some(code) => format!("{}({})", session.status, code),
            None => session.status.to_string(),
        };
        let pid = session
            .process_id
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<id_width$}  {:<8}  {:<12}  {:>8}  {:>10}  {}",
            session.id,
            status,
            truncate_str(session.tool_name.as_deref().unwrap_or("shell"), 12),
            pid,
            format_relative_time(session.created_at),
            session.working_directory.display(),
            id_width = id_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

fn print_tools_table(tools: &[ToolStatus]) {
    println!("{:<12}  {:<16}  STATUS", "TOOL", "NAME");
    println!("{}", "-".repeat(48));
    for tool in tools {
        println!(
            "{:<12}  {:<16}  {}",
            tool.name, tool.display_name, tool.availability
        );
        if !tool.availability.is_available() {
            if let Some(install) = &tool.install_command {
                println!("{:<12}  install: {}", "", install);
            }
        }
    }
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
