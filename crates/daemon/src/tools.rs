//! Tool catalog and availability detection.
//!
//! A tool is a named CLI program a session can host instead of the default
//! shell. Before reporting a tool as available, its executable is run with a
//! harmless flag so binaries built for another CPU or ABI are reported as
//! incompatible rather than installed.

use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Name of the always-available shell tool.
pub const SHELL_TOOL: &str = "shell";

/// How long a single probe invocation may run.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Flags tried in order when probing an executable.
const PROBE_FLAGS: &[&str] = &["--version", "--help"];

/// Failure text that means the binary cannot run on this machine.
const INCOMPATIBLE_SIGNATURES: &[&str] = &[
    "Exec format error",
    "cannot execute",
    "e_type",
    "Bad CPU type",
    "not executable",
];

/// Order in which tools are preferred as the default.
const DEFAULT_PRIORITY: &[&str] = &["claude-code", "opencode", "codex", SHELL_TOOL];

/// Default lifetime of a detection result.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// A known tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolSpec {
    /// Identifier used in session requests.
    pub name: &'static str,
    /// Human-readable name.
    pub display_name: &'static str,
    /// One-line description.
    pub description: &'static str,
    /// Executable, or `None` for the default shell.
    pub command: Option<&'static str>,
    /// How to install the tool.
    pub install_command: Option<&'static str>,
}

/// Every tool the daemon knows how to launch.
pub const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "claude-code",
        display_name: "Claude Code",
        description: "Anthropic's AI coding assistant",
        command: Some("claude"),
        install_command: Some("npm install -g @anthropic-ai/claude-code"),
    },
    ToolSpec {
        name: "opencode",
        display_name: "OpenCode",
        description: "Open-source AI coding assistant",
        command: Some("opencode"),
        install_command: Some("npm install -g opencode-ai"),
    },
    ToolSpec {
        name: "codex",
        display_name: "Codex",
        description: "OpenAI Codex CLI",
        command: Some("codex"),
        install_command: Some("npm install -g @openai/codex"),
    },
    ToolSpec {
        name: SHELL_TOOL,
        display_name: "Shell",
        description: "Standard terminal shell",
        command: None,
        install_command: None,
    },
];

/// Looks up a tool by name.
pub fn find_tool(name: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().find(|tool| tool.name == name)
}

/// Outcome of probing an executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum Availability {
    /// Installed and runnable.
    Available,
    /// Not on `PATH`, or the name is not a plain command name.
    NotInstalled,
    /// Installed but cannot run on this machine.
    Incompatible(String),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Available => f.write_str("available"),
            Availability::NotInstalled => f.write_str("not installed"),
            Availability::Incompatible(reason) => write!(f, "incompatible ({})", reason),
        }
    }
}

/// Checks whether `command` is installed and runs on this machine.
pub async fn probe_command(command: &str) -> Availability {
    if !is_plain_command_name(command) {
        return Availability::NotInstalled;
    }

    let path = match which::which(command) {
        Ok(path) => path,
        Err(_) => return Availability::NotInstalled,
    };

    for flag in PROBE_FLAGS {
        let mut cmd = Command::new(&path);
        cmd.arg(flag)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let failure = match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => return Availability::Available,
            Ok(Ok(output)) => String::from_utf8_lossy(&output.stderr).into_owned(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => {
                tracing::debug!(command = %command, flag = %flag, "Tool probe timed out");
                continue;
            }
        };

        if let Some(signature) = incompatible_signature(&failure) {
            tracing::debug!(command = %command, signature = %signature, "Tool binary incompatible");
            return Availability::Incompatible(signature.to_string());
        }
    }

    // Some tools insist on a subcommand; failing both flags is not fatal.
    Availability::Available
}

fn is_plain_command_name(command: &str) -> bool {
    !command.is_empty()
        && command
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn incompatible_signature(text: &str) -> Option<&'static str> {
    INCOMPATIBLE_SIGNATURES
        .iter()
        .copied()
        .find(|signature| text.contains(signature))
}

/// Detection result for one tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatus {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub install_command: Option<String>,
    pub availability: Availability,
}

impl ToolStatus {
    fn new(spec: &ToolSpec, availability: Availability) -> Self {
        Self {
            name: spec.name.to_string(),
            display_name: spec.display_name.to_string(),
            description: spec.description.to_string(),
            install_command: spec.install_command.map(str::to_string),
            availability,
        }
    }
}

/// Resolves tool names to commands and caches availability.
pub struct ToolRegistry {
    default_shell: String,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<ToolStatus>)>>,
}

impl ToolRegistry {
    /// Creates a registry. Without an explicit shell, `$SHELL` or `/bin/sh`
    /// is used.
    pub fn new(default_shell: Option<String>, cache_ttl: Duration) -> Self {
        Self {
            default_shell: detect_shell(default_shell),
            cache_ttl,
            cache: Mutex::new(None),
        }
    }

    /// The command hosted by the `shell` tool.
    pub fn default_shell(&self) -> &str {
        &self.default_shell
    }

    /// Maps a tool name to `(command, args)`.
    ///
    /// Unknown names and `None` resolve to the default shell.
    pub fn resolve(&self, tool: Option<&str>) -> (String, Vec<String>) {
        match tool.and_then(find_tool).and_then(|spec| spec.command) {
            Some(command) => (command.to_string(), Vec::new()),
            None => {
                if let Some(name) = tool.filter(|name| find_tool(name).is_none()) {
                    tracing::warn!(tool = %name, "Unknown tool, using default shell");
                }
                (self.default_shell.clone(), Vec::new())
            }
        }
    }

    /// Probes every tool, reusing a fresh cached result.
    pub async fn detect(&self) -> Vec<ToolStatus> {
        let cached = self
            .cache
            .lock()
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.cache_ttl)
            .map(|(_, statuses)| statuses.clone());
        if let Some(statuses) = cached {
            return statuses;
        }

        let mut statuses = Vec::with_capacity(TOOLS.len());
        for spec in TOOLS {
            let availability = match spec.command {
                Some(command) => probe_command(command).await,
                None => Availability::Available,
            };
            statuses.push(ToolStatus::new(spec, availability));
        }

        let available = statuses
            .iter()
            .filter(|s| s.availability.is_available())
            .count();
        tracing::debug!(available = available, total = statuses.len(), "Detected tools");

        *self.cache.lock() = Some((Instant::now(), statuses.clone()));
        statuses
    }

    /// Whether `name` can currently be launched. The shell always can.
    pub async fn is_available(&self, name: &str) -> bool {
        if name == SHELL_TOOL {
            return true;
        }
        self.detect()
            .await
            .iter()
            .any(|s| s.name == name && s.availability.is_available())
    }

    /// The most preferred available tool.
    pub async fn default_tool(&self) -> String {
        let statuses = self.detect().await;
        DEFAULT_PRIORITY
            .iter()
            .find(|name| {
                statuses
                    .iter()
                    .any(|s| s.name == **name && s.availability.is_available())
            })
            .unwrap_or(&SHELL_TOOL)
            .to_string()
    }

    /// Forgets cached detection results.
    pub fn clear_cache(&self) {
        *self.cache.lock() = None;
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(None, DEFAULT_CACHE_TTL)
    }
}

/// Picks the shell: the given one, `$SHELL`, then `/bin/sh`.
fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell.filter(|s| !s.is_empty()) {
        return s;
    }

    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}
