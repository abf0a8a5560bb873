//! `script` wrapper backend.
//!
//! When no native PTY is available, the `script` utility can allocate one
//! for the child and relay it over plain pipes. The terminal it creates is
//! not reachable from here, so resizing is a no-op.

use super::pipe::spawn_piped;
use super::{
    resolve_executable, BackendError, BackendKind, ProcessBackend, SpawnRequest, SpawnedProcess,
};

/// Name of the wrapper executable.
pub(super) const SCRIPT_COMMAND: &str = "script";

/// Hosts processes inside `script`.
#[derive(Debug, Default)]
pub struct ScriptBackend;

impl ScriptBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessBackend for ScriptBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Script
    }

    fn supports_resize(&self) -> bool {
        false
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, BackendError> {
        // Fail on the wrapped command synchronously, not inside `script`.
        resolve_executable(&request.command)?;
        let wrapper = resolve_executable(SCRIPT_COMMAND)?;
        spawn_piped(&wrapper, &wrapper_args(&request.command, &request.args), request)
    }
}

/// Arguments for `script` that run `command` quietly, discard the log and
/// exit with the command's status.
///
/// BSD `script` passes the child's status through on its own; util-linux
/// needs `-e`.
fn wrapper_args(command: &str, args: &[String]) -> Vec<String> {
    if cfg!(any(target_os = "macos", target_os = "freebsd")) {
        let mut out = vec!["-q".to_string(), "/dev/null".to_string(), command.to_string()];
        out.extend(args.iter().cloned());
        out
    } else {
        vec![
            "-q".to_string(),
            "-e".to_string(),
            "-c".to_string(),
            command_line(command, args),
            "/dev/null".to_string(),
        ]
    }
}

/// Joins a command and its arguments into one POSIX shell command line.
fn command_line(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@%+,".contains(&b));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
