//! Child-process execution.
//!
//! The engine emits commands to external tools exactly as a human
//! operator would. Standard streams are inherited for interactive
//! commands (`run`); diagnostic commands collect merged output
//! (`run_and_capture`). Termination signals reach the child through the
//! shared process group; the engine simply waits for the child to exit.

use caravel_core::{CaravelError, CaravelResult, ExecContext};
use tokio::process::Command;
use tracing::debug;

/// What to do when a command exits non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    /// Return the exit code to the caller.
    Ignore,
    /// Fail with an `execution` error carrying the command and code.
    Raise,
    /// Terminate the process with the child's exit code.
    Die,
}

/// Render a command vector as a single display string.
#[must_use]
pub fn format_command(command: &[String]) -> String {
    command.join(" ")
}

/// Execute a command with inherited standard streams.
///
/// # Errors
///
/// Returns an `execution` error when the command cannot be spawned, or
/// (under [`OnError::Raise`]) when it exits non-zero.
pub async fn run(command: &[String], on_error: OnError) -> CaravelResult<i32> {
    let (program, args) = split(command)?;
    debug!(command = %format_command(command), "spawning");

    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|e| spawn_error(command, &e))?;
    let code = status.code().unwrap_or(-1);

    if code != 0 {
        match on_error {
            OnError::Ignore => {},
            OnError::Raise => {
                return Err(CaravelError::Execution(ExecContext::new(
                    format_command(command),
                    code,
                )));
            },
            OnError::Die => {
                debug!(code, "command failed fatally; terminating");
                std::process::exit(code);
            },
        }
    }
    Ok(code)
}

/// Execute a command, collecting merged stdout+stderr.
///
/// The exit code is returned to the caller rather than raised: capture
/// callers inspect output even on failure (e.g. image-presence probes).
///
/// # Errors
///
/// Returns an `execution` error when the command cannot be spawned.
pub async fn run_and_capture(command: &[String]) -> CaravelResult<(i32, String)> {
    let (program, args) = split(command)?;
    debug!(command = %format_command(command), "spawning (captured)");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| spawn_error(command, &e))?;
    let code = output.status.code().unwrap_or(-1);

    let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !merged.is_empty() && !merged.ends_with('\n') {
            merged.push('\n');
        }
        merged.push_str(&stderr);
    }

    Ok((code, merged))
}

fn split(command: &[String]) -> CaravelResult<(&String, &[String])> {
    command
        .split_first()
        .ok_or_else(|| CaravelError::internal("attempted to execute an empty command"))
}

fn spawn_error(command: &[String], e: &std::io::Error) -> CaravelError {
    CaravelError::Execution(
        ExecContext {
            command: format_command(command),
            exit_code: None,
            captured_output: Some(e.to_string()),
            phase: None,
        },
    )
}
