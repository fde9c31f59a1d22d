//! Error types for Caravel operations.
//!
//! Four error families cover the whole engine: `configuration` (bad or
//! missing user input), `io` (local filesystem failures), `execution`
//! (a substrate invocation failed), and `internal` (violated invariants
//! that do not depend on user input). Execution errors carry a
//! structured [`ExecContext`] so the CLI front can render the failing
//! command, exit code, and captured output in one piece.

use thiserror::Error;

/// Structured context attached to every `execution` error.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    /// The command line that was invoked, as a single display string.
    pub command: String,
    /// Exit code of the child process, if it exited normally.
    pub exit_code: Option<i32>,
    /// Merged stdout+stderr, when the invocation was captured.
    pub captured_output: Option<String>,
    /// The phase of a multi-step operation that failed (e.g. `sync up`).
    pub phase: Option<String>,
}

impl ExecContext {
    /// Context for a command that exited with a non-zero code.
    #[must_use]
    pub fn new(command: impl Into<String>, exit_code: i32) -> Self {
        Self {
            command: command.into(),
            exit_code: Some(exit_code),
            captured_output: None,
            phase: None,
        }
    }

    /// Attach captured output.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.captured_output = Some(output.into());
        self
    }

    /// Attach the phase of a multi-step operation.
    #[must_use]
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

impl std::fmt::Display for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "command `{}`", self.command)?;
        if let Some(code) = self.exit_code {
            write!(f, " exited with code {code}")?;
        }
        if let Some(phase) = &self.phase {
            write!(f, " during {phase}")?;
        }
        Ok(())
    }
}

/// Errors that can occur in Caravel operations.
#[derive(Debug, Error)]
pub enum CaravelError {
    /// Invalid or missing fields, schema failures, unknown platforms or
    /// tasks, interpolation cycles.
    #[error("configuration error: {message}")]
    Configuration {
        /// What was wrong and where.
        message: String,
    },

    /// Local file or directory operation failed.
    #[error("io error on {path}: {source}")]
    Io {
        /// The path the operation was applied to.
        path: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A substrate invocation failed.
    #[error("execution failed: {0}")]
    Execution(ExecContext),

    /// An invariant that should not depend on user input was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },
}

impl CaravelError {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Shorthand for an io error.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Shorthand for an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Annotate an execution error with a phase; other variants pass
    /// through unchanged.
    #[must_use]
    pub fn in_phase(self, phase: &str) -> Self {
        match self {
            Self::Execution(ctx) => Self::Execution(ctx.with_phase(phase)),
            other => other,
        }
    }
}

/// Result type for Caravel operations.
pub type CaravelResult<T> = Result<T, CaravelError>;
