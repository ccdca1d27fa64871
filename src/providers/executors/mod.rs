//! Executor primitives: run a shell command or perform an HTTP request,
//! both under a deadline. Output is captured in full here; truncation is a
//! presentation concern of the DAG snapshot.

mod http;
mod shell;

pub use http::run_http;
pub use shell::run_shell;

/// User-Agent sent on every HTTP execution.
pub const USER_AGENT: &str = concat!("magpie/", env!("CARGO_PKG_VERSION"));

/// What one primitive execution produced. `error` is `None` on success;
/// a deadline hit is distinguishable from ordinary failure via
/// `timed_out`.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    /// Combined stdout/stderr for shell, response body for HTTP.
    pub output: String,
    pub error: Option<String>,
    /// Numeric status of the HTTP exchange, surfaced separately so the
    /// expectation validator can match on it.
    pub http_status: Option<u16>,
    pub timed_out: bool,
    /// Whether the exchange ran to completion (process exited, response
    /// fully read). Expectation validation only applies to completed
    /// exchanges.
    pub completed: bool,
}

impl ExecOutcome {
    pub fn succeeded(output: String) -> Self {
        ExecOutcome {
            output,
            completed: true,
            ..ExecOutcome::default()
        }
    }

    pub fn failed(output: String, message: String) -> Self {
        ExecOutcome {
            output,
            error: Some(message),
            completed: true,
            ..ExecOutcome::default()
        }
    }

    pub fn timeout() -> Self {
        ExecOutcome {
            error: Some("timeout".to_string()),
            timed_out: true,
            ..ExecOutcome::default()
        }
    }

    /// Transport-level failure: nothing ran to completion, no content to
    /// validate expectations against.
    pub fn aborted(message: String) -> Self {
        ExecOutcome {
            error: Some(message),
            ..ExecOutcome::default()
        }
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}
