//! Error types for the sandbox
//!
//! One flat enum per layer. Script-level failures (`ExecError`) are what
//! callers of `Exec` see; bridge failures never reach the script.

use std::time::Duration;
use thiserror::Error;

/// Failures of the worker thread and its engine
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Script engine error: {0}")]
    Engine(#[from] rquickjs::Error),

    #[error("Sandbox not started")]
    NotStarted,

    #[error("Sandbox already started")]
    AlreadyStarted,

    #[error("Sandbox worker stopped")]
    WorkerStopped,

    #[error("Failed to spawn sandbox worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Outcome of a failed `Exec`
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Runtime error: {message}{}", location(.line, .column))]
    Runtime {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },

    #[error("Interrupted after {elapsed:?}")]
    Interrupted { elapsed: Duration },

    #[error("Session is not running")]
    NotRunning,

    #[error("Session already bootstrapped")]
    AlreadyBootstrapped,

    #[error("Worker stopped before the script finished")]
    WorkerStopped,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

fn location(line: &Option<u32>, column: &Option<u32>) -> String {
    match (*line, *column) {
        (Some(line), Some(column)) => format!(" at {}:{}", line, column),
        (Some(line), None) => format!(" at line {}", line),
        _ => String::new(),
    }
}

impl ExecError {
    /// Short kind tag used on the control wire
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::Compile(_) => "compile",
            ExecError::Runtime { .. } => "runtime",
            ExecError::Interrupted { .. } => "interrupt",
            ExecError::NotRunning | ExecError::AlreadyBootstrapped => "session",
            ExecError::WorkerStopped | ExecError::Sandbox(_) => "sandbox",
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, ExecError::Interrupted { .. })
    }
}

/// Host capability failures, absorbed at the bridge boundary
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("cannot do crossorigin request to {target}")]
    CrossOrigin { target: String },

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Style query failed: {0}")]
    Style(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}
