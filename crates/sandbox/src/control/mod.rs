//! Control protocol - drives one session from outside the process
//!
//! One command per connection, line oriented:
//!
//! ```text
//!   start\n                                  → changed\n<html> | unchanged\n
//!   stop\n                                   → ok\n
//!   click\n<selector>\n                      → changed fired\n<html> | unchanged noaction\n ...
//!   attr\n<selector>\n<name>\n<value>\n      → ok\n
//!   (any failure)                            → error <kind>: <detail>\n
//! ```

pub mod dispatcher;
pub mod protocol;
pub mod server;

use thiserror::Error;

use crate::error::{ExecError, SandboxError};

pub use dispatcher::{handle_client, Dispatcher, StartPlan};
pub use protocol::{Command, Response};
pub use server::ControlServer;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("A session is already active")]
    SessionActive,

    #[error("No active session")]
    NoSession,

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SandboxError> for ControlError {
    fn from(err: SandboxError) -> Self {
        ControlError::Exec(ExecError::Sandbox(err))
    }
}

impl ControlError {
    /// Kind tag of the `error` status line
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::Protocol(_) | ControlError::Io(_) => "protocol",
            ControlError::SessionActive | ControlError::NoSession => "session",
            ControlError::Exec(err) => err.kind(),
        }
    }
}
