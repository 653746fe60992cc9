//! Runner error types.

use std::fmt;
use std::process::ExitStatus;

use crate::status::Status;

/// Lifecycle operation named in [`RunnerError::InvalidTransition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Wait,
    WriteInput,
    CloseInput,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Wait => "wait for",
            Self::WriteInput => "write input to",
            Self::CloseInput => "close input of",
        })
    }
}

/// Errors from runner operations.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Cannot {operation} a runner in {status} state")]
    InvalidTransition { operation: Operation, status: Status },

    #[error("Failed to spawn process: {reason}")]
    Spawn { reason: String },

    #[error(transparent)]
    Exit(#[from] ExitError),

    #[error("Failed to write process input: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process input is closed")]
    InputClosed,
}

/// Terminal error of a supervised process.
///
/// Cloned to every waiter, so all of them observe the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExitError {
    #[error("Process exited with code {code}")]
    Code { code: i32 },

    #[error("Process terminated by signal {signal}")]
    Signal { signal: i32 },

    #[error("Failed to wait for process: {reason}")]
    Wait { reason: String },

    #[error("Failed to spawn process: {reason}")]
    Spawn { reason: String },

    #[error("Process was stopped")]
    Stopped {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl ExitError {
    /// Error for an unsuccessful exit status.
    pub(crate) fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code { code };
        }
        match exit_signal(status) {
            Some(signal) => Self::Signal { signal },
            None => Self::Wait {
                reason: format!("unrecognised exit status: {status}"),
            },
        }
    }

    /// Error recorded when the runner was stopped before the process exited.
    pub(crate) fn stopped(exit: &std::io::Result<ExitStatus>) -> Self {
        match exit {
            Ok(status) => Self::Stopped {
                code: status.code(),
                signal: exit_signal(*status),
            },
            Err(_) => Self::Stopped {
                code: None,
                signal: None,
            },
        }
    }

    /// Turn a raw wait result into the runner's outcome.
    pub(crate) fn outcome(exit: std::io::Result<ExitStatus>) -> Result<(), Self> {
        match exit {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(Self::from_status(status)),
            Err(e) => Err(Self::Wait {
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
const fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}
