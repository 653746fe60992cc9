//! Child-process supervision.
//!
//! A [`Runner`] owns one child process from launch to exit: it drives the
//! lifecycle state machine, captures stdout/stderr into the output log,
//! broadcasts every line to subscribers and forwards input to stdin.

mod config;
mod error;
mod process;
mod stream;

pub use config::RunnerConfig;
pub use error::{ExitError, Operation, RunnerError};
pub use process::Runner;
