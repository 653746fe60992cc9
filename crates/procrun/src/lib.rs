//! procrun Library
//!
//! Supervises a single child process:
//! - Lifecycle state machine (READY → RUNNING → COMPLETED/FAILED/STOPPED)
//! - Combined stdout/stderr capture into an append-only log
//! - Live fan-out of output lines to any number of subscribers
//! - Writing to the child's stdin

pub mod broadcast;
pub mod runner;
pub mod status;

pub use broadcast::OutputSubscription;
pub use runner::{ExitError, Operation, Runner, RunnerConfig, RunnerError};
pub use status::Status;
