//! Runner lifecycle state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Runner`](crate::Runner).
///
/// `Ready` is initial; `Completed`, `Stopped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ready,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl Status {
    /// Upper-case label, e.g. `"RUNNING"`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_upper_case() {
        assert_eq!(Status::Ready.to_string(), "READY");
        assert_eq!(Status::Running.to_string(), "RUNNING");
        assert_eq!(Status::Completed.to_string(), "COMPLETED");
        assert_eq!(Status::Stopped.to_string(), "STOPPED");
        assert_eq!(Status::Failed.to_string(), "FAILED");
    }

    #[test]
    fn only_end_states_are_terminal() {
        assert!(!Status::Ready.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(Status::Completed.is_terminal());
        assert!(Status::Stopped.is_terminal());
        assert!(Status::Failed.is_terminal());
    }

    #[test]
    fn serializes_as_label() {
        let json = serde_json::to_string(&Status::Stopped).unwrap();
        assert_eq!(json, "\"STOPPED\"");
        let back: Status = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(back, Status::Failed);
    }
}
