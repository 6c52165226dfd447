//! AN-001: Domain types — groups, cards, documents, run states and sink events.
//!
//! Stored types derive Serialize/Deserialize so the CLI can emit them as JSON.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Stored entities
// ============================================================================

/// A named collection of cards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
}

/// One named script tile, owned by a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: i64,
    pub group_id: i64,
    /// Also the key of the card's document.
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// A group together with its cards, in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardGroup {
    pub group: Group,
    pub cards: Vec<Card>,
}

// ============================================================================
// Runs
// ============================================================================

/// Which pipe a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn is_error(self) -> bool {
        self == Self::Stderr
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Lifecycle of a single run.
///
/// `Idle → Running → (Completed | Stopped | Failed)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    /// The process exited on its own. `-1` when it died from a signal.
    Completed { exit_code: i32 },
    /// Stopped by the user; the exit code is discarded.
    Stopped,
    /// The run never produced a process (provisioning, script write or spawn failed).
    Failed { reason: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Stopped | Self::Failed { .. }
        )
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Completed { exit_code } => Some(*exit_code),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Completed { exit_code } => write!(f, "completed (code {})", exit_code),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Everything a sink can receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// A line (or chunk) of process output.
    Output { text: String, kind: StreamKind },
    /// Status text from the application itself.
    Info(String),
    /// Error text from the application itself (provisioning, spawn).
    Error(String),
    /// Run `run_id` reached a terminal state. Always the last event of a run.
    Finished { run_id: u64, status: RunStatus },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_an001_terminal_states() {
        assert!(!RunStatus::Idle.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed { exit_code: 0 }.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(RunStatus::Failed {
            reason: "x".into()
        }
        .is_terminal());
    }

    #[test]
    fn test_an001_exit_code_only_when_completed() {
        assert_eq!(RunStatus::Completed { exit_code: 3 }.exit_code(), Some(3));
        assert_eq!(RunStatus::Stopped.exit_code(), None);
    }

    #[test]
    fn test_an001_status_json_shape() {
        let json = serde_json::to_string(&RunStatus::Completed { exit_code: 3 }).unwrap();
        assert_eq!(json, r#"{"state":"completed","exit_code":3}"#);
    }

    #[test]
    fn test_an001_stream_kind_display() {
        assert_eq!(StreamKind::Stdout.to_string(), "stdout");
        assert!(StreamKind::Stderr.is_error());
        assert!(!StreamKind::Stdout.is_error());
    }
}
