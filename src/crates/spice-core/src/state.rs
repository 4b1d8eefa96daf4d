//! Execution state machine
//!
//! Every workflow run (and the message flowing through it) is in exactly one
//! of six states. Transitions are validated against a fixed table; each
//! accepted transition is recorded as a [`StateTransition`] history entry.
//!
//! ```text
//! READY ──> RUNNING ──> COMPLETED
//!   │          │ ▲────┐
//!   │          │ │    │
//!   │          ▼ │    ▼
//!   │       WAITING  FAILED
//!   └──────────┴────> CANCELLED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a run / message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Ready,
    Running,
    /// Paused on a human interaction; no task is held
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    /// Whether a transition to `to` is permitted from this state
    pub fn can_transition_to(self, to: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, to),
            (Ready, Running)
                | (Ready, Cancelled)
                | (Running, Waiting)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Waiting, Running)
                | (Waiting, Failed)
                | (Waiting, Cancelled)
        )
    }

    /// Completed, Failed, and Cancelled admit no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    /// Wire name of the state, matching the serde rendering
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Ready => "READY",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Waiting => "WAITING",
            ExecutionState::Completed => "COMPLETED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ExecutionState,
    pub to: ExecutionState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl StateTransition {
    pub fn new(
        from: ExecutionState,
        to: ExecutionState,
        reason: Option<String>,
        node_id: Option<String>,
    ) -> Self {
        Self {
            from,
            to,
            timestamp: Utc::now(),
            reason,
            node_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    #[test]
    fn test_allowed_transitions() {
        assert!(Ready.can_transition_to(Running));
        assert!(Ready.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Waiting));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Waiting.can_transition_to(Running));
        assert!(Waiting.can_transition_to(Failed));
        assert!(Waiting.can_transition_to(Cancelled));
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(!Ready.can_transition_to(Completed));
        assert!(!Ready.can_transition_to(Waiting));
        assert!(!Running.can_transition_to(Ready));
        assert!(!Waiting.can_transition_to(Completed));
        assert!(!Waiting.can_transition_to(Waiting));
    }

    #[test]
    fn test_terminal_states_admit_nothing() {
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for target in [Ready, Running, Waiting, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(target));
            }
        }
        assert!(!Ready.is_terminal());
        assert!(!Running.is_terminal());
        assert!(!Waiting.is_terminal());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(Waiting.as_str(), "WAITING");
        assert_eq!(serde_json::to_string(&Waiting).unwrap(), r#""WAITING""#);
        let parsed: ExecutionState = serde_json::from_str(r#""CANCELLED""#).unwrap();
        assert_eq!(parsed, Cancelled);
    }
}
