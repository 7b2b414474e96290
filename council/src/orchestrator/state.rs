//! Council session state machine — phases and transition history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of a council session for one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouncilPhase {
    /// Question accepted, nothing started.
    Received,
    /// Proposers are seeding round 0.
    Generating,
    /// Later rounds of critique and revision.
    Debating,
    /// Tallying the closed transcript.
    Deciding,
    /// Verdict produced (possibly `NoConsensus`).
    Completed,
    /// Unrecoverable failure; the partial transcript is kept.
    Failed,
}

impl CouncilPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [CouncilPhase] {
        match self {
            Self::Received => &[Self::Generating, Self::Failed],
            Self::Generating => &[Self::Debating, Self::Deciding, Self::Failed],
            Self::Debating => &[Self::Deciding, Self::Failed],
            Self::Deciding => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }
}

impl std::fmt::Display for CouncilPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::Generating => write!(f, "generating"),
            Self::Debating => write!(f, "debating"),
            Self::Deciding => write!(f, "deciding"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A recorded phase change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: CouncilPhase,
    pub to: CouncilPhase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: CouncilPhase,
    pub to: CouncilPhase,
    pub reason: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid transition {} → {}: {}", self.from, self.to, self.reason)
    }
}

impl std::error::Error for TransitionError {}

/// Phase tracker for one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilSession {
    /// Transcript id.
    pub id: String,
    pub phase: CouncilPhase,
    pub transitions: Vec<PhaseTransition>,
    pub created_at: DateTime<Utc>,
}

impl CouncilSession {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            phase: CouncilPhase::Received,
            transitions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Transition to a new phase with a reason.
    pub fn transition(&mut self, to: CouncilPhase, reason: &str) -> Result<(), TransitionError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.phase,
                to,
                reason: format!("not a valid transition (allowed: {:?})", self.phase.valid_transitions()),
            });
        }
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.phase = to;
        Ok(())
    }

    /// Move to `Failed` from any non-terminal phase.
    pub fn fail(&mut self, reason: &str) {
        if !self.phase.is_terminal() {
            self.transitions.push(PhaseTransition {
                from: self.phase,
                to: CouncilPhase::Failed,
                timestamp: Utc::now(),
                reason: reason.to_string(),
            });
            self.phase = CouncilPhase::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut s = CouncilSession::new("t");
        s.transition(CouncilPhase::Generating, "start").unwrap();
        s.transition(CouncilPhase::Debating, "round 0 closed").unwrap();
        s.transition(CouncilPhase::Deciding, "max rounds").unwrap();
        s.transition(CouncilPhase::Completed, "verdict").unwrap();
        assert!(s.phase.is_terminal());
        assert_eq!(s.transitions.len(), 4);
    }

    #[test]
    fn test_early_convergence_skips_debating() {
        let mut s = CouncilSession::new("t");
        s.transition(CouncilPhase::Generating, "start").unwrap();
        assert!(s.transition(CouncilPhase::Deciding, "converged").is_ok());
    }

    #[test]
    fn test_invalid_transition() {
        let mut s = CouncilSession::new("t");
        let err = s.transition(CouncilPhase::Completed, "skip").unwrap_err();
        assert_eq!(err.from, CouncilPhase::Received);
        assert_eq!(s.phase, CouncilPhase::Received);
    }

    #[test]
    fn test_fail_from_anywhere_but_terminal() {
        let mut s = CouncilSession::new("t");
        s.transition(CouncilPhase::Generating, "start").unwrap();
        s.fail("sandbox down");
        assert_eq!(s.phase, CouncilPhase::Failed);
        s.fail("again");
        assert_eq!(s.transitions.len(), 2);
    }
}
