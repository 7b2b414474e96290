//! Candidate lineage — the generate → execute → repair chain for one proposer.
//!
//! ```text
//! Generated ──▶ Executed ──▶ Accepted
//!     │             │
//!     │             └──▶ Repairing ──▶ Generated ...
//!     └──▶ Repairing (generation defect)
//! any non-terminal ──▶ Abandoned
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::debate::critique::Critique;
use crate::model::candidate::{Candidate, CandidateId};
use crate::model::execution::{ExecutionFailure, ExecutionResult};

/// State of a candidate lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageState {
    /// A candidate exists but has not been executed.
    Generated,
    /// The latest candidate has an execution result.
    Executed,
    /// A repair is being requested.
    Repairing,
    /// The latest candidate executed cleanly (or needs no execution).
    Accepted,
    /// The lineage gave up: budget exhausted, unsafe, or author abstained.
    Abandoned,
}

impl LineageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Abandoned)
    }

    /// Valid transitions from this state.
    pub fn valid_transitions(self) -> &'static [LineageState] {
        match self {
            Self::Generated => &[Self::Executed, Self::Accepted, Self::Repairing, Self::Abandoned],
            Self::Executed => &[Self::Accepted, Self::Repairing, Self::Abandoned],
            Self::Repairing => &[Self::Generated, Self::Abandoned],
            Self::Accepted | Self::Abandoned => &[],
        }
    }
}

impl std::fmt::Display for LineageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generated => write!(f, "generated"),
            Self::Executed => write!(f, "executed"),
            Self::Repairing => write!(f, "repairing"),
            Self::Accepted => write!(f, "accepted"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Rejected lineage state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid lineage transition {from} -> {to}")]
pub struct LineageTransitionError {
    pub from: LineageState,
    pub to: LineageState,
}

/// The single signal that caused a repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RepairTrigger {
    /// The parent failed in the sandbox.
    Execution {
        statement: Option<String>,
        failure: ExecutionFailure,
    },
    /// A critic asked for a revision (or rejected) in the previous round.
    Critique {
        statement: Option<String>,
        critique: Critique,
    },
    /// The parent was a "cannot answer" sentinel.
    Generation { reason: String },
}

impl RepairTrigger {
    /// The statement the repair must not repeat verbatim.
    pub fn failing_statement(&self) -> Option<&str> {
        match self {
            Self::Execution { statement, .. } | Self::Critique { statement, .. } => {
                statement.as_deref()
            }
            Self::Generation { .. } => None,
        }
    }

    /// One-line description used in prompts and logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Execution { failure, .. } => format!("execution failed: {}", failure),
            Self::Critique { critique, .. } => {
                let mut s = format!(
                    "critic {} returned {}: {}",
                    critique.critic, critique.verdict, critique.rationale
                );
                if let Some(rev) = &critique.suggested_revision {
                    s.push_str(&format!(" (suggested: {})", rev));
                }
                s
            }
            Self::Generation { reason } => format!("previous attempt produced no query: {}", reason),
        }
    }
}

impl std::fmt::Display for RepairTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Notes attached to a lineage so its fate is visible in the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "note", rename_all = "snake_case")]
pub enum LineageAnnotation {
    /// The repair budget ran out before a clean execution.
    ExhaustedRepairBudget { attempts: u32 },
    /// The statement was rejected as a write or multi-statement query.
    UnsafeStatement,
    /// The author stopped responding mid-repair.
    RepairAbstained { reason: String },
    /// The candidate was copied unchanged from an earlier round.
    CarriedForward { from: CandidateId },
    /// Identifiers that do not exist in the schema.
    UnknownIdentifiers { names: Vec<String> },
}

impl std::fmt::Display for LineageAnnotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExhaustedRepairBudget { attempts } => {
                write!(f, "exhausted repair budget after {} attempts", attempts)
            }
            Self::UnsafeStatement => write!(f, "unsafe statement"),
            Self::RepairAbstained { reason } => write!(f, "author abstained during repair: {}", reason),
            Self::CarriedForward { from } => write!(f, "carried forward from {}", from),
            Self::UnknownIdentifiers { names } => {
                write!(f, "unknown identifiers: {}", names.join(", "))
            }
        }
    }
}

/// One candidate in a lineage, with its execution result and trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageStep {
    pub candidate: Candidate,
    pub execution: Option<ExecutionResult>,
    /// Signal that produced this candidate; `None` for a fresh proposal.
    pub trigger: Option<RepairTrigger>,
}

impl LineageStep {
    pub fn succeeded(&self) -> bool {
        self.execution.as_ref().is_some_and(|e| e.is_success())
    }
}

/// A recorded lineage state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageTransition {
    pub from: LineageState,
    pub to: LineageState,
    pub at: DateTime<Utc>,
}

/// All candidates one proposer produced within a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    steps: Vec<LineageStep>,
    state: LineageState,
    transitions: Vec<LineageTransition>,
    annotations: Vec<LineageAnnotation>,
}

impl Lineage {
    /// Start a lineage from its first candidate in this round.
    pub fn start(candidate: Candidate, trigger: Option<RepairTrigger>) -> Self {
        Self {
            steps: vec![LineageStep {
                candidate,
                execution: None,
                trigger,
            }],
            state: LineageState::Generated,
            transitions: Vec::new(),
            annotations: Vec::new(),
        }
    }

    /// A lineage that copies the surfaced candidate of an earlier lineage,
    /// together with its execution result and notes.
    ///
    /// Terminal on creation: `Accepted` if the copied result succeeded (or
    /// nothing needed executing), otherwise `Abandoned`.
    pub fn carried(previous: &Lineage, round: u32) -> Self {
        let step = previous.surfaced();
        let candidate = Candidate::carried_forward(&step.candidate, round);
        let ok = match &step.execution {
            Some(e) => e.is_success(),
            None => !step.candidate.is_sentinel(),
        };
        let mut lineage = Self::start(candidate, None);
        lineage.steps[0].execution = step.execution.clone();
        lineage.annotations = previous
            .annotations
            .iter()
            .filter(|a| !matches!(a, LineageAnnotation::CarriedForward { .. }))
            .cloned()
            .collect();
        lineage.annotations.push(LineageAnnotation::CarriedForward {
            from: step.candidate.id,
        });
        let to = if ok {
            LineageState::Accepted
        } else {
            LineageState::Abandoned
        };
        lineage.record(to);
        lineage
    }

    pub fn state(&self) -> LineageState {
        self.state
    }

    pub fn steps(&self) -> &[LineageStep] {
        &self.steps
    }

    pub fn transitions(&self) -> &[LineageTransition] {
        &self.transitions
    }

    pub fn annotations(&self) -> &[LineageAnnotation] {
        &self.annotations
    }

    pub fn latest(&self) -> &LineageStep {
        // `steps` is never empty: every constructor pushes one.
        &self.steps[self.steps.len() - 1]
    }

    /// The step shown to the round: the latest step while the lineage is
    /// healthy; when abandoned, the last step that executed cleanly, or
    /// the latest one as best effort.
    pub fn surfaced(&self) -> &LineageStep {
        if self.state == LineageState::Abandoned {
            if let Some(good) = self.steps.iter().rev().find(|s| s.succeeded()) {
                return good;
            }
        }
        self.latest()
    }

    /// Repair transitions since the lineage root, counting earlier rounds.
    pub fn repair_attempts(&self) -> u32 {
        self.steps
            .iter()
            .map(|s| s.candidate.provenance.repair_attempt)
            .max()
            .unwrap_or(0)
    }

    pub fn is_exhausted(&self) -> bool {
        self.annotations
            .iter()
            .any(|a| matches!(a, LineageAnnotation::ExhaustedRepairBudget { .. }))
    }

    /// Move to `to` if the state machine allows it.
    pub fn transition(&mut self, to: LineageState) -> Result<(), LineageTransitionError> {
        if !self.state.valid_transitions().contains(&to) {
            return Err(LineageTransitionError {
                from: self.state,
                to,
            });
        }
        self.record(to);
        Ok(())
    }

    fn record(&mut self, to: LineageState) {
        self.transitions.push(LineageTransition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        self.state = to;
    }

    /// Attach the sandbox outcome to the latest candidate (Generated → Executed).
    pub fn record_execution(
        &mut self,
        result: ExecutionResult,
    ) -> Result<(), LineageTransitionError> {
        self.transition(LineageState::Executed)?;
        let last = self.steps.len() - 1;
        self.steps[last].execution = Some(result);
        Ok(())
    }

    /// Append a repaired candidate (Repairing → Generated).
    pub fn push_repair(
        &mut self,
        candidate: Candidate,
        trigger: RepairTrigger,
    ) -> Result<(), LineageTransitionError> {
        self.transition(LineageState::Generated)?;
        self.steps.push(LineageStep {
            candidate,
            execution: None,
            trigger: Some(trigger),
        });
        Ok(())
    }

    /// Terminate the lineage with a note.
    pub fn abandon(&mut self, note: LineageAnnotation) -> Result<(), LineageTransitionError> {
        self.transition(LineageState::Abandoned)?;
        self.annotations.push(note);
        Ok(())
    }

    pub fn annotate(&mut self, note: LineageAnnotation) {
        if !self.annotations.contains(&note) {
            self.annotations.push(note);
        }
    }
}
