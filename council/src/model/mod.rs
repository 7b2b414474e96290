//! Data model shared by every council component.

pub mod candidate;
pub mod execution;
pub mod lineage;
pub mod question;
pub mod transcript;

pub use candidate::{AgentId, Candidate, CandidateBody, CandidateId, Provenance};
pub use execution::{ExecutionFailure, ExecutionResult, FailureKind, ResultColumn, ResultSummary};
pub use lineage::{
    Lineage, LineageAnnotation, LineageState, LineageStep, LineageTransitionError, RepairTrigger,
};
pub use question::{ColumnDef, Question, Schema, TableSchema};
pub use transcript::{Abstention, AbstentionPhase, Round, RoundEntry, Transcript, TranscriptError};
