//! Insight Council
//!
//! A panel of reasoning agents answers natural-language questions over
//! warehouse data. Proposers draft SQL, a sandbox executes it read-only,
//! failing candidates are repaired from their specific error, critics
//! cross-review every candidate, and a deterministic tally picks the answer.
//!
//! # Components
//!
//! - [`agent`]: capability-typed participants and their reasoning backends
//! - [`sql`]: tokenizing, normalization, read-only checks, candidate generation
//! - [`sandbox`]: bounded, classified execution against a query engine
//! - [`debate`]: self-correction loop, round engine, consensus, persistence
//! - [`orchestrator`]: per-question state machine that owns the transcript
//!
//! # Usage
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use insight_council::{Council, CouncilConfig, CouncilOrchestrator, Question, Schema};
//! # async fn demo(council: Council, engine: Arc<dyn insight_council::QueryEngine>) {
//! let orchestrator = CouncilOrchestrator::new(CouncilConfig::default(), council, engine).unwrap();
//! let outcome = orchestrator
//!     .run(Question::new("How many orders shipped last week?"), Schema::new())
//!     .await;
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod agent;
pub mod config;
pub mod debate;
pub mod model;
pub mod orchestrator;
pub mod resilience;
pub mod sandbox;
pub mod sql;

// Re-export key agent types
pub use agent::{
    Agent, AgentContext, AgentError, AuditOutcome, AuditReport, Capability, Council, Synthesis,
};

// Re-export key data model types
pub use model::{
    AgentId, Candidate, CandidateBody, CandidateId, ColumnDef, ExecutionFailure, ExecutionResult,
    FailureKind, Lineage, LineageAnnotation, LineageState, Question, Round, RoundEntry, Schema,
    Transcript,
};

// Re-export debate types
pub use debate::{
    decide, Critique, CritiqueVerdict, FileTranscriptStore, TieBreakReason, TranscriptStore, Verdict,
};

// Re-export orchestration types
pub use config::{ConfigError, CouncilConfig};
pub use orchestrator::{CouncilOrchestrator, CouncilOutcome, CouncilPhase, OrchestratorFailure};

// Re-export sandbox types
pub use sandbox::{QueryEngine, Sandbox, SandboxLimits};
