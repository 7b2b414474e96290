//! Debate — rounds of propose, execute/repair, and cross-review, then a
//! deterministic verdict.
//!
//! ```text
//! round r:  proposers ──(parallel)──▶ correction loop ──▶ surfaced candidates
//!                                                            │
//!           critics ◀──────────(every candidate, not own)────┘
//!              │
//!              ▼
//!           Round (sorted by agent id, closed, immutable)
//!
//! after the last round:  decide(transcript) ──▶ Verdict | NoConsensus
//! ```

pub mod bias;
pub mod consensus;
pub mod correction;
pub mod critique;
pub mod metrics;
pub mod persistence;
pub mod round;

pub use bias::{BiasAnalyzer, BiasPattern, BiasReport, FairnessViolation};
pub use consensus::{decide, Decision, NoConsensus, TallyEntry, TieBreakReason, Verdict};
pub use correction::{CorrectionError, CorrectionLoop};
pub use critique::{Critique, CritiqueVerdict};
pub use metrics::RoundMetrics;
pub use persistence::{
    FileTranscriptStore, MemoryTranscriptStore, PersistenceError, TranscriptRecord, TranscriptStore,
    TranscriptSummary,
};
pub use round::{plan_for, ProposalPlan, RoundEngine, RoundError};
