//! Self-correction loop — generate, execute, repair, bounded per lineage.
//!
//! ```text
//! Generated ──execute──▶ Executed ──ok──▶ Accepted
//!     │                     │
//!     │ sentinel            │ failure (repairable)
//!     ▼                     ▼
//!  Repairing ◀──────────────┘ ──author repairs──▶ Generated
//!     │
//!     └─ budget spent / unsafe / author silent ──▶ Abandoned
//! ```
//!
//! The budget is checked before every repair, so a lineage never takes
//! more than `max_repair_attempts` repair transitions, counting critique
//! revisions from earlier rounds.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentContext, AgentError};
use crate::model::candidate::{AgentId, Candidate, CandidateBody};
use crate::model::execution::FailureKind;
use crate::model::lineage::{Lineage, LineageAnnotation, LineageState, LineageTransitionError, RepairTrigger};
use crate::resilience::{retry_with_backoff, RetryPolicy};
use crate::sandbox::{Sandbox, SandboxUnavailable};
use crate::sql::unknown_tables;

/// Failures that end the whole session rather than one lineage.
#[derive(Debug, Clone, Error)]
pub enum CorrectionError {
    #[error(transparent)]
    Sandbox(#[from] SandboxUnavailable),

    #[error(transparent)]
    Transition(#[from] LineageTransitionError),
}

/// Drives one lineage until it is accepted or abandoned.
#[derive(Clone)]
pub struct CorrectionLoop {
    sandbox: Arc<Sandbox>,
    max_repair_attempts: u32,
    retry: RetryPolicy,
}

impl CorrectionLoop {
    pub fn new(sandbox: Arc<Sandbox>, max_repair_attempts: u32) -> Self {
        Self {
            sandbox,
            max_repair_attempts,
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for the author's repair calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_repair_attempts(&self) -> u32 {
        self.max_repair_attempts
    }

    /// Run `lineage` (in `Generated`) to a terminal state.
    ///
    /// Each repair call gets only the trigger of the step before it.
    pub async fn run(
        &self,
        author: &dyn Agent,
        ctx: &AgentContext,
        mut lineage: Lineage,
    ) -> Result<Lineage, CorrectionError> {
        loop {
            let candidate = lineage.latest().candidate.clone();

            let trigger = match &candidate.body {
                CandidateBody::Answer { .. } => {
                    lineage.transition(LineageState::Accepted)?;
                    return Ok(lineage);
                }
                CandidateBody::CannotAnswer { reason } => RepairTrigger::Generation {
                    reason: reason.clone(),
                },
                CandidateBody::Sql { statement } => {
                    let result = self.sandbox.execute(&candidate, &ctx.schema).await?;
                    let failure = result.as_failure().cloned();
                    lineage.record_execution(result)?;
                    let Some(failure) = failure else {
                        lineage.transition(LineageState::Accepted)?;
                        debug!(
                            agent = %candidate.author(),
                            candidate = %candidate.id,
                            attempts = lineage.repair_attempts(),
                            "Candidate executed cleanly"
                        );
                        return Ok(lineage);
                    };
                    if !failure.kind.is_repairable() {
                        warn!(agent = %candidate.author(), candidate = %candidate.id, "Unsafe statement abandoned");
                        lineage.abandon(LineageAnnotation::UnsafeStatement)?;
                        return Ok(lineage);
                    }
                    if failure.kind == FailureKind::SchemaMismatch {
                        let names = unknown_tables(statement, &ctx.schema);
                        if !names.is_empty() {
                            lineage.annotate(LineageAnnotation::UnknownIdentifiers { names });
                        }
                    }
                    RepairTrigger::Execution {
                        statement: Some(statement.clone()),
                        failure,
                    }
                }
            };

            let attempts = lineage.repair_attempts();
            if attempts >= self.max_repair_attempts {
                info!(
                    agent = %candidate.author(),
                    lineage = %candidate.provenance.lineage,
                    attempts,
                    "Repair budget exhausted"
                );
                lineage.abandon(LineageAnnotation::ExhaustedRepairBudget { attempts })?;
                return Ok(lineage);
            }

            lineage.transition(LineageState::Repairing)?;
            info!(
                agent = %candidate.author(),
                attempt = attempts + 1,
                max = self.max_repair_attempts,
                trigger = %trigger,
                "Repairing candidate"
            );

            let repair_ctx = ctx.for_repair(&candidate, trigger.clone());
            match self.request_repair(author, &repair_ctx).await {
                Ok(repaired) => {
                    let repaired = restamp(repaired, &candidate, ctx.round);
                    lineage.push_repair(repaired, trigger)?;
                }
                Err(e) => {
                    warn!(agent = %candidate.author(), error = %e, "Author abstained during repair");
                    lineage.abandon(LineageAnnotation::RepairAbstained {
                        reason: e.to_string(),
                    })?;
                    return Ok(lineage);
                }
            }
        }
    }

    async fn request_repair(&self, author: &dyn Agent, ctx: &AgentContext) -> Result<Candidate, AgentError> {
        retry_with_backoff(&self.retry, author.id().as_str(), AgentError::is_transient, || {
            author.propose(ctx)
        })
        .await
    }
}

/// Force repair provenance onto a candidate whose author ignored the
/// parent it was given.
pub(crate) fn restamp(repaired: Candidate, parent: &Candidate, round: u32) -> Candidate {
    let consistent = repaired.provenance.parent == Some(parent.id)
        && repaired.provenance.lineage == parent.provenance.lineage
        && repaired.provenance.repair_attempt == parent.provenance.repair_attempt + 1
        && repaired.provenance.round == round
        && repaired.author() == parent.author();
    if consistent {
        return repaired;
    }
    let mut fixed = Candidate::repair_of(parent, round, repaired.body, &repaired.rationale);
    fixed.raw_output = repaired.raw_output;
    fixed
}

/// Force fresh-lineage provenance for `author` in `round`.
pub(crate) fn stamp_seed(candidate: Candidate, author: &AgentId, round: u32) -> Candidate {
    let consistent = candidate.provenance.parent.is_none()
        && candidate.provenance.round == round
        && candidate.author() == author
        && candidate.provenance.repair_attempt == 0;
    if consistent {
        return candidate;
    }
    let mut fixed = Candidate::seed(author, round, candidate.body, &candidate.rationale);
    fixed.raw_output = candidate.raw_output;
    fixed
}
