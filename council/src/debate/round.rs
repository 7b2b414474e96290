//! Debate round engine — one propose + cross-review sweep.
//!
//! Proposers run concurrently, each through the self-correction loop.
//! Every surfaced candidate then goes to every critic except its author.
//! Responses arrive in any order and are re-sorted by agent id before the
//! round closes. Calls still running at the round deadline become
//! abstentions; cancellation drops the whole round.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentContext, AgentError, Council};
use crate::debate::correction::{restamp, stamp_seed, CorrectionError, CorrectionLoop};
use crate::debate::critique::Critique;
use crate::model::candidate::{AgentId, Candidate};
use crate::model::execution::ExecutionResult;
use crate::model::lineage::{Lineage, LineageAnnotation, LineageState, RepairTrigger};
use crate::model::transcript::{Abstention, AbstentionPhase, Round, RoundEntry, Transcript};
use crate::resilience::{retry_with_backoff, RetryPolicy};

/// Why a round could not close.
#[derive(Debug, Clone, Error)]
pub enum RoundError {
    #[error(transparent)]
    Correction(#[from] CorrectionError),

    #[error("round {round} cancelled")]
    Cancelled { round: u32 },
}

/// How a proposer starts its lineage this round.
#[derive(Debug, Clone)]
pub enum ProposalPlan {
    /// No earlier entry: propose from scratch.
    Fresh,
    /// Revise the previous candidate against its most severe critique.
    Revise {
        parent: Candidate,
        trigger: RepairTrigger,
    },
    /// Copy the previous lineage's surfaced candidate unchanged.
    Carry {
        previous: Box<Lineage>,
        exhausted: bool,
    },
}

/// Decide how a proposer continues from its previous entry.
///
/// Accepted lineages with an objection are revised while their budget
/// lasts; unanimous or abandoned lineages are carried forward.
pub fn plan_for(previous: Option<&RoundEntry>, max_repair_attempts: u32) -> ProposalPlan {
    let Some(prev) = previous else {
        return ProposalPlan::Fresh;
    };
    let carry = |exhausted| ProposalPlan::Carry {
        previous: Box::new(prev.lineage.clone()),
        exhausted,
    };
    if prev.lineage.state() != LineageState::Accepted {
        return carry(false);
    }
    let Some(objection) = prev.most_severe_objection() else {
        return carry(false);
    };
    if prev.lineage.repair_attempts() >= max_repair_attempts {
        return carry(true);
    }
    let parent = prev.candidate().clone();
    ProposalPlan::Revise {
        trigger: RepairTrigger::Critique {
            statement: parent.sql().map(str::to_string),
            critique: objection.clone(),
        },
        parent,
    }
}

enum Proposal {
    Lineage(Lineage),
    Abstained(Abstention),
}

/// Runs individual rounds for a fixed council.
pub struct RoundEngine {
    council: Council,
    correction: CorrectionLoop,
    round_timeout: Duration,
    retry: RetryPolicy,
}

impl RoundEngine {
    pub fn new(council: Council, correction: CorrectionLoop, round_timeout: Duration) -> Self {
        Self {
            council,
            correction,
            round_timeout,
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for propose and critique calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn council(&self) -> &Council {
        &self.council
    }

    /// Run round `transcript.next_round_number()` over the closed history.
    ///
    /// The transcript is only read; the caller appends the returned round.
    pub async fn run(
        &self,
        base: &AgentContext,
        transcript: &Transcript,
        cancel: &CancellationToken,
    ) -> Result<Round, RoundError> {
        let number = transcript.next_round_number();
        let opened_at = chrono::Utc::now();
        let deadline = Instant::now() + self.round_timeout;
        let ctx = base.for_round(number, Arc::new(transcript.rounds().to_vec()));
        let proposers = self.council.proposers();
        let critics = self.council.critics();
        info!(
            question_id = %base.question.id,
            round = number,
            proposers = proposers.len(),
            critics = critics.len(),
            "Round opened"
        );

        let max = self.correction.max_repair_attempts();
        let pending: FuturesUnordered<_> = proposers
            .iter()
            .map(|agent| {
                let previous = transcript.last_round().and_then(|r| r.entry_for(agent.id()));
                let plan = plan_for(previous, max);
                self.propose_one(agent.clone(), &ctx, plan, deadline)
            })
            .collect();
        let proposals = drain(pending, cancel)
            .await
            .ok_or(RoundError::Cancelled { round: number })?;

        let mut lineages = Vec::new();
        let mut abstentions = Vec::new();
        for proposal in proposals {
            match proposal? {
                Proposal::Lineage(l) => lineages.push(l),
                Proposal::Abstained(a) => abstentions.push(a),
            }
        }
        lineages.sort_by(|a, b| a.surfaced().candidate.author().cmp(b.surfaced().candidate.author()));

        let mut expected = proposers.len();
        let mut reviews: Vec<Vec<Critique>> = vec![Vec::new(); lineages.len()];
        {
            let pending = FuturesUnordered::new();
            for (idx, lineage) in lineages.iter().enumerate() {
                let step = lineage.surfaced();
                for critic in critics.iter().filter(|c| c.id() != step.candidate.author()) {
                    expected += 1;
                    pending.push(self.review_one(
                        idx,
                        critic.clone(),
                        &step.candidate,
                        step.execution.as_ref(),
                        &ctx,
                        deadline,
                    ));
                }
            }
            let results = drain(pending, cancel)
                .await
                .ok_or(RoundError::Cancelled { round: number })?;
            for (idx, result) in results {
                match result {
                    Ok(critique) => reviews[idx].push(critique),
                    Err(abstention) => abstentions.push(abstention),
                }
            }
        }

        let entries: Vec<RoundEntry> = lineages
            .into_iter()
            .zip(reviews)
            .map(|(lineage, critiques)| RoundEntry::new(lineage, critiques))
            .collect();
        let round = Round::close(number, entries, abstentions, expected, opened_at);
        info!(
            question_id = %base.question.id,
            round = number,
            metrics = %round.metrics,
            converged = round.converged_on.is_some(),
            "Round closed"
        );
        Ok(round)
    }

    async fn propose_one(
        &self,
        agent: Arc<dyn Agent>,
        ctx: &AgentContext,
        plan: ProposalPlan,
        deadline: Instant,
    ) -> Result<Proposal, CorrectionError> {
        let id = agent.id().clone();
        match tokio::time::timeout_at(deadline, self.propose_inner(agent.as_ref(), ctx, plan)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(agent = %id, round = ctx.round, "Proposal missed the round deadline");
                Ok(Proposal::Abstained(Abstention::new(
                    &id,
                    AbstentionPhase::Propose,
                    "no proposal before the round deadline",
                )))
            }
        }
    }

    async fn propose_inner(
        &self,
        agent: &dyn Agent,
        ctx: &AgentContext,
        plan: ProposalPlan,
    ) -> Result<Proposal, CorrectionError> {
        let id = agent.id().clone();
        let lineage = match plan {
            ProposalPlan::Carry { previous, exhausted } => {
                let mut lineage = Lineage::carried(&previous, ctx.round);
                if exhausted {
                    lineage.annotate(LineageAnnotation::ExhaustedRepairBudget {
                        attempts: previous.repair_attempts(),
                    });
                }
                debug!(agent = %id, round = ctx.round, "Carrying candidate forward");
                return Ok(Proposal::Lineage(lineage));
            }
            ProposalPlan::Fresh => match self.call_propose(agent, ctx).await {
                Ok(c) => Lineage::start(stamp_seed(c, &id, ctx.round), None),
                Err(e) => return Ok(Proposal::Abstained(abstain(&id, AbstentionPhase::Propose, &e))),
            },
            ProposalPlan::Revise { parent, trigger } => {
                let repair_ctx = ctx.for_repair(&parent, trigger.clone());
                info!(agent = %id, round = ctx.round, trigger = %trigger, "Revising against critique");
                match self.call_propose(agent, &repair_ctx).await {
                    Ok(c) => Lineage::start(restamp(c, &parent, ctx.round), Some(trigger)),
                    Err(e) => return Ok(Proposal::Abstained(abstain(&id, AbstentionPhase::Propose, &e))),
                }
            }
        };
        let lineage = self.correction.run(agent, ctx, lineage).await?;
        Ok(Proposal::Lineage(lineage))
    }

    async fn call_propose(&self, agent: &dyn Agent, ctx: &AgentContext) -> Result<Candidate, AgentError> {
        retry_with_backoff(&self.retry, agent.id().as_str(), AgentError::is_transient, || {
            agent.propose(ctx)
        })
        .await
    }

    async fn review_one(
        &self,
        idx: usize,
        critic: Arc<dyn Agent>,
        candidate: &Candidate,
        execution: Option<&ExecutionResult>,
        ctx: &AgentContext,
        deadline: Instant,
    ) -> (usize, Result<Critique, Abstention>) {
        let id = critic.id().clone();
        let phase = AbstentionPhase::Critique {
            candidate: candidate.id,
        };
        let call = retry_with_backoff(&self.retry, id.as_str(), AgentError::is_transient, || {
            critic.critique(candidate, execution, ctx)
        });
        let outcome = tokio::time::timeout_at(deadline, call).await;
        let result = match outcome {
            Ok(Ok(mut critique)) => {
                critique.critic = id;
                critique.candidate = candidate.id;
                Ok(critique)
            }
            Ok(Err(e)) => Err(abstain(&id, phase, &e)),
            Err(_) => {
                warn!(critic = %id, candidate = %candidate.id, "Critique missed the round deadline");
                Err(Abstention::new(&id, phase, "no critique before the round deadline"))
            }
        };
        (idx, result)
    }
}

fn abstain(agent: &AgentId, phase: AbstentionPhase, err: &AgentError) -> Abstention {
    warn!(agent = %agent, phase = %phase, error = %err, "Agent abstained");
    Abstention::new(agent, phase, &err.to_string())
}

/// Collect every future, or `None` if cancelled first.
async fn drain<F, T>(mut pending: FuturesUnordered<F>, cancel: &CancellationToken) -> Option<Vec<T>>
where
    F: Future<Output = T>,
{
    let mut out = Vec::with_capacity(pending.len());
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            next = pending.next() => match next {
                Some(v) => out.push(v),
                None => return Some(out),
            },
        }
    }
}
