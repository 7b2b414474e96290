//! Agents — capability-typed council participants.
//!
//! An agent holds any subset of {Proposer, Critic, Aggregator, Judge}.
//! Calls receive an [`AgentContext`] snapshot and return new values; no
//! agent ever sees a mutable reference into the transcript.

pub mod backend;
pub mod llm;
pub mod prompts;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::backend::BackendError;

use crate::debate::consensus::Verdict;
use crate::debate::critique::Critique;
use crate::model::candidate::{AgentId, Candidate, CandidateBody};
use crate::model::execution::{ExecutionResult, ResultSummary};
use crate::model::lineage::RepairTrigger;
use crate::model::question::{Question, Schema};
use crate::model::transcript::Round;

/// A role an agent can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Produces candidates.
    Proposer,
    /// Reviews other agents' candidates.
    Critic,
    /// Writes the final narrative over the verdict.
    Aggregator,
    /// Audits the chosen result for fairness concerns.
    Judge,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proposer => write!(f, "proposer"),
            Self::Critic => write!(f, "critic"),
            Self::Aggregator => write!(f, "aggregator"),
            Self::Judge => write!(f, "judge"),
        }
    }
}

/// Errors an agent call can return.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// Backend errored or timed out. Retried, then the agent abstains.
    #[error("agent {agent} unavailable: {reason}")]
    Unavailable { agent: AgentId, reason: String },

    #[error("agent {agent} does not act as {capability}")]
    Unsupported { agent: AgentId, capability: Capability },

    /// Backend failed in a way another attempt will not fix (auth, config).
    #[error("agent {agent} failed: {reason}")]
    Failed { agent: AgentId, reason: String },

    /// The backend answered but the answer could not be used.
    #[error("agent {agent} returned malformed output: {reason}")]
    Malformed { agent: AgentId, reason: String },
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Map a backend error: transient ones become `Unavailable`.
    pub fn from_backend(agent: &AgentId, err: &BackendError) -> Self {
        if err.is_transient() {
            Self::Unavailable {
                agent: agent.clone(),
                reason: err.to_string(),
            }
        } else {
            Self::Failed {
                agent: agent.clone(),
                reason: err.to_string(),
            }
        }
    }

    pub fn unsupported(agent: &AgentId, capability: Capability) -> Self {
        Self::Unsupported {
            agent: agent.clone(),
            capability,
        }
    }
}

/// Read-only snapshot handed to every agent call.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub question: Arc<Question>,
    pub schema: Arc<Schema>,
    /// Closed rounds before the current one.
    pub history: Arc<Vec<Round>>,
    /// Round being produced.
    pub round: u32,
    /// Candidate being repaired, if this is a repair call.
    pub parent: Option<Candidate>,
    /// The single failure or critique that triggered the repair.
    pub hint: Option<RepairTrigger>,
}

impl AgentContext {
    pub fn new(question: Arc<Question>, schema: Arc<Schema>) -> Self {
        Self {
            question,
            schema,
            history: Arc::new(Vec::new()),
            round: 0,
            parent: None,
            hint: None,
        }
    }

    /// Context for round `round` over the given closed history.
    pub fn for_round(&self, round: u32, history: Arc<Vec<Round>>) -> Self {
        Self {
            question: self.question.clone(),
            schema: self.schema.clone(),
            history,
            round,
            parent: None,
            hint: None,
        }
    }

    /// Context for repairing `parent` after `trigger`.
    pub fn for_repair(&self, parent: &Candidate, trigger: RepairTrigger) -> Self {
        Self {
            parent: Some(parent.clone()),
            hint: Some(trigger),
            ..self.clone()
        }
    }

    pub fn is_repair(&self) -> bool {
        self.parent.is_some()
    }

    /// Build a candidate with provenance matching this context: a repair
    /// of `parent` when repairing, otherwise a fresh lineage.
    pub fn draft(&self, author: &AgentId, body: CandidateBody, rationale: &str) -> Candidate {
        match &self.parent {
            Some(parent) => Candidate::repair_of(parent, self.round, body, rationale),
            None => Candidate::seed(author, self.round, body, rationale),
        }
    }
}

/// Aggregator narrative over the verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synthesis {
    pub agent: AgentId,
    pub narrative: String,
    pub raw_output: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Judge's fairness review of the chosen result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub agent: AgentId,
    /// Whether the judge found no material concern.
    pub passed: bool,
    pub concerns: Vec<String>,
    pub rationale: String,
    pub raw_output: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What became of the fairness audit for a decided question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// No judge, no decision, or no demographic columns in the result.
    NotApplicable { reason: String },
    Reported(AuditReport),
    /// The judge failed to answer.
    Abstained { agent: AgentId, reason: String },
}

impl AuditOutcome {
    pub fn not_applicable(reason: &str) -> Self {
        Self::NotApplicable {
            reason: reason.to_string(),
        }
    }

    pub fn report(&self) -> Option<&AuditReport> {
        match self {
            Self::Reported(r) => Some(r),
            _ => None,
        }
    }
}

/// A council participant.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &AgentId;

    fn capabilities(&self) -> &[Capability];

    fn has(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Produce a candidate. Repairs are signalled by `ctx.parent` / `ctx.hint`.
    async fn propose(&self, _ctx: &AgentContext) -> Result<Candidate, AgentError> {
        Err(AgentError::unsupported(self.id(), Capability::Proposer))
    }

    /// Review another agent's candidate.
    async fn critique(
        &self,
        _candidate: &Candidate,
        _execution: Option<&ExecutionResult>,
        _ctx: &AgentContext,
    ) -> Result<Critique, AgentError> {
        Err(AgentError::unsupported(self.id(), Capability::Critic))
    }

    /// Narrate the decided outcome.
    async fn synthesize(&self, _verdict: &Verdict, _ctx: &AgentContext) -> Result<Synthesis, AgentError> {
        Err(AgentError::unsupported(self.id(), Capability::Aggregator))
    }

    /// Audit the chosen result set.
    async fn audit(
        &self,
        _verdict: &Verdict,
        _result: &ResultSummary,
        _ctx: &AgentContext,
    ) -> Result<AuditReport, AgentError> {
        Err(AgentError::unsupported(self.id(), Capability::Judge))
    }
}

/// The participating agents for one question, in agent-id order.
#[derive(Clone, Default)]
pub struct Council {
    agents: Vec<Arc<dyn Agent>>,
}

impl Council {
    pub fn new(mut agents: Vec<Arc<dyn Agent>>) -> Self {
        agents.sort_by(|a, b| a.id().cmp(b.id()));
        Self { agents }
    }

    pub fn agents(&self) -> &[Arc<dyn Agent>] {
        &self.agents
    }

    /// Agents holding `capability`, in id order.
    pub fn with(&self, capability: Capability) -> Vec<Arc<dyn Agent>> {
        self.agents
            .iter()
            .filter(|a| a.has(capability))
            .cloned()
            .collect()
    }

    pub fn proposers(&self) -> Vec<Arc<dyn Agent>> {
        self.with(Capability::Proposer)
    }

    pub fn critics(&self) -> Vec<Arc<dyn Agent>> {
        self.with(Capability::Critic)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for Council {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.agents.iter().map(|a| a.id().as_str()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare {
        id: AgentId,
        caps: Vec<Capability>,
    }

    #[async_trait]
    impl Agent for Bare {
        fn id(&self) -> &AgentId {
            &self.id
        }
        fn capabilities(&self) -> &[Capability] {
            &self.caps
        }
    }

    fn bare(id: &str, caps: &[Capability]) -> Arc<dyn Agent> {
        Arc::new(Bare {
            id: AgentId::new(id),
            caps: caps.to_vec(),
        })
    }

    #[test]
    fn test_council_sorted_and_filtered() {
        let council = Council::new(vec![
            bare("zed", &[Capability::Critic]),
            bare("amy", &[Capability::Proposer, Capability::Critic]),
            bare("bob", &[Capability::Judge]),
        ]);
        let ids: Vec<String> = council.critics().iter().map(|a| a.id().to_string()).collect();
        assert_eq!(ids, vec!["amy", "zed"]);
        assert_eq!(council.proposers().len(), 1);
        assert_eq!(council.with(Capability::Judge)[0].id().as_str(), "bob");
    }

    #[tokio::test]
    async fn test_default_methods_are_unsupported() {
        let agent = bare("x", &[]);
        let q = Arc::new(Question::new("q"));
        let ctx = AgentContext::new(q, Arc::new(Schema::new()));
        let err = agent.propose(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Unsupported { capability: Capability::Proposer, .. }
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_draft_respects_repair_context() {
        let q = Arc::new(Question::new("q"));
        let ctx = AgentContext::new(q, Arc::new(Schema::new()));
        let author = AgentId::new("p");
        let first = ctx.draft(&author, CandidateBody::sql("SELECT 1"), "");
        assert_eq!(first.provenance.repair_attempt, 0);

        let trigger = RepairTrigger::Generation { reason: "r".into() };
        let repair_ctx = ctx.for_repair(&first, trigger);
        let second = repair_ctx.draft(&author, CandidateBody::sql("SELECT 2"), "");
        assert_eq!(second.provenance.parent, Some(first.id));
        assert_eq!(second.provenance.repair_attempt, 1);
    }
}
