//! Council orchestrator — drives one question from receipt to verdict.
//!
//! ```text
//! Received → Generating ─(round 0)─┬─ converged ──────────────┐
//!                                  └→ Debating ─(rounds 1..)─→ Deciding → Completed
//!     any unrecoverable failure ─────────────────────────────────────────→ Failed
//! ```
//!
//! The orchestrator owns the transcript and is the only writer: rounds are
//! appended here after the round engine closes them. A failed session still
//! returns (and stores) the rounds that did close.

pub mod state;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{
    Agent, AgentContext, AgentError, AuditOutcome, AuditReport, Capability, Council, Synthesis,
};
use crate::config::{ConfigError, CouncilConfig};
use crate::debate::bias::{BiasAnalyzer, BiasReport};
use crate::debate::consensus::{decide, Verdict};
use crate::debate::correction::CorrectionLoop;
use crate::debate::persistence::{TranscriptRecord, TranscriptStore};
use crate::debate::round::{RoundEngine, RoundError};
use crate::model::execution::ResultSummary;
use crate::model::question::{Question, Schema};
use crate::model::transcript::{Abstention, AbstentionPhase, Transcript};
use crate::resilience::retry_with_backoff;
use crate::sandbox::{QueryEngine, Sandbox};

pub use state::{CouncilPhase, CouncilSession, PhaseTransition, TransitionError};

/// Column-name fragments that mark a result as describing people.
pub const DEMOGRAPHIC_INDICATORS: &[&str] = &[
    "gender",
    "sex",
    "age",
    "age_group",
    "age_range",
    "birth_date",
    "region",
    "state",
    "country",
    "location",
    "zip_code",
    "postal_code",
    "race",
    "ethnicity",
    "nationality",
    "culture",
    "language",
    "income",
    "education",
    "occupation",
    "employment",
];

/// Columns of `summary` that look demographic.
///
/// Single-word indicators match whole name tokens (`customer_age`, not
/// `usage`); compound indicators match as substrings.
pub fn demographic_columns(summary: &ResultSummary) -> Vec<String> {
    summary
        .column_names()
        .filter(|name| {
            let lower = name.to_ascii_lowercase();
            let tokens: Vec<&str> = lower.split(|c: char| !c.is_ascii_alphanumeric()).collect();
            DEMOGRAPHIC_INDICATORS.iter().any(|ind| {
                if ind.contains('_') {
                    lower.contains(ind)
                } else {
                    tokens.contains(ind)
                }
            })
        })
        .map(str::to_string)
        .collect()
}

/// Content hash of the question text and start time.
pub fn transcript_id(question: &Question, started_at: DateTime<Utc>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(question.text.as_bytes());
    hasher.update(started_at.to_rfc3339().as_bytes());
    hasher.finalize().to_hex().as_str()[..16].to_string()
}

/// The council cannot run as assembled.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("council has no proposer")]
    NoProposer,

    #[error("council has no critic")]
    NoCritic,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Unrecoverable session failure, carrying every round that closed.
#[derive(Debug, Clone, Error)]
#[error("council session {id} failed during {phase}: {reason}")]
pub struct OrchestratorFailure {
    pub id: String,
    /// Phase the session was in when it failed.
    pub phase: CouncilPhase,
    pub reason: String,
    pub transcript: Box<Transcript>,
    pub phases: Vec<PhaseTransition>,
}

/// Result of a completed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilOutcome {
    pub id: String,
    pub question: Question,
    pub verdict: Verdict,
    pub synthesis: Option<Synthesis>,
    pub audit: AuditOutcome,
    pub transcript: Transcript,
    pub phases: Vec<PhaseTransition>,
    pub post_decision_abstentions: Vec<Abstention>,
    pub bias: BiasReport,
    /// Whether a configured store accepted the record.
    pub stored: bool,
}

/// Runs questions through the council.
pub struct CouncilOrchestrator {
    config: CouncilConfig,
    rounds: RoundEngine,
    store: Option<Arc<dyn TranscriptStore>>,
}

impl CouncilOrchestrator {
    pub fn new(config: CouncilConfig, council: Council, engine: Arc<dyn QueryEngine>) -> Result<Self, SetupError> {
        config.validate()?;
        if council.proposers().is_empty() {
            return Err(SetupError::NoProposer);
        }
        if council.critics().is_empty() {
            return Err(SetupError::NoCritic);
        }
        let sandbox = Arc::new(
            Sandbox::new(engine, config.sandbox.clone(), config.execution_timeout()).with_backoff(&config.retry),
        );
        let correction = CorrectionLoop::new(sandbox, config.max_repair_attempts).with_retry(config.retry.clone());
        let rounds = RoundEngine::new(council, correction, config.round_timeout()).with_retry(config.retry.clone());
        info!(
            agents = ?rounds.council(),
            max_rounds = config.max_rounds,
            max_repair_attempts = config.max_repair_attempts,
            "Council assembled"
        );
        Ok(Self {
            config,
            rounds,
            store: None,
        })
    }

    /// Persist every finished session to `store`.
    pub fn with_store(mut self, store: Arc<dyn TranscriptStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &CouncilConfig {
        &self.config
    }

    pub fn council(&self) -> &Council {
        self.rounds.council()
    }

    pub async fn run(&self, question: Question, schema: Schema) -> Result<CouncilOutcome, OrchestratorFailure> {
        self.run_with_cancel(question, schema, CancellationToken::new()).await
    }

    /// Run one question. Cancelling `cancel` stops the current round; closed
    /// rounds are still decided.
    pub async fn run_with_cancel(
        &self,
        question: Question,
        schema: Schema,
        cancel: CancellationToken,
    ) -> Result<CouncilOutcome, OrchestratorFailure> {
        let started_at = Utc::now();
        let id = transcript_id(&question, started_at);
        let mut session = CouncilSession::new(&id);
        let mut transcript = Transcript::new(question.id);
        let question = Arc::new(question);
        let schema = Arc::new(schema);
        let base = AgentContext::new(question.clone(), schema.clone());
        let deadline = self.config.question_timeout().map(|t| Instant::now() + t);

        info!(id = %id, question_id = %question.id, question = %question.text, "Question received");

        if let Err(e) = session.transition(CouncilPhase::Generating, "question received") {
            return Err(self.fail(&mut session, transcript, &question, &schema, started_at, &e.to_string()).await);
        }

        for number in 0..self.config.max_rounds {
            if number == 1 {
                if let Err(e) = session.transition(CouncilPhase::Debating, "seed round closed") {
                    return Err(self.fail(&mut session, transcript, &question, &schema, started_at, &e.to_string()).await);
                }
            }

            let running = self.rounds.run(&base, &transcript, &cancel);
            let outcome = match deadline {
                Some(d) => match tokio::time::timeout_at(d, running).await {
                    Ok(r) => r,
                    Err(_) => {
                        warn!(id = %id, round = number, "Question deadline reached");
                        Err(RoundError::Cancelled { round: number })
                    }
                },
                None => running.await,
            };

            match outcome {
                Ok(round) => {
                    let converged = round.converged_on;
                    if let Err(e) = transcript.append(round) {
                        return Err(self.fail(&mut session, transcript, &question, &schema, started_at, &e.to_string()).await);
                    }
                    if self.config.early_convergence {
                        if let Some(candidate) = converged {
                            info!(id = %id, round = number, candidate = %candidate, "Early convergence");
                            break;
                        }
                    }
                }
                Err(RoundError::Cancelled { round }) => {
                    if transcript.is_empty() {
                        let reason = format!("cancelled during round {} before any round closed", round);
                        return Err(self.fail(&mut session, transcript, &question, &schema, started_at, &reason).await);
                    }
                    warn!(id = %id, round, closed = transcript.len(), "Round cancelled; deciding over closed rounds");
                    break;
                }
                Err(RoundError::Correction(e)) => {
                    error!(id = %id, round = number, error = %e, "Unrecoverable failure");
                    return Err(self.fail(&mut session, transcript, &question, &schema, started_at, &e.to_string()).await);
                }
            }
        }

        if let Err(e) = session.transition(CouncilPhase::Deciding, "debate finished") {
            return Err(self.fail(&mut session, transcript, &question, &schema, started_at, &e.to_string()).await);
        }
        let verdict = decide(&transcript);
        info!(id = %id, rounds = transcript.len(), verdict = %verdict, "Verdict reached");
        let bias = self.analyze_bias(&id, &transcript);

        let ctx = base.for_round(transcript.next_round_number(), Arc::new(transcript.rounds().to_vec()));
        let mut abstentions = Vec::new();
        let synthesis = self.synthesize(&verdict, &ctx, &mut abstentions).await;
        let audit = self.audit(&verdict, &ctx, &mut abstentions).await;

        if let Err(e) = session.transition(CouncilPhase::Completed, "verdict recorded") {
            return Err(self.fail(&mut session, transcript, &question, &schema, started_at, &e.to_string()).await);
        }

        let record = TranscriptRecord {
            version: TranscriptRecord::CURRENT_VERSION,
            id: id.clone(),
            question: (*question).clone(),
            schema: (*schema).clone(),
            transcript,
            phase: session.phase,
            phases: session.transitions.clone(),
            verdict: Some(verdict.clone()),
            synthesis,
            audit: Some(audit.clone()),
            bias: Some(bias.clone()),
            post_decision_abstentions: abstentions,
            failure: None,
            started_at,
            finished_at: Utc::now(),
        };
        let stored = self.store(&record).await;

        Ok(CouncilOutcome {
            id,
            question: record.question,
            verdict,
            synthesis: record.synthesis,
            audit,
            transcript: record.transcript,
            phases: record.phases,
            post_decision_abstentions: record.post_decision_abstentions,
            bias,
            stored,
        })
    }

    async fn fail(
        &self,
        session: &mut CouncilSession,
        transcript: Transcript,
        question: &Question,
        schema: &Schema,
        started_at: DateTime<Utc>,
        reason: &str,
    ) -> OrchestratorFailure {
        let phase = session.phase;
        session.fail(reason);
        error!(id = %session.id, phase = %phase, rounds = transcript.len(), reason, "Council session failed");
        let bias = (!transcript.is_empty()).then(|| self.analyze_bias(&session.id, &transcript));
        let record = TranscriptRecord {
            version: TranscriptRecord::CURRENT_VERSION,
            id: session.id.clone(),
            question: question.clone(),
            schema: schema.clone(),
            transcript,
            phase: session.phase,
            phases: session.transitions.clone(),
            verdict: None,
            synthesis: None,
            audit: None,
            bias,
            post_decision_abstentions: Vec::new(),
            failure: Some(reason.to_string()),
            started_at,
            finished_at: Utc::now(),
        };
        self.store(&record).await;
        OrchestratorFailure {
            id: record.id,
            phase,
            reason: reason.to_string(),
            transcript: Box::new(record.transcript),
            phases: record.phases,
        }
    }

    fn analyze_bias(&self, id: &str, transcript: &Transcript) -> BiasReport {
        let report = BiasAnalyzer::new(self.config.fairness_threshold).analyze(transcript);
        if report.has_violations() {
            warn!(
                id,
                violations = report.violations.len(),
                overall_bias = report.overall_bias,
                "Fairness threshold exceeded"
            );
        } else {
            info!(id, overall_bias = report.overall_bias, balance = report.balance, "Bias analysis complete");
        }
        report
    }

    async fn store(&self, record: &TranscriptRecord) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.append(record).await {
            Ok(()) => true,
            Err(e) => {
                error!(id = %record.id, error = %e, "Failed to store transcript");
                false
            }
        }
    }

    /// Bounded, retried call to a post-decision agent.
    async fn call<T, F, Fut>(&self, agent: &Arc<dyn Agent>, op: F) -> Result<T, AgentError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AgentError>>,
    {
        let limit: Duration = self.config.round_timeout();
        let attempt = retry_with_backoff(&self.config.retry, agent.id().as_str(), AgentError::is_transient, op);
        match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Unavailable {
                agent: agent.id().clone(),
                reason: format!("no response within {} ms", limit.as_millis()),
            }),
        }
    }

    async fn synthesize(
        &self,
        verdict: &Verdict,
        ctx: &AgentContext,
        abstentions: &mut Vec<Abstention>,
    ) -> Option<Synthesis> {
        let aggregator = self.council().with(Capability::Aggregator).into_iter().next()?;
        match self.call(&aggregator, || aggregator.synthesize(verdict, ctx)).await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(agent = %aggregator.id(), error = %e, "Aggregator abstained");
                abstentions.push(Abstention::new(aggregator.id(), AbstentionPhase::Synthesize, &e.to_string()));
                None
            }
        }
    }

    async fn audit(&self, verdict: &Verdict, ctx: &AgentContext, abstentions: &mut Vec<Abstention>) -> AuditOutcome {
        let Some(judge) = self.council().with(Capability::Judge).into_iter().next() else {
            return AuditOutcome::not_applicable("no judge in the council");
        };
        let Some(summary) = verdict.execution().and_then(|e| e.as_summary()) else {
            return AuditOutcome::not_applicable("no executed result to audit");
        };
        let flagged = demographic_columns(summary);
        if flagged.is_empty() {
            return AuditOutcome::not_applicable("result carries no demographic columns");
        }
        info!(agent = %judge.id(), columns = ?flagged, "Auditing demographic result");
        match self.call(&judge, || judge.audit(verdict, summary, ctx)).await {
            Ok(report) => {
                log_audit(&report);
                AuditOutcome::Reported(report)
            }
            Err(e) => {
                warn!(agent = %judge.id(), error = %e, "Judge abstained");
                abstentions.push(Abstention::new(judge.id(), AbstentionPhase::Audit, &e.to_string()));
                AuditOutcome::Abstained {
                    agent: judge.id().clone(),
                    reason: e.to_string(),
                }
            }
        }
    }
}

fn log_audit(report: &AuditReport) {
    if report.passed {
        info!(agent = %report.agent, "Audit passed");
    } else {
        warn!(agent = %report.agent, concerns = ?report.concerns, "Audit raised concerns");
    }
}
