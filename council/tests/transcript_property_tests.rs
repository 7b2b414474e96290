//! Transcript property tests — full council runs across varied settings.
//!
//! Tests verify:
//! - Rounds are numbered contiguously and never exceed `max_rounds`
//! - Every candidate is stamped with the round that recorded it
//! - No lineage spends more than its repair budget
//! - Critics never review their own candidates
//! - Every proposer is accounted for as an entry or an abstention
//! - The verdict does not depend on agent registration order

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use insight_council::agent::{Agent, AgentContext, AgentError, Capability, Council};
use insight_council::debate::{Critique, CritiqueVerdict};
use insight_council::model::{
    AbstentionPhase, AgentId, Candidate, CandidateBody, ColumnDef, ExecutionResult, LineageAnnotation,
    LineageState, Question, ResultColumn, Schema, Transcript,
};
use insight_council::resilience::RetryPolicy;
use insight_council::sandbox::{EngineFailure, QueryEngine, QueryRequest, RowSet};
use insight_council::{CouncilConfig, CouncilOrchestrator};

/// Proposes `statement`; revisions resubmit the parent unchanged.
struct FixedProposer {
    id: AgentId,
    caps: Vec<Capability>,
    statement: Option<String>,
    /// Accept every candidate except its own when also a critic.
    accepts: bool,
}

impl FixedProposer {
    fn new(id: &str, statement: &str) -> Self {
        Self {
            id: AgentId::new(id),
            caps: vec![Capability::Proposer],
            statement: Some(statement.to_string()),
            accepts: true,
        }
    }

    /// A proposer that never answers.
    fn silent(id: &str) -> Self {
        Self {
            statement: None,
            ..Self::new(id, "")
        }
    }

    fn also_critic(mut self, accepts: bool) -> Self {
        self.caps.push(Capability::Critic);
        self.accepts = accepts;
        self
    }
}

#[async_trait]
impl Agent for FixedProposer {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.caps
    }

    async fn propose(&self, ctx: &AgentContext) -> Result<Candidate, AgentError> {
        let body = match (&ctx.parent, &self.statement) {
            (Some(parent), _) => parent.body.clone(),
            (None, Some(sql)) => CandidateBody::sql(sql),
            (None, None) => {
                return Err(AgentError::Malformed {
                    agent: self.id.clone(),
                    reason: "nothing to say".into(),
                })
            }
        };
        Ok(ctx.draft(&self.id, body, "fixed"))
    }

    async fn critique(
        &self,
        candidate: &Candidate,
        _execution: Option<&ExecutionResult>,
        _ctx: &AgentContext,
    ) -> Result<Critique, AgentError> {
        let verdict = if self.accepts {
            CritiqueVerdict::Accept
        } else {
            CritiqueVerdict::Reject
        };
        Ok(Critique::new(&self.id, candidate.id, verdict, "fixed"))
    }
}

/// Every proposal and repair is a new statement that the engine rejects.
struct FailingProposer {
    id: AgentId,
    caps: Vec<Capability>,
    counter: AtomicU32,
}

impl FailingProposer {
    fn new(id: &str) -> Self {
        Self {
            id: AgentId::new(id),
            caps: vec![Capability::Proposer],
            counter: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Agent for FailingProposer {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.caps
    }

    async fn propose(&self, ctx: &AgentContext) -> Result<Candidate, AgentError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let sql = format!("SELECT broken_{} FROM T", n);
        Ok(ctx.draft(&self.id, CandidateBody::sql(&sql), "failing"))
    }
}

/// Critic with a verdict chosen by the statement's trailing digit.
struct ParityCritic {
    id: AgentId,
    caps: Vec<Capability>,
    /// `None` accepts everything, `Some(p)` accepts digits of parity `p`.
    parity: Option<u32>,
}

impl ParityCritic {
    fn new(id: &str, parity: Option<u32>) -> Self {
        Self {
            id: AgentId::new(id),
            caps: vec![Capability::Critic],
            parity,
        }
    }
}

#[async_trait]
impl Agent for ParityCritic {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.caps
    }

    async fn critique(
        &self,
        candidate: &Candidate,
        execution: Option<&ExecutionResult>,
        _ctx: &AgentContext,
    ) -> Result<Critique, AgentError> {
        let digit = candidate
            .sql()
            .and_then(|s| s.chars().last())
            .and_then(|c| c.to_digit(10));
        let ok = execution.is_some_and(|e| e.is_success())
            && match (self.parity, digit) {
                (None, _) => true,
                (Some(p), Some(d)) => d % 2 == p,
                (Some(_), None) => false,
            };
        let verdict = if ok {
            CritiqueVerdict::Accept
        } else {
            CritiqueVerdict::Reject
        };
        Ok(Critique::new(&self.id, candidate.id, verdict, "parity"))
    }
}

/// Fails statements mentioning `broken`, answers everything else.
struct CountingEngine {
    calls: AtomicUsize,
}

impl CountingEngine {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl QueryEngine for CountingEngine {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn execute(&self, request: &QueryRequest) -> Result<RowSet, EngineFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.sql.contains("broken") {
            return Err(EngineFailure::Query {
                code: Some("42703".into()),
                message: "column does not exist".into(),
            });
        }
        Ok(RowSet {
            columns: vec![ResultColumn::new("n", "INT64")],
            rows: vec![vec![serde_json::json!(7)]],
            total_rows: Some(1),
        })
    }
}

fn schema() -> Schema {
    Schema::new().with_table("T", vec![ColumnDef::new("id", "INT64", false)])
}

fn config(max_rounds: u32, max_repair_attempts: u32, early_convergence: bool) -> CouncilConfig {
    let mut config = CouncilConfig::default();
    config.max_rounds = max_rounds;
    config.max_repair_attempts = max_repair_attempts;
    config.early_convergence = early_convergence;
    config.retry = RetryPolicy::none();
    config.sandbox.unavailable_retries = 0;
    config.round_timeout_ms = 5_000;
    config.execution_timeout_ms = 1_000;
    config
}

async fn run(config: CouncilConfig, agents: Vec<Arc<dyn Agent>>, engine: Arc<CountingEngine>) -> Transcript {
    let orchestrator = CouncilOrchestrator::new(config, Council::new(agents), engine).unwrap();
    orchestrator
        .run(Question::new("how many rows in T?"), schema())
        .await
        .unwrap()
        .transcript
}

fn assert_well_formed(transcript: &Transcript) {
    assert!(transcript.is_contiguous());
    for (idx, round) in transcript.rounds().iter().enumerate() {
        assert_eq!(round.number, idx as u32);
        for entry in &round.entries {
            for step in entry.lineage.steps() {
                assert_eq!(step.candidate.provenance.round, round.number);
            }
            assert!(entry.lineage.state().is_terminal());
        }
        let authors: Vec<&AgentId> = round.entries.iter().map(|e| e.author()).collect();
        let mut sorted = authors.clone();
        sorted.sort();
        assert_eq!(authors, sorted, "entries must be in author order");
    }
}

// ── Property: contiguous rounds capped by max_rounds ───────────────

#[tokio::test]
async fn prop_rounds_contiguous_and_capped() {
    for max_rounds in 1..=4 {
        for early in [true, false] {
            let agents: Vec<Arc<dyn Agent>> = vec![
                Arc::new(FixedProposer::new("detective", "SELECT COUNT(*) FROM T")),
                Arc::new(FixedProposer::new("skeptic", "SELECT COUNT(id) FROM T").also_critic(false)),
                Arc::new(ParityCritic::new("pessimist", Some(1))),
            ];
            let transcript = run(config(max_rounds, 3, early), agents, CountingEngine::new()).await;
            assert_well_formed(&transcript);
            assert_eq!(
                transcript.len() as u32,
                max_rounds,
                "max_rounds={} early={}: nobody converges so every round runs",
                max_rounds,
                early
            );
        }
    }
}

// ── Property: early convergence stops after the first unanimous round ─

#[tokio::test]
async fn prop_early_convergence_stops_at_round_zero() {
    for max_rounds in 1..=4 {
        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(FixedProposer::new("detective", "SELECT COUNT(*) FROM T")),
            Arc::new(ParityCritic::new("optimist", None)),
            Arc::new(ParityCritic::new("realist", None)),
        ];
        let transcript = run(config(max_rounds, 3, true), agents, CountingEngine::new()).await;
        assert_eq!(transcript.len(), 1);
        assert!(transcript.rounds()[0].converged_on.is_some());
    }
}

// ── Property: repair budget is never exceeded ──────────────────────

#[tokio::test]
async fn prop_repair_budget_respected() {
    for budget in 0..=4 {
        let engine = CountingEngine::new();
        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(FailingProposer::new("detective")),
            Arc::new(ParityCritic::new("pessimist", None)),
        ];
        let transcript = run(config(2, budget, true), agents, engine.clone()).await;
        assert_well_formed(&transcript);
        assert_eq!(transcript.len(), 2);

        for round in transcript.rounds() {
            for entry in &round.entries {
                assert!(entry.lineage.repair_attempts() <= budget);
                assert_eq!(entry.lineage.state(), LineageState::Abandoned);
                assert!(entry.lineage.is_exhausted());
            }
        }

        let seed = &transcript.rounds()[0].entries[0].lineage;
        assert_eq!(seed.steps().len() as u32, budget + 1);

        let carried = &transcript.rounds()[1].entries[0].lineage;
        assert_eq!(carried.steps().len(), 1);
        assert!(carried
            .annotations()
            .iter()
            .any(|a| matches!(a, LineageAnnotation::CarriedForward { .. })));

        assert_eq!(
            engine.calls.load(Ordering::SeqCst) as u32,
            budget + 1,
            "carried candidates are not executed again"
        );
    }
}

// ── Property: critics never review their own candidates ────────────

#[tokio::test]
async fn prop_no_self_review() {
    for size in 2..=5 {
        let agents: Vec<Arc<dyn Agent>> = (0..size)
            .map(|k| {
                let sql = format!("SELECT COUNT(*) FROM T WHERE id > {}", k);
                Arc::new(FixedProposer::new(&format!("agent_{}", k), &sql).also_critic(true)) as Arc<dyn Agent>
            })
            .collect();
        let transcript = run(config(2, 3, false), agents, CountingEngine::new()).await;
        assert_well_formed(&transcript);
        for round in transcript.rounds() {
            assert_eq!(round.entries.len(), size);
            for entry in &round.entries {
                assert_eq!(entry.critiques.len(), size - 1);
                assert!(entry.critiques.iter().all(|c| &c.critic != entry.author()));
                assert!(entry.critiques.iter().all(|c| c.candidate == entry.candidate().id));
            }
        }
    }
}

// ── Property: proposers appear as entries or abstentions ───────────

#[tokio::test]
async fn prop_every_proposer_accounted_for() {
    for silent in 0..=2 {
        let mut agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(FixedProposer::new("detective", "SELECT COUNT(*) FROM T")),
            Arc::new(ParityCritic::new("pessimist", Some(0))),
        ];
        for k in 0..silent {
            agents.push(Arc::new(FixedProposer::silent(&format!("mute_{}", k))));
        }
        let transcript = run(config(2, 1, false), agents, CountingEngine::new()).await;

        let expected: BTreeSet<String> = std::iter::once("detective".to_string())
            .chain((0..silent).map(|k| format!("mute_{}", k)))
            .collect();
        for round in transcript.rounds() {
            let mut seen: BTreeSet<String> = round.entries.iter().map(|e| e.author().to_string()).collect();
            for abstention in &round.abstentions {
                if abstention.phase == AbstentionPhase::Propose {
                    assert!(
                        seen.insert(abstention.agent.to_string()),
                        "a proposer cannot both answer and abstain"
                    );
                }
            }
            assert_eq!(seen, expected);
            assert_eq!(round.metrics.abstentions, round.abstentions.len());
        }
    }
}

// ── Property: registration order does not change the verdict ───────

#[tokio::test]
async fn prop_verdict_independent_of_agent_order() {
    let build = || -> Vec<Arc<dyn Agent>> {
        vec![
            Arc::new(FixedProposer::new("p0", "SELECT COUNT(*) FROM T WHERE id > 0")),
            Arc::new(FixedProposer::new("p1", "SELECT COUNT(*) FROM T WHERE id > 1")),
            Arc::new(FixedProposer::new("p2", "SELECT COUNT(*) FROM T WHERE id > 2")),
            Arc::new(ParityCritic::new("c_all", None)),
            Arc::new(ParityCritic::new("c_odd", Some(1))),
        ]
    };

    let mut outcomes = Vec::new();
    for rotation in 0..5 {
        let mut agents = build();
        agents.rotate_left(rotation);
        if rotation % 2 == 1 {
            agents.reverse();
        }
        let orchestrator =
            CouncilOrchestrator::new(config(3, 3, true), Council::new(agents), CountingEngine::new()).unwrap();
        let outcome = orchestrator
            .run(Question::new("how many rows in T?"), schema())
            .await
            .unwrap();
        let chosen = outcome.verdict.chosen().expect("decided");
        outcomes.push((
            chosen.author().to_string(),
            chosen.sql().map(str::to_string),
            outcome.verdict.tie_break(),
            outcome.transcript.len(),
        ));
    }

    assert!(outcomes.windows(2).all(|w| w[0] == w[1]), "{:?}", outcomes);
    assert_eq!(outcomes[0].0, "p1");
}
