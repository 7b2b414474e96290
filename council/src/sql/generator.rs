//! SQL candidate generation.
//!
//! A [`CandidateGenerator`] always yields a candidate for a reachable
//! backend: output it cannot use becomes a "cannot answer" sentinel, never
//! an error. Only backend failures are returned as `Err`, so the caller
//! can retry and eventually abstain.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::agent::backend::{BackendError, BackendRequest, ReasoningBackend};
use crate::agent::llm::{parse_payload, payload_schema, Persona, ProposalPayload};
use crate::agent::{prompts, Agent, AgentContext, AgentError, Capability};
use crate::model::candidate::{AgentId, Candidate, CandidateBody};
use crate::sql::{normalize, unknown_tables};

/// Turns a question + schema (+ optional repair hint) into a candidate.
///
/// `ctx` carries the question, schema, and for repairs the parent
/// candidate and the single trigger to correct.
#[async_trait]
pub trait CandidateGenerator: Send + Sync {
    async fn generate(&self, ctx: &AgentContext, author: &AgentId) -> Result<Candidate, BackendError>;
}

static FENCED_SQL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```(?:sql)?\s*\n(.*?)```").expect("valid regex")
});

static BARE_QUERY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\b((?:select\b|with\s+\w+\s+as\s*\().*)").expect("valid regex"));

/// What a raw completion contained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedOutput {
    Sql { statement: String, rationale: String },
    Answer { text: String, rationale: String },
    Unusable,
}

/// Pull a statement out of model output: JSON payload first, then a
/// fenced SQL block, then a bare `SELECT`/`WITH` tail.
pub fn parse_generation(raw: &str) -> ParsedOutput {
    if let Some(p) = parse_payload::<ProposalPayload>(raw) {
        if let Some(sql) = p.sql.filter(|s| !s.trim().is_empty()) {
            return ParsedOutput::Sql {
                statement: sql.trim().to_string(),
                rationale: p.rationale,
            };
        }
        if let Some(text) = p.answer.filter(|s| !s.trim().is_empty()) {
            return ParsedOutput::Answer {
                text: text.trim().to_string(),
                rationale: p.rationale,
            };
        }
        return ParsedOutput::Unusable;
    }
    if let Some(caps) = FENCED_SQL.captures(raw) {
        let statement = caps[1].trim();
        if !statement.is_empty() {
            return ParsedOutput::Sql {
                statement: statement.to_string(),
                rationale: String::new(),
            };
        }
    }
    if let Some(caps) = BARE_QUERY.captures(raw) {
        return ParsedOutput::Sql {
            statement: caps[1].trim().to_string(),
            rationale: String::new(),
        };
    }
    ParsedOutput::Unusable
}

/// Why a parsed statement cannot be used as-is.
fn defect(statement: &str, ctx: &AgentContext) -> Option<String> {
    if let Some(previous) = ctx.hint.as_ref().and_then(|h| h.failing_statement()) {
        if normalize(previous) == normalize(statement) {
            return Some("repeated the failing statement verbatim".to_string());
        }
    }
    let unknown = unknown_tables(statement, &ctx.schema);
    if !unknown.is_empty() {
        return Some(format!("references tables not in the schema: {}", unknown.join(", ")));
    }
    None
}

/// Generator driven by a reasoning backend.
pub struct LlmSqlGenerator {
    backend: Arc<dyn ReasoningBackend>,
    /// Completions requested per call before giving up with a sentinel.
    max_attempts: u32,
}

impl LlmSqlGenerator {
    pub fn new(backend: Arc<dyn ReasoningBackend>) -> Self {
        Self {
            backend,
            max_attempts: 2,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

#[async_trait]
impl CandidateGenerator for LlmSqlGenerator {
    async fn generate(&self, ctx: &AgentContext, author: &AgentId) -> Result<Candidate, BackendError> {
        let schema_json = payload_schema::<ProposalPayload>();
        let base_prompt = prompts::proposal_prompt(ctx, &schema_json);
        let mut note: Option<String> = None;
        let mut last_raw = String::new();

        for attempt in 1..=self.max_attempts {
            let prompt = match &note {
                Some(n) => format!("{}\n## Correction\n\nYour previous answer {}. Try again.\n", base_prompt, n),
                None => base_prompt.clone(),
            };
            let request = BackendRequest::new(prompts::system_prompt(Persona::DataDetective), &prompt);
            let response = self.backend.complete(&request).await?;
            last_raw = response.text;

            match parse_generation(&last_raw) {
                ParsedOutput::Sql { statement, rationale } => match defect(&statement, ctx) {
                    None => {
                        debug!(agent = %author, attempt, "Generated SQL candidate");
                        return Ok(ctx
                            .draft(author, CandidateBody::sql(&statement), &rationale)
                            .with_raw_output(&last_raw));
                    }
                    Some(problem) => {
                        warn!(agent = %author, attempt, problem = %problem, "Generated SQL rejected");
                        note = Some(problem);
                    }
                },
                ParsedOutput::Answer { text, rationale } => {
                    return Ok(ctx
                        .draft(author, CandidateBody::answer(&text), &rationale)
                        .with_raw_output(&last_raw));
                }
                ParsedOutput::Unusable => {
                    warn!(agent = %author, attempt, "Generator output had no usable query");
                    note = Some("contained no usable SQL or answer".to_string());
                }
            }
        }

        let reason = note.unwrap_or_else(|| "no usable output".to_string());
        Ok(ctx
            .draft(author, CandidateBody::cannot_answer(&reason), "")
            .with_raw_output(&last_raw))
    }
}

/// A proposer agent backed by a generator.
pub struct GeneratorProposer {
    id: AgentId,
    capabilities: Vec<Capability>,
    generator: Arc<dyn CandidateGenerator>,
}

impl GeneratorProposer {
    pub fn new(id: &str, generator: Arc<dyn CandidateGenerator>) -> Self {
        Self {
            id: AgentId::new(id),
            capabilities: vec![Capability::Proposer],
            generator,
        }
    }
}

#[async_trait]
impl Agent for GeneratorProposer {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn propose(&self, ctx: &AgentContext) -> Result<Candidate, AgentError> {
        self.generator
            .generate(ctx, &self.id)
            .await
            .map_err(|e| AgentError::from_backend(&self.id, &e))
    }
}
