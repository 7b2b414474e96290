//! LLM-backed agents: personas, structured payloads, lenient parsing.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::backend::{BackendRequest, ReasoningBackend};
use crate::agent::prompts;
use crate::agent::{Agent, AgentContext, AgentError, AuditReport, Capability, Synthesis};
use crate::debate::consensus::Verdict;
use crate::debate::critique::{Critique, CritiqueVerdict};
use crate::model::candidate::{AgentId, Candidate};
use crate::model::execution::{ExecutionResult, ResultSummary};

/// Council personas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    DataDetective,
    Optimist,
    Pessimist,
    EthicalAuditor,
    SynthesisModerator,
}

impl Persona {
    pub const ALL: [Persona; 5] = [
        Self::DataDetective,
        Self::Optimist,
        Self::Pessimist,
        Self::EthicalAuditor,
        Self::SynthesisModerator,
    ];

    /// Capabilities the persona holds by default.
    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            Self::DataDetective => &[Capability::Proposer],
            Self::Optimist | Self::Pessimist => &[Capability::Critic],
            Self::EthicalAuditor => &[Capability::Judge],
            Self::SynthesisModerator => &[Capability::Aggregator],
        }
    }

    /// Parse a persona name (`optimist`, `data_detective`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "data_detective" | "detective" => Some(Self::DataDetective),
            "optimist" => Some(Self::Optimist),
            "pessimist" => Some(Self::Pessimist),
            "ethical_auditor" | "ethical" | "auditor" => Some(Self::EthicalAuditor),
            "synthesis_moderator" | "synthesis" | "moderator" => Some(Self::SynthesisModerator),
            _ => None,
        }
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DataDetective => write!(f, "data_detective"),
            Self::Optimist => write!(f, "optimist"),
            Self::Pessimist => write!(f, "pessimist"),
            Self::EthicalAuditor => write!(f, "ethical_auditor"),
            Self::SynthesisModerator => write!(f, "synthesis_moderator"),
        }
    }
}

/// Structured proposal requested from a proposer model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProposalPayload {
    /// A single read-only SQL statement.
    pub sql: Option<String>,
    /// A direct answer when no query is needed.
    pub answer: Option<String>,
    /// Why this query answers the question.
    #[serde(default)]
    pub rationale: String,
}

/// Structured critique requested from a critic model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CritiquePayload {
    pub verdict: CritiqueVerdict,
    #[serde(default)]
    pub rationale: String,
    pub suggested_revision: Option<String>,
}

/// Structured audit requested from a judge model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AuditPayload {
    /// True when no material fairness concern was found.
    pub passed: bool,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

/// Pretty JSON Schema for a payload type, embedded in prompts.
pub fn payload_schema<T: JsonSchema>() -> String {
    let schema = schemars::schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".to_string())
}

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(\{.*?\})\s*```").expect("valid regex")
});

/// Find a JSON object in model output: the whole text, a fenced block,
/// or the outermost `{ ... }` span.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(v @ serde_json::Value::Object(_)) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(v);
    }
    if let Some(caps) = FENCED_JSON.captures(trimmed) {
        if let Ok(v) = serde_json::from_str(&caps[1]) {
            return Some(v);
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Parse a typed payload leniently.
pub fn parse_payload<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    extract_json(text).and_then(|v| serde_json::from_value(v).ok())
}

/// Parse critique output. Falls back to a loose `verdict:` scan, and
/// finally to `revise` with the raw text as rationale.
pub fn parse_critique(text: &str) -> CritiquePayload {
    if let Some(p) = parse_payload::<CritiquePayload>(text) {
        return p;
    }
    if let Some(v) = extract_json(text) {
        if let Some(verdict) = v["verdict"].as_str().and_then(CritiqueVerdict::parse_loose) {
            return CritiquePayload {
                verdict,
                rationale: v["rationale"].as_str().unwrap_or_default().to_string(),
                suggested_revision: v["suggested_revision"].as_str().map(str::to_string),
            };
        }
    }
    static VERDICT_LINE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)verdict\W{0,3}\s*(accept|reject|revise)").expect("valid regex")
    });
    if let Some(caps) = VERDICT_LINE.captures(text) {
        if let Some(verdict) = CritiqueVerdict::parse_loose(&caps[1]) {
            return CritiquePayload {
                verdict,
                rationale: text.trim().to_string(),
                suggested_revision: None,
            };
        }
    }
    CritiquePayload {
        verdict: CritiqueVerdict::Revise,
        rationale: format!("unparseable critique output: {}", text.trim()),
        suggested_revision: None,
    }
}

/// An agent whose critiques, syntheses and audits come from a model.
pub struct LlmAgent {
    id: AgentId,
    persona: Persona,
    capabilities: Vec<Capability>,
    backend: Arc<dyn ReasoningBackend>,
}

impl LlmAgent {
    pub fn new(id: &str, persona: Persona, backend: Arc<dyn ReasoningBackend>) -> Self {
        Self {
            id: AgentId::new(id),
            persona,
            capabilities: persona.capabilities().to_vec(),
            backend,
        }
    }

    /// Override the persona's default capability set.
    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    pub fn persona(&self) -> Persona {
        self.persona
    }

    async fn ask(&self, prompt: String, json_mode: bool) -> Result<String, AgentError> {
        let mut request = BackendRequest::new(prompts::system_prompt(self.persona), &prompt);
        request.json_mode = json_mode;
        let response = self
            .backend
            .complete(&request)
            .await
            .map_err(|e| AgentError::from_backend(&self.id, &e))?;
        debug!(
            agent = %self.id,
            model = %response.model,
            elapsed_ms = response.elapsed_ms,
            "Backend responded"
        );
        Ok(response.text)
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn critique(
        &self,
        candidate: &Candidate,
        execution: Option<&ExecutionResult>,
        ctx: &AgentContext,
    ) -> Result<Critique, AgentError> {
        if !self.has(Capability::Critic) {
            return Err(AgentError::unsupported(&self.id, Capability::Critic));
        }
        let prompt = prompts::critique_prompt(
            candidate,
            execution,
            ctx,
            &payload_schema::<CritiquePayload>(),
        );
        let raw = self.ask(prompt, true).await?;
        let payload = parse_critique(&raw);
        let mut critique = Critique::new(&self.id, candidate.id, payload.verdict, &payload.rationale)
            .with_raw_output(&raw);
        critique.suggested_revision = payload.suggested_revision;
        Ok(critique)
    }

    async fn synthesize(&self, verdict: &Verdict, ctx: &AgentContext) -> Result<Synthesis, AgentError> {
        if !self.has(Capability::Aggregator) {
            return Err(AgentError::unsupported(&self.id, Capability::Aggregator));
        }
        let raw = self.ask(prompts::synthesis_prompt(verdict, ctx), false).await?;
        Ok(Synthesis {
            agent: self.id.clone(),
            narrative: raw.trim().to_string(),
            raw_output: Some(raw),
            created_at: Utc::now(),
        })
    }

    async fn audit(
        &self,
        _verdict: &Verdict,
        result: &ResultSummary,
        ctx: &AgentContext,
    ) -> Result<AuditReport, AgentError> {
        if !self.has(Capability::Judge) {
            return Err(AgentError::unsupported(&self.id, Capability::Judge));
        }
        let prompt = prompts::audit_prompt(result, ctx, &payload_schema::<AuditPayload>());
        let raw = self.ask(prompt, true).await?;
        let payload = match parse_payload::<AuditPayload>(&raw) {
            Some(p) => p,
            None => {
                warn!(agent = %self.id, "Audit output was not valid JSON");
                return Err(AgentError::Malformed {
                    agent: self.id.clone(),
                    reason: "audit output was not a JSON object".into(),
                });
            }
        };
        Ok(AuditReport {
            agent: self.id.clone(),
            passed: payload.passed,
            concerns: payload.concerns,
            rationale: payload.rationale,
            raw_output: Some(raw),
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::backend::{BackendError, BackendResponse};
    use crate::model::candidate::CandidateBody;
    use crate::model::question::{Question, Schema};

    struct Canned(String);

    #[async_trait]
    impl ReasoningBackend for Canned {
        fn label(&self) -> &str {
            "canned"
        }
        async fn complete(&self, _request: &BackendRequest) -> Result<BackendResponse, BackendError> {
            Ok(BackendResponse {
                text: self.0.clone(),
                model: "canned".into(),
                elapsed_ms: 0,
            })
        }
    }

    struct Down;

    #[async_trait]
    impl ReasoningBackend for Down {
        fn label(&self) -> &str {
            "down"
        }
        async fn complete(&self, _request: &BackendRequest) -> Result<BackendResponse, BackendError> {
            Err(BackendError::Status {
                status: 503,
                body: "overloaded".into(),
            })
        }
    }

    fn ctx() -> AgentContext {
        AgentContext::new(Arc::new(Question::new("q")), Arc::new(Schema::new()))
    }

    #[test]
    fn test_extract_json_variants() {
        assert!(extract_json(r#"{"a":1}"#).is_some());
        assert!(extract_json("Here you go:\n```json\n{\"a\": 1}\n```\nthanks").is_some());
        assert!(extract_json("noise {\"a\": {\"b\": 2}} trailing").is_some());
        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn test_parse_critique_structured() {
        let p = parse_critique(r#"{"verdict":"reject","rationale":"wrong table","suggested_revision":null}"#);
        assert_eq!(p.verdict, CritiqueVerdict::Reject);
        assert_eq!(p.rationale, "wrong table");
    }

    #[test]
    fn test_parse_critique_loose_word() {
        let p = parse_critique(r#"{"verdict":"Approved","rationale":"fine"}"#);
        assert_eq!(p.verdict, CritiqueVerdict::Accept);
        let p = parse_critique("Verdict: ACCEPT. Looks right.");
        assert_eq!(p.verdict, CritiqueVerdict::Accept);
    }

    #[test]
    fn test_parse_critique_garbage_is_revise() {
        let p = parse_critique("I am not sure what you want");
        assert_eq!(p.verdict, CritiqueVerdict::Revise);
        assert!(p.rationale.contains("I am not sure"));
    }

    #[test]
    fn test_payload_schema_mentions_fields() {
        let schema = payload_schema::<CritiquePayload>();
        assert!(schema.contains("verdict"));
        assert!(schema.contains("suggested_revision"));
    }

    #[test]
    fn test_persona_parse_and_caps() {
        assert_eq!(Persona::parse("Ethical-Auditor"), Some(Persona::EthicalAuditor));
        assert_eq!(Persona::parse("synthesis"), Some(Persona::SynthesisModerator));
        assert_eq!(Persona::Pessimist.capabilities(), &[Capability::Critic]);
    }

    #[tokio::test]
    async fn test_critique_records_raw_output() {
        let raw = r#"{"verdict":"revise","rationale":"add filter","suggested_revision":"WHERE x"}"#;
        let agent = LlmAgent::new("pessimist", Persona::Pessimist, Arc::new(Canned(raw.into())));
        let candidate = Candidate::seed(&AgentId::new("d"), 0, CandidateBody::sql("SELECT 1"), "");
        let c = agent.critique(&candidate, None, &ctx()).await.unwrap();
        assert_eq!(c.verdict, CritiqueVerdict::Revise);
        assert_eq!(c.suggested_revision.as_deref(), Some("WHERE x"));
        assert_eq!(c.raw_output.as_deref(), Some(raw));
        assert_eq!(c.candidate, candidate.id);
    }

    #[tokio::test]
    async fn test_backend_outage_is_unavailable() {
        let agent = LlmAgent::new("optimist", Persona::Optimist, Arc::new(Down));
        let candidate = Candidate::seed(&AgentId::new("d"), 0, CandidateBody::sql("SELECT 1"), "");
        let err = agent.critique(&candidate, None, &ctx()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_critic_cannot_audit() {
        let agent = LlmAgent::new("optimist", Persona::Optimist, Arc::new(Canned("{}".into())));
        let summary = ResultSummary {
            row_count: 0,
            columns: vec![],
            sample_rows: vec![],
            truncated: false,
            payload_bytes: 0,
            elapsed_ms: 0,
        };
        let verdict = Verdict::NoConsensus(crate::debate::consensus::NoConsensus {
            reason: "x".into(),
            rounds: 1,
            earlier_accepts: false,
            tally: vec![],
        });
        let err = agent.audit(&verdict, &summary, &ctx()).await.unwrap_err();
        assert!(matches!(err, AgentError::Unsupported { .. }));
    }
}
