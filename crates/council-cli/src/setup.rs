//! Wiring of backends, agents and query engines from the environment.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use insight_council::agent::backend::{
    AnthropicBackend, FallbackBackend, OpenAiCompatibleBackend, ReasoningBackend,
};
use insight_council::agent::llm::{LlmAgent, Persona};
use insight_council::resilience::CircuitBreaker;
use insight_council::sandbox::{BigQueryEngine, PostgresEngine};
use insight_council::sql::{GeneratorProposer, LlmSqlGenerator};
use insight_council::{Agent, Capability, ColumnDef, Council, QueryEngine, Schema};
use tracing::{info, warn};

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_LLM_TIMEOUT_MS: u64 = 60_000;

/// Which warehouse the sandbox talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EngineKind {
    Bigquery,
    Postgres,
}

/// Backend endpoints and model chains read from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSettings {
    pub openai_url: String,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub timeout: Duration,
    /// Ordered model names per persona.
    pub chains: BTreeMap<Persona, Vec<String>>,
}

impl BackendSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `COUNCIL_LLM_URL`, `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`,
    /// `COUNCIL_LLM_TIMEOUT_MS`, `COUNCIL_MODELS` and per persona
    /// `<PERSONA>_MODELS` (comma separated, first entry preferred).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let fallback_chain = non_empty("COUNCIL_MODELS")
            .map(|v| split_models(&v))
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_MODEL.to_string()]);

        let chains = Persona::ALL
            .iter()
            .map(|persona| {
                let key = format!("{}_MODELS", persona.to_string().to_uppercase());
                let chain = non_empty(&key)
                    .map(|v| split_models(&v))
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| fallback_chain.clone());
                (*persona, chain)
            })
            .collect();

        Self {
            openai_url: non_empty("COUNCIL_LLM_URL").unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
            openai_api_key: non_empty("OPENAI_API_KEY"),
            anthropic_api_key: non_empty("ANTHROPIC_API_KEY"),
            timeout: Duration::from_millis(
                non_empty("COUNCIL_LLM_TIMEOUT_MS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(DEFAULT_LLM_TIMEOUT_MS),
            ),
            chains,
        }
    }

    pub fn chain(&self, persona: Persona) -> &[String] {
        self.chains.get(&persona).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `claude-*` models go to the messages API when a key is present.
    fn routes_to_anthropic(&self, model: &str) -> bool {
        self.anthropic_api_key.is_some() && model.starts_with("claude")
    }

    /// Fallback chain for one persona.
    pub fn backend_for(&self, persona: Persona) -> Result<Arc<dyn ReasoningBackend>> {
        let mut chain: Vec<Box<dyn ReasoningBackend>> = Vec::new();
        for model in self.chain(persona) {
            let backend: Box<dyn ReasoningBackend> = match &self.anthropic_api_key {
                Some(key) if self.routes_to_anthropic(model) => Box::new(
                    AnthropicBackend::new(key, model, self.timeout)
                        .with_context(|| format!("building anthropic backend for {}", model))?,
                ),
                _ => Box::new(
                    OpenAiCompatibleBackend::new(
                        &self.openai_url,
                        self.openai_api_key.clone(),
                        model,
                        self.timeout,
                    )
                    .with_context(|| format!("building backend for {}", model))?,
                ),
            };
            chain.push(backend);
        }
        if chain.is_empty() {
            bail!("no models configured for {}", persona);
        }
        Ok(Arc::new(FallbackBackend::new(
            &persona.to_string(),
            chain,
            CircuitBreaker::new(3, Duration::from_secs(60)),
        )))
    }
}

fn split_models(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

/// Data detective proposes; optimist and pessimist critique; the ethical
/// auditor critiques and judges; the moderator synthesizes.
pub fn build_council(settings: &BackendSettings) -> Result<Council> {
    let mut agents: Vec<Arc<dyn Agent>> = Vec::new();
    for persona in Persona::ALL {
        let backend = settings.backend_for(persona)?;
        let id = persona.to_string();
        let agent: Arc<dyn Agent> = match persona {
            Persona::DataDetective => Arc::new(GeneratorProposer::new(
                &id,
                Arc::new(LlmSqlGenerator::new(backend)),
            )),
            Persona::EthicalAuditor => Arc::new(
                LlmAgent::new(&id, persona, backend)
                    .with_capabilities(&[Capability::Critic, Capability::Judge]),
            ),
            _ => Arc::new(LlmAgent::new(&id, persona, backend)),
        };
        info!(agent = %id, models = ?settings.chain(persona), "Agent configured");
        agents.push(agent);
    }
    Ok(Council::new(agents))
}

/// Engine settings read from `BQ_PROJECT_ID`, `BQ_DATASET_ID`,
/// `BQ_ACCESS_TOKEN` or `DATABASE_URL`.
pub fn build_engine(kind: EngineKind) -> Result<Arc<dyn QueryEngine>> {
    build_engine_with(kind, |key| std::env::var(key).ok())
}

pub fn build_engine_with(kind: EngineKind, lookup: impl Fn(&str) -> Option<String>) -> Result<Arc<dyn QueryEngine>> {
    match kind {
        EngineKind::Bigquery => {
            let project = lookup("BQ_PROJECT_ID").context("BQ_PROJECT_ID is not set")?;
            let token = lookup("BQ_ACCESS_TOKEN").context("BQ_ACCESS_TOKEN is not set")?;
            let mut engine =
                BigQueryEngine::new(&project, &token).context("building BigQuery client")?;
            match lookup("BQ_DATASET_ID") {
                Some(dataset) => engine = engine.with_dataset(&dataset),
                None => warn!("BQ_DATASET_ID not set; table names must be fully qualified"),
            }
            Ok(Arc::new(engine))
        }
        EngineKind::Postgres => {
            let url = lookup("DATABASE_URL").context("DATABASE_URL is not set")?;
            Ok(Arc::new(PostgresEngine::new(&url)))
        }
    }
}

/// Accepts either `{"tables": {name: {"columns": [...]}}}` or the shorter
/// `{name: [columns...]}`.
pub fn parse_schema(text: &str) -> Result<Schema> {
    let value: serde_json::Value = serde_json::from_str(text).context("schema is not valid JSON")?;
    if value.get("tables").is_some() {
        return serde_json::from_value(value).context("schema does not match the table layout");
    }
    let tables: BTreeMap<String, Vec<ColumnDef>> =
        serde_json::from_value(value).context("schema does not match the table layout")?;
    Ok(tables
        .into_iter()
        .fold(Schema::new(), |schema, (name, columns)| schema.with_table(&name, columns)))
}

pub fn load_schema(path: &Path) -> Result<Schema> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading schema {}", path.display()))?;
    let schema = parse_schema(&text)?;
    if schema.is_empty() {
        bail!("schema {} lists no tables", path.display());
    }
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_default_chains() {
        let s = BackendSettings::from_lookup(lookup(&[]));
        assert_eq!(s.openai_url, DEFAULT_OPENAI_URL);
        assert_eq!(s.timeout, Duration::from_millis(DEFAULT_LLM_TIMEOUT_MS));
        for persona in Persona::ALL {
            assert_eq!(s.chain(persona), [DEFAULT_MODEL.to_string()]);
        }
    }

    #[test]
    fn test_per_persona_chain_overrides_shared() {
        let s = BackendSettings::from_lookup(lookup(&[
            ("COUNCIL_MODELS", "m1, m2"),
            ("OPTIMIST_MODELS", "claude-sonnet-4-5,gpt-4o"),
            ("PESSIMIST_MODELS", "  "),
        ]));
        assert_eq!(s.chain(Persona::Optimist), ["claude-sonnet-4-5", "gpt-4o"]);
        assert_eq!(s.chain(Persona::Pessimist), ["m1", "m2"]);
        assert_eq!(s.chain(Persona::DataDetective), ["m1", "m2"]);
    }

    #[test]
    fn test_anthropic_routing_needs_key() {
        let without = BackendSettings::from_lookup(lookup(&[]));
        assert!(!without.routes_to_anthropic("claude-sonnet-4-5"));
        let with = BackendSettings::from_lookup(lookup(&[("ANTHROPIC_API_KEY", "k")]));
        assert!(with.routes_to_anthropic("claude-sonnet-4-5"));
        assert!(!with.routes_to_anthropic("gpt-4o"));
    }

    #[test]
    fn test_build_council_roles() {
        let s = BackendSettings::from_lookup(lookup(&[("OPENAI_API_KEY", "k")]));
        let council = build_council(&s).unwrap();
        assert_eq!(council.len(), 5);
        let proposers: Vec<String> = council.proposers().iter().map(|a| a.id().to_string()).collect();
        assert_eq!(proposers, ["data_detective"]);
        assert_eq!(council.critics().len(), 3);
        assert_eq!(council.with(Capability::Judge).len(), 1);
        assert_eq!(council.with(Capability::Aggregator).len(), 1);
    }

    #[test]
    fn test_engine_requires_env() {
        assert!(build_engine_with(EngineKind::Postgres, lookup(&[])).is_err());
        assert!(build_engine_with(EngineKind::Bigquery, lookup(&[("BQ_PROJECT_ID", "p")])).is_err());
        let engine = build_engine_with(
            EngineKind::Bigquery,
            lookup(&[("BQ_PROJECT_ID", "p"), ("BQ_ACCESS_TOKEN", "t"), ("BQ_DATASET_ID", "d")]),
        )
        .unwrap();
        assert_eq!(engine.name(), "bigquery");
    }

    #[test]
    fn test_parse_both_schema_layouts() {
        let full = parse_schema(
            r#"{"tables": {"orders": {"columns": [{"name": "id", "data_type": "INT64"}]}}}"#,
        )
        .unwrap();
        let short = parse_schema(r#"{"orders": [{"name": "id", "data_type": "INT64"}]}"#).unwrap();
        assert_eq!(full, short);
        assert!(full.has_table("orders"));
        assert!(parse_schema("[1, 2]").is_err());
    }

    #[test]
    fn test_load_schema_rejects_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        std::fs::write(&path, "{}").unwrap();
        assert!(load_schema(&path).is_err());
    }
}
