//! Execution & validation sandbox.
//!
//! ```text
//! candidate ─▶ tokenize ──✗──▶ SyntaxError
//!              read-only ─✗──▶ UnsafeStatement   (engine never called)
//!              tables ────✗──▶ SchemaMismatch    (engine never called)
//!              engine (timeout, retries on outage) ─▶ Success | classified failure
//! ```
//!
//! Only a persistently unreachable engine escapes as an error
//! ([`SandboxUnavailable`]); everything else is an [`ExecutionResult`].

pub mod bigquery;
pub mod classify;
pub mod postgres;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::candidate::Candidate;
use crate::model::execution::{ExecutionResult, FailureKind, ResultColumn, ResultSummary};
use crate::model::question::Schema;
use crate::resilience::{retry_with_backoff, RetryPolicy};
use crate::sql::safety::{check_read_only, SafetyCheck};
use crate::sql::unknown_tables;

pub use bigquery::BigQueryEngine;
pub use postgres::PostgresEngine;

/// A read-only query handed to an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub sql: String,
    /// Rows the engine should return at most.
    pub max_rows: usize,
    /// Engine-side deadline hint.
    pub timeout: Duration,
}

/// Rows and column schema returned by an engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Total rows the query produced, when the engine reports it.
    pub total_rows: Option<u64>,
}

/// Engine-level failures.
#[derive(Debug, Clone, Error)]
pub enum EngineFailure {
    /// The engine ran the query and rejected it.
    #[error("query failed: {message}")]
    Query {
        /// SQLSTATE or provider error reason.
        code: Option<String>,
        message: String,
    },

    /// The engine reported its own deadline.
    #[error("query timed out: {0}")]
    Timeout(String),

    /// The engine could not be reached.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

impl EngineFailure {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A data warehouse or database that runs read-only SQL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueryEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, request: &QueryRequest) -> Result<RowSet, EngineFailure>;
}

/// Payload caps and outage tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Rows requested from the engine.
    pub max_rows: usize,
    /// Serialized bytes kept in the sample.
    pub max_bytes: usize,
    /// Rows kept in the sample.
    pub sample_rows: usize,
    /// Extra attempts when the engine is unreachable.
    pub unavailable_retries: u32,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_rows: 1_000,
            max_bytes: 256 * 1024,
            sample_rows: 20,
            unavailable_retries: 2,
        }
    }
}

/// The engine stayed unreachable through every retry.
#[derive(Debug, Clone, Error)]
#[error("sandbox unavailable ({engine}): {reason}")]
pub struct SandboxUnavailable {
    pub engine: String,
    pub reason: String,
}

/// Runs candidates against a query engine under read-only and size limits.
pub struct Sandbox {
    engine: Arc<dyn QueryEngine>,
    limits: SandboxLimits,
    execution_timeout: Duration,
    retry: RetryPolicy,
}

impl Sandbox {
    pub fn new(engine: Arc<dyn QueryEngine>, limits: SandboxLimits, execution_timeout: Duration) -> Self {
        let retry = RetryPolicy {
            max_attempts: limits.unavailable_retries + 1,
            ..RetryPolicy::default()
        };
        Self {
            engine,
            limits,
            execution_timeout,
            retry,
        }
    }

    /// Override the backoff used between outage retries.
    pub fn with_backoff(mut self, policy: &RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_attempts: self.limits.unavailable_retries + 1,
            ..policy.clone()
        };
        self
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Execute a candidate. Non-SQL candidates are reported as engine errors.
    pub async fn execute(&self, candidate: &Candidate, schema: &Schema) -> Result<ExecutionResult, SandboxUnavailable> {
        match candidate.sql() {
            Some(sql) => self.execute_sql(sql, schema).await,
            None => Ok(ExecutionResult::failure(
                FailureKind::EngineError,
                "candidate carries no SQL statement",
            )),
        }
    }

    /// Validate and run one statement.
    pub async fn execute_sql(&self, sql: &str, schema: &Schema) -> Result<ExecutionResult, SandboxUnavailable> {
        match check_read_only(sql) {
            Err(lex) => {
                return Ok(ExecutionResult::failure(FailureKind::SyntaxError, &lex.to_string()));
            }
            Ok(SafetyCheck::Unsafe(reason)) => {
                warn!(reason = %reason, "Rejected unsafe statement before execution");
                return Ok(ExecutionResult::failure(FailureKind::UnsafeStatement, &reason.to_string()));
            }
            Ok(SafetyCheck::ReadOnly) => {}
        }

        if !schema.is_empty() {
            let unknown = unknown_tables(sql, schema);
            if !unknown.is_empty() {
                return Ok(ExecutionResult::failure(
                    FailureKind::SchemaMismatch,
                    &format!("unknown table(s): {}", unknown.join(", ")),
                ));
            }
        }

        let request = QueryRequest {
            sql: sql.trim().trim_end_matches(';').to_string(),
            max_rows: self.limits.max_rows,
            timeout: self.execution_timeout,
        };
        let start = Instant::now();
        let engine = self.engine.clone();
        let deadline = self.execution_timeout;

        let outcome = retry_with_backoff(&self.retry, engine.name(), EngineFailure::is_unavailable, || {
            let engine = engine.clone();
            let request = request.clone();
            async move {
                match tokio::time::timeout(deadline, engine.execute(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineFailure::Timeout(format!(
                        "no result within {} ms",
                        deadline.as_millis()
                    ))),
                }
            }
        })
        .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(rows) => {
                let summary = self.summarize(rows, elapsed_ms);
                info!(
                    engine = self.engine.name(),
                    rows = summary.row_count,
                    truncated = summary.truncated,
                    elapsed_ms,
                    "Query executed"
                );
                Ok(ExecutionResult::Success(summary))
            }
            Err(EngineFailure::Unavailable(reason)) => Err(SandboxUnavailable {
                engine: self.engine.name().to_string(),
                reason,
            }),
            Err(failure) => {
                let classified = classify::classify(&failure);
                debug!(kind = %classified.kind, elapsed_ms, "Query failed");
                Ok(ExecutionResult::Failure(classified))
            }
        }
    }

    /// Bound a row set to the sample-row and byte caps.
    fn summarize(&self, rows: RowSet, elapsed_ms: u64) -> ResultSummary {
        let returned = rows.rows.len();
        let row_count = rows.total_rows.unwrap_or(returned as u64);
        let mut sample_rows = Vec::new();
        let mut payload_bytes = 0usize;

        for row in rows.rows.into_iter().take(self.limits.sample_rows.min(self.limits.max_rows)) {
            let size = serde_json::to_vec(&row).map(|b| b.len()).unwrap_or(0);
            if payload_bytes + size > self.limits.max_bytes {
                break;
            }
            payload_bytes += size;
            sample_rows.push(row);
        }

        ResultSummary {
            row_count,
            truncated: (sample_rows.len() as u64) < row_count,
            columns: rows.columns,
            sample_rows,
            payload_bytes,
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::candidate::{AgentId, CandidateBody};
    use crate::model::question::ColumnDef;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new().with_table("T", vec![ColumnDef::new("id", "INT64", false)])
    }

    fn limits() -> SandboxLimits {
        SandboxLimits {
            max_rows: 100,
            max_bytes: 1024,
            sample_rows: 5,
            unavailable_retries: 1,
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            multiplier: 1.0,
        }
    }

    fn sandbox(engine: MockQueryEngine) -> Sandbox {
        Sandbox::new(Arc::new(engine), limits(), Duration::from_secs(5)).with_backoff(&fast())
    }

    fn rows(n: usize) -> RowSet {
        RowSet {
            columns: vec![ResultColumn::new("id", "INT64")],
            rows: (0..n).map(|i| vec![json!(i)]).collect(),
            total_rows: None,
        }
    }

    #[tokio::test]
    async fn test_unsafe_statement_never_reaches_engine() {
        let mut engine = MockQueryEngine::new();
        engine.expect_name().return_const("mock");
        engine.expect_execute().never();
        let result = sandbox(engine).execute_sql("DELETE FROM T", &schema()).await.unwrap();
        assert_eq!(result.failure_kind(), Some(FailureKind::UnsafeStatement));
    }

    #[tokio::test]
    async fn test_unknown_table_never_reaches_engine() {
        let mut engine = MockQueryEngine::new();
        engine.expect_name().return_const("mock");
        engine.expect_execute().never();
        let result = sandbox(engine).execute_sql("SELECT * FROM orders", &schema()).await.unwrap();
        assert_eq!(result.failure_kind(), Some(FailureKind::SchemaMismatch));
    }

    #[tokio::test]
    async fn test_distinct_from_reaches_engine() {
        let schema = Schema::new().with_table(
            "t",
            vec![
                ColumnDef::new("id", "INT64", false),
                ColumnDef::new("a", "INT64", true),
                ColumnDef::new("b", "INT64", true),
            ],
        );
        let mut engine = MockQueryEngine::new();
        engine.expect_name().return_const("mock");
        engine.expect_execute().times(1).returning(|_| Ok(rows(2)));
        let result = sandbox(engine)
            .execute_sql("SELECT id FROM t WHERE a IS DISTINCT FROM b", &schema)
            .await
            .unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_lex_error_is_syntax() {
        let mut engine = MockQueryEngine::new();
        engine.expect_name().return_const("mock");
        engine.expect_execute().never();
        let result = sandbox(engine).execute_sql("SELECT 'x FROM T", &schema()).await.unwrap();
        assert_eq!(result.failure_kind(), Some(FailureKind::SyntaxError));
    }

    #[tokio::test]
    async fn test_success_is_bounded() {
        let mut engine = MockQueryEngine::new();
        engine.expect_name().return_const("mock");
        engine.expect_execute().times(1).returning(|req| {
            assert_eq!(req.sql, "SELECT id FROM T");
            assert_eq!(req.max_rows, 100);
            Ok(rows(50))
        });
        let result = sandbox(engine).execute_sql("SELECT id FROM T;", &schema()).await.unwrap();
        let summary = result.as_summary().unwrap();
        assert_eq!(summary.row_count, 50);
        assert_eq!(summary.sample_rows.len(), 5);
        assert!(summary.truncated);
    }

    #[tokio::test]
    async fn test_engine_total_beyond_cap_is_reported() {
        let mut engine = MockQueryEngine::new();
        engine.expect_name().return_const("mock");
        engine.expect_execute().returning(|_| {
            Ok(RowSet {
                total_rows: Some(5_000),
                ..rows(100)
            })
        });
        let result = sandbox(engine).execute_sql("SELECT id FROM T", &schema()).await.unwrap();
        let summary = result.as_summary().unwrap();
        assert_eq!(summary.row_count, 5_000);
        assert!(summary.truncated);
    }

    #[tokio::test]
    async fn test_byte_cap_truncates() {
        let mut engine = MockQueryEngine::new();
        engine.expect_name().return_const("mock");
        engine.expect_execute().returning(|_| {
            Ok(RowSet {
                columns: vec![ResultColumn::new("blob", "STRING")],
                rows: (0..3).map(|_| vec![json!("x".repeat(600))]).collect(),
                total_rows: Some(3),
            })
        });
        let result = sandbox(engine).execute_sql("SELECT blob FROM T", &schema()).await.unwrap();
        let summary = result.as_summary().unwrap();
        assert_eq!(summary.sample_rows.len(), 1);
        assert!(summary.payload_bytes <= 1024);
        assert!(summary.truncated);
    }

    #[tokio::test]
    async fn test_engine_error_is_classified() {
        let mut engine = MockQueryEngine::new();
        engine.expect_name().return_const("mock");
        engine.expect_execute().returning(|_| {
            Err(EngineFailure::Query {
                code: Some("42703".into()),
                message: "column \"nope\" does not exist".into(),
            })
        });
        let result = sandbox(engine).execute_sql("SELECT nope FROM T", &schema()).await.unwrap();
        assert_eq!(result.failure_kind(), Some(FailureKind::SchemaMismatch));
    }

    #[tokio::test]
    async fn test_outage_retries_then_unavailable() {
        let mut engine = MockQueryEngine::new();
        engine.expect_name().return_const("mock");
        engine
            .expect_execute()
            .times(2)
            .returning(|_| Err(EngineFailure::Unavailable("connection refused".into())));
        let err = sandbox(engine).execute_sql("SELECT id FROM T", &schema()).await.unwrap_err();
        assert_eq!(err.engine, "mock");
        assert!(err.reason.contains("refused"));
    }

    #[tokio::test]
    async fn test_non_sql_candidate() {
        let mut engine = MockQueryEngine::new();
        engine.expect_name().return_const("mock");
        engine.expect_execute().never();
        let c = Candidate::seed(&AgentId::new("a"), 0, CandidateBody::answer("42"), "");
        let result = sandbox(engine).execute(&c, &schema()).await.unwrap();
        assert_eq!(result.failure_kind(), Some(FailureKind::EngineError));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_engine_times_out() {
        struct Slow;
        #[async_trait]
        impl QueryEngine for Slow {
            fn name(&self) -> &'static str {
                "slow"
            }
            async fn execute(&self, _request: &QueryRequest) -> Result<RowSet, EngineFailure> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(RowSet::default())
            }
        }
        let sandbox = Sandbox::new(Arc::new(Slow), limits(), Duration::from_millis(100));
        let result = sandbox.execute_sql("SELECT id FROM T", &schema()).await.unwrap();
        assert_eq!(result.failure_kind(), Some(FailureKind::ExecutionTimeout));
    }
}
