//! Execution results — what the sandbox reports for one candidate.

use serde::{Deserialize, Serialize};

/// Classified failure kind. Every sandbox failure maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The statement does not parse.
    SyntaxError,
    /// Unknown table/column or type mismatch against the schema.
    SchemaMismatch,
    /// Execution exceeded its deadline.
    ExecutionTimeout,
    /// Any other engine or runtime error.
    EngineError,
    /// Write or multi-statement SQL, rejected before execution.
    UnsafeStatement,
}

impl FailureKind {
    /// Whether the self-correction loop may attempt a repair.
    pub fn is_repairable(self) -> bool {
        !matches!(self, Self::UnsafeStatement)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SyntaxError => write!(f, "syntax_error"),
            Self::SchemaMismatch => write!(f, "schema_mismatch"),
            Self::ExecutionTimeout => write!(f, "execution_timeout"),
            Self::EngineError => write!(f, "engine_error"),
            Self::UnsafeStatement => write!(f, "unsafe_statement"),
        }
    }
}

/// A classified execution failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Engine-specific error code (SQLSTATE, BigQuery reason), if any.
    pub code: Option<String>,
}

impl ExecutionFailure {
    pub fn new(kind: FailureKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_string(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]: {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// One column of a result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    pub data_type: String,
}

impl ResultColumn {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
        }
    }
}

/// Bounded summary of a successful query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    /// Total rows the engine reported (may exceed `sample_rows.len()`).
    pub row_count: u64,
    pub columns: Vec<ResultColumn>,
    pub sample_rows: Vec<Vec<serde_json::Value>>,
    /// True when rows were dropped to honor the row or byte cap.
    pub truncated: bool,
    /// Serialized size of `sample_rows` in bytes.
    pub payload_bytes: usize,
    pub elapsed_ms: u64,
}

impl ResultSummary {
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Outcome of running a candidate. Attached to exactly one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success(ResultSummary),
    Failure(ExecutionFailure),
}

impl ExecutionResult {
    pub fn failure(kind: FailureKind, message: &str) -> Self {
        Self::Failure(ExecutionFailure::new(kind, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn as_failure(&self) -> Option<&ExecutionFailure> {
        match self {
            Self::Failure(f) => Some(f),
            Self::Success(_) => None,
        }
    }

    pub fn as_summary(&self) -> Option<&ResultSummary> {
        match self {
            Self::Success(s) => Some(s),
            Self::Failure(_) => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.as_failure().map(|f| f.kind)
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success(s) => write!(
                f,
                "ok: {} rows, {} columns{}",
                s.row_count,
                s.columns.len(),
                if s.truncated { " (truncated)" } else { "" }
            ),
            Self::Failure(e) => write!(f, "failed: {}", e),
        }
    }
}
