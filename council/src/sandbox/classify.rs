//! Engine error classification.
//!
//! Every engine failure maps to exactly one [`FailureKind`]: engine codes
//! (SQLSTATE, BigQuery error reasons) first, message patterns second,
//! `EngineError` last.

use regex::Regex;
use std::sync::LazyLock;

use crate::model::execution::{ExecutionFailure, FailureKind};
use crate::sandbox::EngineFailure;

static SYNTAX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(syntax error|parse error|unexpected (token|keyword|end)|expected .* but got|mismatched input|unterminated)").unwrap()
});

static SCHEMA_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(unrecognized name|column .* does not exist|relation .* does not exist|no such (column|table)|unknown (column|table)|not found: (table|dataset|column)|name .* not found|no matching signature|cannot be compared|type mismatch|invalid input syntax for type)").unwrap()
});

static TIMEOUT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(timed? ?out|statement timeout|deadline exceeded|exceeded .* time limit|query_canceled)").unwrap()
});

static READ_ONLY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(read-only transaction|read only transaction|permission to (write|modify))").unwrap()
});

/// Classify by SQLSTATE code.
fn classify_sqlstate(code: &str) -> Option<FailureKind> {
    let kind = match code {
        "42601" | "42883" | "42P10" | "42803" => FailureKind::SyntaxError,
        "42P01" | "42703" | "42702" | "42804" | "42846" | "3F000" | "22P02" => FailureKind::SchemaMismatch,
        "57014" => FailureKind::ExecutionTimeout,
        "25006" => FailureKind::UnsafeStatement,
        _ if code.starts_with("42") && code != "42501" => FailureKind::SyntaxError,
        _ if code.len() == 5 && code.chars().all(|c| c.is_ascii_alphanumeric()) => FailureKind::EngineError,
        _ => return None,
    };
    Some(kind)
}

/// Classify by BigQuery error reason.
fn classify_bigquery_reason(reason: &str, message: &str) -> Option<FailureKind> {
    let kind = match reason {
        "invalidQuery" => {
            if SCHEMA_PATTERN.is_match(message) {
                FailureKind::SchemaMismatch
            } else {
                FailureKind::SyntaxError
            }
        }
        "notFound" => FailureKind::SchemaMismatch,
        "timeout" | "jobTimeout" => FailureKind::ExecutionTimeout,
        "backendError" | "internalError" | "responseTooLarge" | "resourcesExceeded"
        | "accessDenied" | "quotaExceeded" | "rateLimitExceeded" | "invalid" => FailureKind::EngineError,
        _ => return None,
    };
    Some(kind)
}

/// Map an engine failure to its execution failure.
pub fn classify(failure: &EngineFailure) -> ExecutionFailure {
    match failure {
        EngineFailure::Timeout(message) => ExecutionFailure::new(FailureKind::ExecutionTimeout, message),
        EngineFailure::Unavailable(message) => ExecutionFailure::new(FailureKind::EngineError, message),
        EngineFailure::Query { code, message } => {
            let by_code = code.as_deref().and_then(|c| {
                classify_sqlstate(c).or_else(|| classify_bigquery_reason(c, message))
            });
            let kind = by_code.unwrap_or_else(|| classify_message(message));
            let mut out = ExecutionFailure::new(kind, message);
            if let Some(c) = code {
                out = out.with_code(c);
            }
            out
        }
    }
}

/// Classify from message text alone.
pub fn classify_message(message: &str) -> FailureKind {
    if READ_ONLY_PATTERN.is_match(message) {
        FailureKind::UnsafeStatement
    } else if TIMEOUT_PATTERN.is_match(message) {
        FailureKind::ExecutionTimeout
    } else if SCHEMA_PATTERN.is_match(message) {
        FailureKind::SchemaMismatch
    } else if SYNTAX_PATTERN.is_match(message) {
        FailureKind::SyntaxError
    } else {
        FailureKind::EngineError
    }
}
