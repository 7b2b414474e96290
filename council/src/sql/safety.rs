//! Read-only statement guard.
//!
//! Runs before any engine call. A statement passes only if it is a single
//! `SELECT` (optionally behind `WITH` or parentheses) and contains no
//! write, DDL, transaction-control or session keyword outside string
//! literals and comments.

use crate::sql::lexer::{tokenize, LexError, Token};

/// Keywords that make a statement unsafe wherever they appear as bare words.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "CREATE", "DROP", "ALTER", "TRUNCATE",
    "RENAME", "GRANT", "REVOKE", "CALL", "EXEC", "EXECUTE", "EXPORT", "LOAD", "COPY", "INTO",
    "DECLARE", "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "LOCK", "VACUUM", "ANALYZE",
    "REINDEX", "CLUSTER", "ATTACH", "DETACH", "PRAGMA", "SET", "RESET", "UNLOAD", "REFRESH",
];

/// Statement starters accepted as read-only.
const READ_ONLY_STARTERS: &[&str] = &["SELECT", "WITH"];

/// Why a statement was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsafeReason {
    /// Nothing to execute.
    Empty,
    /// More than one statement separated by `;`.
    MultipleStatements,
    /// The statement does not begin with a read-only keyword.
    NotAQuery { starts_with: String },
    /// A forbidden keyword appears in the statement.
    ForbiddenKeyword { keyword: String },
}

impl std::fmt::Display for UnsafeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty statement"),
            Self::MultipleStatements => write!(f, "multiple statements are not allowed"),
            Self::NotAQuery { starts_with } => {
                write!(f, "statement starts with '{}', only SELECT/WITH queries are allowed", starts_with)
            }
            Self::ForbiddenKeyword { keyword } => {
                write!(f, "forbidden keyword '{}' in read-only query", keyword)
            }
        }
    }
}

impl std::error::Error for UnsafeReason {}

/// Outcome of the guard for statements that tokenize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyCheck {
    ReadOnly,
    Unsafe(UnsafeReason),
}

impl SafetyCheck {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

/// Classify a statement. Lexical errors are returned as `Err` so callers
/// can report them as syntax errors.
pub fn check_read_only(sql: &str) -> Result<SafetyCheck, LexError> {
    let tokens = tokenize(sql)?;
    Ok(check_tokens(&tokens))
}

/// Classify an already tokenized statement.
pub fn check_tokens(tokens: &[Token]) -> SafetyCheck {
    let mut body: &[Token] = tokens;
    while let Some((last, rest)) = body.split_last() {
        if last.is_symbol(";") {
            body = rest;
        } else {
            break;
        }
    }

    if body.is_empty() {
        return SafetyCheck::Unsafe(UnsafeReason::Empty);
    }
    if body.iter().any(|t| t.is_symbol(";")) {
        return SafetyCheck::Unsafe(UnsafeReason::MultipleStatements);
    }

    if let Some(word) = body.iter().find_map(|t| match t {
        Token::Word(w) if FORBIDDEN_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(w)) => Some(w),
        _ => None,
    }) {
        return SafetyCheck::Unsafe(UnsafeReason::ForbiddenKeyword {
            keyword: word.to_uppercase(),
        });
    }

    let first = body.iter().find(|t| !t.is_symbol("("));
    match first {
        Some(Token::Word(w)) if READ_ONLY_STARTERS.iter().any(|k| k.eq_ignore_ascii_case(w)) => {
            SafetyCheck::ReadOnly
        }
        Some(tok) => SafetyCheck::Unsafe(UnsafeReason::NotAQuery {
            starts_with: match tok {
                Token::Word(w) | Token::Quoted(w) | Token::Str(w) | Token::Number(w) | Token::Symbol(w) => {
                    w.to_uppercase()
                }
            },
        }),
        None => SafetyCheck::Unsafe(UnsafeReason::Empty),
    }
}
