//! Table references in a query, for schema grounding checks.

use crate::sql::lexer::{tokenize, LexError, Token};

/// Words that end a `FROM`/`JOIN` table list.
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "JOIN", "LEFT", "RIGHT", "INNER", "OUTER",
    "FULL", "CROSS", "NATURAL", "ON", "USING", "UNION", "EXCEPT", "INTERSECT", "WINDOW",
    "QUALIFY", "TABLESAMPLE", "FOR", "OFFSET", "FETCH", "LATERAL", "PIVOT", "UNPIVOT",
];

/// Functions whose argument syntax contains a bare `FROM`.
const FROM_ARG_FUNCTIONS: &[&str] = &["EXTRACT", "SUBSTRING", "TRIM", "OVERLAY", "POSITION"];

/// `a IS [NOT] DISTINCT FROM b` compares values; the `FROM` at `i` is
/// not a table list.
fn is_distinct_from(tokens: &[Token], i: usize) -> bool {
    i >= 2
        && tokens[i - 1].is_keyword("DISTINCT")
        && (tokens[i - 2].is_keyword("IS") || tokens[i - 2].is_keyword("NOT"))
}

fn is_clause_keyword(tok: &Token) -> bool {
    matches!(tok, Token::Word(w) if CLAUSE_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(w)))
}

/// Names defined by `WITH name AS (` in this statement, lower-cased.
fn cte_names(tokens: &[Token]) -> Vec<String> {
    let mut names = Vec::new();
    for i in 1..tokens.len().saturating_sub(2) {
        let introduced = tokens[i - 1].is_keyword("WITH")
            || tokens[i - 1].is_keyword("RECURSIVE")
            || tokens[i - 1].is_symbol(",");
        if introduced && tokens[i + 1].is_keyword("AS") && tokens[i + 2].is_symbol("(") {
            if let Some(name) = tokens[i].ident() {
                names.push(name.to_lowercase());
            }
        }
    }
    names
}

/// Read a dotted identifier path starting at `j`; returns the path and the
/// index after it.
fn read_path(tokens: &[Token], mut j: usize) -> Option<(String, usize)> {
    let mut path = tokens.get(j)?.ident()?.to_string();
    j += 1;
    while tokens.get(j).is_some_and(|t| t.is_symbol(".")) {
        match tokens.get(j + 1).and_then(|t| t.ident()) {
            Some(part) => {
                path.push('.');
                path.push_str(part);
                j += 2;
            }
            None => break,
        }
    }
    Some((path, j))
}

/// Tables referenced after `FROM` / `JOIN`, excluding CTE names,
/// subqueries and table functions. Order of first appearance, deduplicated.
pub fn referenced_tables(tokens: &[Token]) -> Vec<String> {
    let ctes = cte_names(tokens);
    let mut tables: Vec<String> = Vec::new();
    // Whether each open parenthesis belongs to a FROM-taking function.
    let mut paren_stack: Vec<bool> = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        let tok = &tokens[i];
        if tok.is_symbol("(") {
            let special = i > 0
                && matches!(&tokens[i - 1], Token::Word(w)
                    if FROM_ARG_FUNCTIONS.iter().any(|f| f.eq_ignore_ascii_case(w)));
            paren_stack.push(special);
            i += 1;
            continue;
        }
        if tok.is_symbol(")") {
            paren_stack.pop();
            i += 1;
            continue;
        }
        let in_special = paren_stack.last().copied().unwrap_or(false);
        let list_start = (tok.is_keyword("FROM") && !in_special && !is_distinct_from(tokens, i))
            || tok.is_keyword("JOIN");
        if !list_start {
            i += 1;
            continue;
        }

        let mut j = i + 1;
        loop {
            let Some((path, after)) = read_path(tokens, j) else {
                break;
            };
            if is_clause_keyword(&tokens[j]) {
                break;
            }
            j = after;
            let is_function = tokens.get(j).is_some_and(|t| t.is_symbol("("));
            if !is_function && !ctes.contains(&path.to_lowercase()) && !tables.contains(&path) {
                tables.push(path);
            }
            if is_function {
                break;
            }
            // Optional alias.
            if tokens.get(j).is_some_and(|t| t.is_keyword("AS")) {
                j += 2;
            } else if tokens
                .get(j)
                .is_some_and(|t| t.ident().is_some() && !is_clause_keyword(t))
            {
                j += 1;
            }
            if tokens.get(j).is_some_and(|t| t.is_symbol(",")) && tok.is_keyword("FROM") {
                j += 1;
                continue;
            }
            break;
        }
        i = j.max(i + 1);
    }
    tables
}

/// Convenience wrapper over raw SQL text.
pub fn referenced_tables_in(sql: &str) -> Result<Vec<String>, LexError> {
    Ok(referenced_tables(&tokenize(sql)?))
}
