//! Canonical SQL text for semantic-equivalence grouping.

use crate::sql::lexer::{tokenize, Token};

/// Normalize a statement so formatting differences compare equal.
///
/// Comments are dropped, bare words are lower-cased, whitespace collapses
/// to single spaces, spacing around punctuation is canonical, and trailing
/// semicolons are removed. String literals and quoted identifiers keep
/// their exact text. Input that does not tokenize falls back to plain
/// whitespace collapsing.
pub fn normalize(sql: &str) -> String {
    let mut tokens = match tokenize(sql) {
        Ok(t) => t,
        Err(_) => {
            let words: Vec<&str> = sql.split_whitespace().collect();
            return words.join(" ").trim_end_matches(';').trim_end().to_lowercase();
        }
    };
    while tokens.last().is_some_and(|t| t.is_symbol(";")) {
        tokens.pop();
    }

    let mut out = String::with_capacity(sql.len());
    let mut glue_next = true;
    for tok in &tokens {
        let text = match tok {
            Token::Word(w) => w.to_lowercase(),
            Token::Quoted(q) => format!("`{}`", q),
            Token::Str(s) | Token::Number(s) | Token::Symbol(s) => s.clone(),
        };
        let glue_before = matches!(tok, Token::Symbol(s) if s == "," || s == ")" || s == "." || s == "(");
        if !out.is_empty() && !glue_next && !glue_before {
            out.push(' ');
        }
        out.push_str(&text);
        glue_next = matches!(tok, Token::Symbol(s) if s == "(" || s == ".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_and_case() {
        assert_eq!(
            normalize("SELECT   COUNT(*)\n  FROM  T ;"),
            normalize("select count( * ) from t")
        );
        assert_eq!(normalize("select count( * ) from t"), "select count(*) from t");
    }

    #[test]
    fn test_comments_ignored() {
        assert_eq!(
            normalize("SELECT a -- pick a\nFROM t /* main */"),
            "select a from t"
        );
    }

    #[test]
    fn test_literals_preserved() {
        let n = normalize("SELECT * FROM t WHERE name = 'Alice'");
        assert!(n.ends_with("name = 'Alice'"));
        assert_ne!(n, normalize("SELECT * FROM t WHERE name = 'alice'"));
    }

    #[test]
    fn test_qualified_names() {
        assert_eq!(normalize("SELECT t . a , t.b FROM t"), "select t.a, t.b from t");
    }

    #[test]
    fn test_unterminated_falls_back() {
        assert_eq!(normalize("SELECT 'oops  FROM T;"), "select 'oops from t");
    }
}
