//! Minimal SQL tokenizer.
//!
//! Understands just enough lexical structure (literals, quoted identifiers,
//! comments) that keyword checks and normalization never look inside a
//! string literal or a comment.

/// A lexical token. Comments and whitespace are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Bare word: keyword or unquoted identifier, original case.
    Word(String),
    /// Backtick- or double-quoted identifier, without the quotes.
    Quoted(String),
    /// String literal including its quotes, verbatim.
    Str(String),
    Number(String),
    /// Operator or punctuation.
    Symbol(String),
}

impl Token {
    /// Whether this is the bare keyword `kw` (case-insensitive).
    pub fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(kw))
    }

    pub fn is_symbol(&self, sym: &str) -> bool {
        matches!(self, Token::Symbol(s) if s == sym)
    }

    /// Identifier text for words and quoted identifiers.
    pub fn ident(&self) -> Option<&str> {
        match self {
            Token::Word(w) | Token::Quoted(w) => Some(w),
            _ => None,
        }
    }
}

/// Tokenizer failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LexError {
    #[error("unterminated string literal starting at byte {0}")]
    UnterminatedString(usize),
    #[error("unterminated quoted identifier starting at byte {0}")]
    UnterminatedIdentifier(usize),
    #[error("unterminated block comment starting at byte {0}")]
    UnterminatedComment(usize),
}

const TWO_CHAR_SYMBOLS: &[&str] = &["<=", ">=", "<>", "!=", "||", "::", "=>"];

/// Split `sql` into tokens.
pub fn tokenize(sql: &str) -> Result<Vec<Token>, LexError> {
    let chars: Vec<(usize, char)> = sql.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
        } else if (c == '-' && next == Some('-')) || c == '#' {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
        } else if c == '/' && next == Some('*') {
            i += 2;
            loop {
                if i + 1 >= chars.len() {
                    return Err(LexError::UnterminatedComment(pos));
                }
                if chars[i].1 == '*' && chars[i + 1].1 == '/' {
                    i += 2;
                    break;
                }
                i += 1;
            }
        } else if c == '\'' {
            let start = i;
            i += 1;
            loop {
                match chars.get(i).map(|(_, c)| *c) {
                    None => return Err(LexError::UnterminatedString(pos)),
                    Some('\\') => i += 2,
                    Some('\'') if chars.get(i + 1).map(|(_, c)| *c) == Some('\'') => i += 2,
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(_) => i += 1,
                }
            }
            let text: String = chars[start..i.min(chars.len())].iter().map(|(_, c)| c).collect();
            tokens.push(Token::Str(text));
        } else if c == '`' || c == '"' {
            let quote = c;
            i += 1;
            let start = i;
            while i < chars.len() && chars[i].1 != quote {
                i += 1;
            }
            if i >= chars.len() {
                return Err(LexError::UnterminatedIdentifier(pos));
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            tokens.push(Token::Quoted(text));
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '.') {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().map(|(_, c)| c).collect()));
        } else if c.is_alphabetic() || c == '_' || c == '@' || c == '$' {
            let start = i;
            i += 1;
            while i < chars.len()
                && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '$')
            {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().map(|(_, c)| c).collect()));
        } else {
            let pair: String = [Some(c), next].iter().flatten().collect();
            if TWO_CHAR_SYMBOLS.contains(&pair.as_str()) {
                tokens.push(Token::Symbol(pair));
                i += 2;
            } else {
                tokens.push(Token::Symbol(c.to_string()));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_select() {
        let toks = tokenize("SELECT a, b FROM t WHERE a >= 10").unwrap();
        assert_eq!(toks[0], Token::Word("SELECT".into()));
        assert!(toks.iter().any(|t| t.is_symbol(">=")));
        assert!(toks.iter().any(|t| matches!(t, Token::Number(n) if n == "10")));
    }

    #[test]
    fn test_comments_are_dropped() {
        let toks = tokenize("SELECT 1 -- DROP TABLE t\n/* DELETE */ FROM t # trailing").unwrap();
        assert!(!toks.iter().any(|t| t.is_keyword("drop")));
        assert!(!toks.iter().any(|t| t.is_keyword("delete")));
        assert_eq!(toks.len(), 4);
    }

    #[test]
    fn test_string_literal_hides_keywords() {
        let toks = tokenize("SELECT 'it''s a DELETE' AS s").unwrap();
        assert_eq!(toks[1], Token::Str("'it''s a DELETE'".into()));
        assert!(!toks.iter().any(|t| t.is_keyword("delete")));
    }

    #[test]
    fn test_quoted_identifiers() {
        let toks = tokenize("SELECT * FROM `proj.ds.table` JOIN \"Order\" o ON 1=1").unwrap();
        assert!(toks.contains(&Token::Quoted("proj.ds.table".into())));
        assert!(toks.contains(&Token::Quoted("Order".into())));
    }

    #[test]
    fn test_unterminated_inputs() {
        assert!(matches!(tokenize("SELECT 'abc"), Err(LexError::UnterminatedString(7))));
        assert!(matches!(tokenize("SELECT `abc"), Err(LexError::UnterminatedIdentifier(7))));
        assert!(matches!(tokenize("SELECT /* abc"), Err(LexError::UnterminatedComment(7))));
    }
}
