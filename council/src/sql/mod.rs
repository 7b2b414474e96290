//! SQL text handling: tokenizing, normalization, read-only checks,
//! table references, and candidate generation.

pub mod generator;
pub mod identifiers;
pub mod lexer;
pub mod normalize;
pub mod safety;

pub use generator::{CandidateGenerator, GeneratorProposer, LlmSqlGenerator};
pub use identifiers::referenced_tables_in;
pub use normalize::normalize;
pub use safety::{check_read_only, SafetyCheck, UnsafeReason};

use crate::model::question::Schema;

/// Referenced tables that the schema does not define.
///
/// Statements that fail to tokenize report nothing here; the sandbox
/// classifies them as syntax errors.
pub fn unknown_tables(sql: &str, schema: &Schema) -> Vec<String> {
    match referenced_tables_in(sql) {
        Ok(tables) => tables.into_iter().filter(|t| !schema.has_table(t)).collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::question::ColumnDef;

    #[test]
    fn test_unknown_tables() {
        let schema = Schema::new().with_table("T", vec![ColumnDef::new("id", "INT64", false)]);
        assert!(unknown_tables("SELECT * FROM t", &schema).is_empty());
        assert_eq!(unknown_tables("SELECT * FROM T JOIN u ON 1=1", &schema), vec!["u"]);
        assert!(unknown_tables("SELECT 'x", &schema).is_empty());
    }
}
