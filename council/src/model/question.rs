//! Question and schema — the immutable inputs shared by every component.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A natural-language question submitted to the council.
///
/// Created once per request and read-only afterwards; agents receive it
/// behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Unique question identifier.
    pub id: Uuid,
    /// The question text as asked.
    pub text: String,
    /// Optional reference to the schema the question targets (dataset name).
    pub schema_ref: Option<String>,
    /// Optional caller session the question belongs to.
    pub session_id: Option<String>,
    /// When the question was received.
    pub received_at: DateTime<Utc>,
}

impl Question {
    /// Create a new question with a fresh id.
    pub fn new(text: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.to_string(),
            schema_ref: None,
            session_id: None,
            received_at: Utc::now(),
        }
    }

    /// Attach a schema reference.
    pub fn with_schema_ref(mut self, schema_ref: &str) -> Self {
        self.schema_ref = Some(schema_ref.to_string());
        self
    }

    /// Attach a session id.
    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Key used for transcript storage: the session id when present,
    /// otherwise the question id.
    pub fn storage_key(&self) -> String {
        self.session_id
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Engine type name (`INT64`, `STRING`, `TIMESTAMP`, ...).
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: &str, data_type: &str, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable,
        }
    }
}

/// Column list for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Look up a column by name (case-insensitive).
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Mapping from table name to column definitions.
///
/// Supplied once per session and shared read-only across concurrent
/// agent and sandbox calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: BTreeMap<String, TableSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a table with its columns.
    pub fn with_table(mut self, name: &str, columns: Vec<ColumnDef>) -> Self {
        self.tables
            .insert(name.to_string(), TableSchema { columns });
        self
    }

    /// Resolve a (possibly qualified) table reference.
    ///
    /// `project.dataset.table` matches either the full name or its last
    /// segment. Matching is case-insensitive.
    pub fn resolve_table(&self, reference: &str) -> Option<(&str, &TableSchema)> {
        let reference = reference.trim_matches('`');
        let last = reference.rsplit('.').next().unwrap_or(reference);
        self.tables
            .iter()
            .find(|(name, _)| {
                name.eq_ignore_ascii_case(reference) || name.eq_ignore_ascii_case(last)
            })
            .map(|(name, table)| (name.as_str(), table))
    }

    /// Whether the schema has a table matching `reference`.
    pub fn has_table(&self, reference: &str) -> bool {
        self.resolve_table(reference).is_some()
    }

    /// Whether any table has a column with this name.
    pub fn has_column(&self, name: &str) -> bool {
        self.tables.values().any(|t| t.column(name).is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Render as `CREATE TABLE` statements for prompts.
    pub fn to_ddl(&self) -> String {
        let mut out = String::new();
        for (name, table) in &self.tables {
            out.push_str(&format!("CREATE TABLE {} (\n", name));
            let cols: Vec<String> = table
                .columns
                .iter()
                .map(|c| {
                    if c.nullable {
                        format!("  {} {}", c.name, c.data_type)
                    } else {
                        format!("  {} {} NOT NULL", c.name, c.data_type)
                    }
                })
                .collect();
            out.push_str(&cols.join(",\n"));
            out.push_str("\n);\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::new()
            .with_table(
                "subscriptions",
                vec![
                    ColumnDef::new("customer_id", "STRING", false),
                    ColumnDef::new("cancelled_at", "TIMESTAMP", true),
                ],
            )
            .with_table("T", vec![ColumnDef::new("id", "INT64", false)])
    }

    #[test]
    fn test_resolve_qualified_table() {
        let schema = sample_schema();
        let (name, _) = schema
            .resolve_table("`proj.dataset.subscriptions`")
            .unwrap();
        assert_eq!(name, "subscriptions");
        assert!(schema.has_table("t"));
        assert!(!schema.has_table("orders"));
    }

    #[test]
    fn test_has_column_case_insensitive() {
        let schema = sample_schema();
        assert!(schema.has_column("CUSTOMER_ID"));
        assert!(!schema.has_column("email"));
    }

    #[test]
    fn test_ddl_rendering() {
        let ddl = sample_schema().to_ddl();
        assert!(ddl.contains("CREATE TABLE subscriptions ("));
        assert!(ddl.contains("customer_id STRING NOT NULL"));
        assert!(ddl.contains("cancelled_at TIMESTAMP\n"));
    }

    #[test]
    fn test_storage_key_prefers_session() {
        let q = Question::new("count rows");
        assert_eq!(q.storage_key(), q.id.to_string());
        let q = q.with_session("sess-7");
        assert_eq!(q.storage_key(), "sess-7");
    }

    #[test]
    fn test_schema_deserialize_defaults_nullable() {
        let json = r#"{"tables":{"T":{"columns":[{"name":"id","data_type":"INT64"}]}}}"#;
        let schema: Schema = serde_json::from_str(json).unwrap();
        assert!(schema.tables["T"].columns[0].nullable);
    }
}
