//! PostgreSQL engine over `tokio-postgres`.
//!
//! Each statement runs on its own connection inside a `READ ONLY`
//! transaction with a `statement_timeout`, and is always rolled back.
//! Rows come back through `row_to_json` so every column type maps to JSON
//! without per-type decoding. One row past the cap is fetched; when it
//! arrives the exact total comes from a `COUNT(*)` over the same statement.

use async_trait::async_trait;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

use crate::model::execution::ResultColumn;
use crate::sandbox::{EngineFailure, QueryEngine, QueryRequest, RowSet};

/// Runs queries against a PostgreSQL database.
pub struct PostgresEngine {
    connection_string: String,
}

impl PostgresEngine {
    /// `connection_string` uses libpq key/value or URL form.
    pub fn new(connection_string: &str) -> Self {
        Self {
            connection_string: connection_string.to_string(),
        }
    }
}

/// Map a driver error: database errors carry their SQLSTATE, everything
/// else means the server could not be used.
fn map_error(err: tokio_postgres::Error) -> EngineFailure {
    match err.as_db_error() {
        Some(db) => EngineFailure::Query {
            code: Some(db.code().code().to_string()),
            message: db.message().to_string(),
        },
        None => EngineFailure::Unavailable(err.to_string()),
    }
}

/// Wrap a statement so each row arrives as one JSON object.
fn wrap_statement(sql: &str, limit: usize) -> String {
    format!("SELECT row_to_json(q)::text FROM ({}) AS q LIMIT {}", sql, limit)
}

fn count_statement(sql: &str) -> String {
    format!("SELECT COUNT(*) FROM ({}) AS q", sql)
}

/// Whether the engine returned more rows than the caller asked for.
fn overflowed(returned: usize, max_rows: usize) -> bool {
    returned > max_rows
}

/// Order a decoded JSON row by the prepared statement's columns.
fn row_values(object: &serde_json::Value, columns: &[ResultColumn]) -> Vec<serde_json::Value> {
    columns
        .iter()
        .map(|c| object.get(&c.name).cloned().unwrap_or(serde_json::Value::Null))
        .collect()
}

#[async_trait]
impl QueryEngine for PostgresEngine {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn execute(&self, request: &QueryRequest) -> Result<RowSet, EngineFailure> {
        let (client, connection) = tokio_postgres::connect(&self.connection_string, NoTls)
            .await
            .map_err(|e| EngineFailure::Unavailable(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "Postgres connection closed with error");
            }
        });

        client
            .batch_execute(&format!(
                "BEGIN READ ONLY; SET LOCAL statement_timeout = {}",
                request.timeout.as_millis()
            ))
            .await
            .map_err(map_error)?;

        let result = async {
            let statement = client.prepare(&request.sql).await?;
            let columns: Vec<ResultColumn> = statement
                .columns()
                .iter()
                .map(|c| ResultColumn::new(c.name(), c.type_().name()))
                .collect();
            let mut rows = client
                .query(wrap_statement(&request.sql, request.max_rows + 1).as_str(), &[])
                .await?;
            let total = if overflowed(rows.len(), request.max_rows) {
                rows.truncate(request.max_rows);
                let count: i64 = client
                    .query_one(count_statement(&request.sql).as_str(), &[])
                    .await?
                    .try_get(0)?;
                Some(count.max(0) as u64)
            } else {
                None
            };
            Ok::<_, tokio_postgres::Error>((columns, rows, total))
        }
        .await;

        if let Err(e) = client.batch_execute("ROLLBACK").await {
            debug!(error = %e, "Rollback after read-only query failed");
        }

        let (columns, rows, total_rows) = result.map_err(map_error)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row.try_get(0).map_err(map_error)?;
            let object: serde_json::Value = serde_json::from_str(&text).map_err(|e| EngineFailure::Query {
                code: None,
                message: format!("undecodable row: {}", e),
            })?;
            out.push(row_values(&object, &columns));
        }

        Ok(RowSet {
            columns,
            rows: out,
            total_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wrap_statement() {
        assert_eq!(
            wrap_statement("SELECT id FROM t", 10),
            "SELECT row_to_json(q)::text FROM (SELECT id FROM t) AS q LIMIT 10"
        );
    }

    #[test]
    fn test_overflow_needs_a_count() {
        assert!(!overflowed(10, 10));
        assert!(overflowed(11, 10));
        assert_eq!(count_statement("SELECT id FROM t"), "SELECT COUNT(*) FROM (SELECT id FROM t) AS q");
    }

    #[test]
    fn test_row_values_follow_column_order() {
        let cols = vec![ResultColumn::new("b", "int4"), ResultColumn::new("a", "text"), ResultColumn::new("c", "text")];
        let row = row_values(&json!({"a": "x", "b": 2}), &cols);
        assert_eq!(row, vec![json!(2), json!("x"), serde_json::Value::Null]);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let engine = PostgresEngine::new("host=127.0.0.1 port=1 user=nobody connect_timeout=1");
        let request = QueryRequest {
            sql: "SELECT 1".into(),
            max_rows: 1,
            timeout: std::time::Duration::from_secs(1),
        };
        let err = engine.execute(&request).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
