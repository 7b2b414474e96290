//! BigQuery engine over the `jobs.query` REST endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::model::execution::ResultColumn;
use crate::sandbox::{EngineFailure, QueryEngine, QueryRequest, RowSet};

const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Runs standard-SQL queries in a BigQuery project.
pub struct BigQueryEngine {
    project_id: String,
    dataset_id: Option<String>,
    access_token: String,
    endpoint: String,
    client: reqwest::Client,
}

impl BigQueryEngine {
    pub fn new(project_id: &str, access_token: &str) -> Result<Self, EngineFailure> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| EngineFailure::Unavailable(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            project_id: project_id.to_string(),
            dataset_id: None,
            access_token: access_token.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            client,
        })
    }

    /// Default dataset for unqualified table names.
    pub fn with_dataset(mut self, dataset_id: &str) -> Self {
        self.dataset_id = Some(dataset_id.to_string());
        self
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    fn request_body(&self, request: &QueryRequest) -> Value {
        let mut body = serde_json::json!({
            "query": request.sql,
            "useLegacySql": false,
            "maxResults": request.max_rows,
            "timeoutMs": request.timeout.as_millis() as u64,
        });
        if let Some(dataset) = &self.dataset_id {
            body["defaultDataset"] = serde_json::json!({
                "projectId": self.project_id,
                "datasetId": dataset,
            });
        }
        body
    }
}

/// Convert a BigQuery cell (`{"v": ...}`) according to its field type.
fn convert_cell(cell: &Value, field_type: &str) -> Value {
    let v = &cell["v"];
    let Some(s) = v.as_str() else {
        return v.clone();
    };
    match field_type {
        "INTEGER" | "INT64" => s.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::from(s)),
        "FLOAT" | "FLOAT64" => s
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or_else(|| Value::from(s)),
        "BOOLEAN" | "BOOL" => match s {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::from(s),
        },
        _ => Value::from(s),
    }
}

/// Decode a successful `jobs.query` response.
pub(crate) fn decode_response(json: &Value) -> Result<RowSet, EngineFailure> {
    if let Some(err) = json["errors"].as_array().and_then(|e| e.first()) {
        return Err(EngineFailure::Query {
            code: err["reason"].as_str().map(str::to_string),
            message: err["message"].as_str().unwrap_or("query failed").to_string(),
        });
    }
    if json["jobComplete"].as_bool() == Some(false) {
        return Err(EngineFailure::Timeout("job did not complete within timeoutMs".into()));
    }

    let fields = json["schema"]["fields"].as_array().cloned().unwrap_or_default();
    let columns: Vec<ResultColumn> = fields
        .iter()
        .map(|f| {
            ResultColumn::new(
                f["name"].as_str().unwrap_or_default(),
                f["type"].as_str().unwrap_or("STRING"),
            )
        })
        .collect();

    let rows = json["rows"]
        .as_array()
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    let cells = row["f"].as_array().cloned().unwrap_or_default();
                    cells
                        .iter()
                        .zip(columns.iter())
                        .map(|(cell, col)| convert_cell(cell, &col.data_type))
                        .collect()
                })
                .collect()
        })
        .unwrap_or_default();

    let total_rows = json["totalRows"].as_str().and_then(|s| s.parse::<u64>().ok());

    Ok(RowSet {
        columns,
        rows,
        total_rows,
    })
}

/// Decode an HTTP error body (`{"error": {"errors": [{"reason", "message"}]}}`).
pub(crate) fn decode_error(status: u16, body: &str) -> EngineFailure {
    if status >= 500 || status == 429 {
        return EngineFailure::Unavailable(format!("BigQuery HTTP {}: {}", status, body));
    }
    let json: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let first = &json["error"]["errors"][0];
    let reason = first["reason"].as_str().map(str::to_string);
    let message = first["message"]
        .as_str()
        .or_else(|| json["error"]["message"].as_str())
        .unwrap_or(body)
        .to_string();
    EngineFailure::Query {
        code: reason,
        message,
    }
}

#[async_trait]
impl QueryEngine for BigQueryEngine {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn execute(&self, request: &QueryRequest) -> Result<RowSet, EngineFailure> {
        let url = format!("{}/projects/{}/queries", self.endpoint, self.project_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineFailure::Timeout(e.to_string())
                } else {
                    EngineFailure::Unavailable(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| EngineFailure::Unavailable(e.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(decode_error(status, &body));
        }

        let json: Value = serde_json::from_str(&body).map_err(|e| EngineFailure::Query {
            code: None,
            message: format!("undecodable BigQuery response: {}", e),
        })?;
        decode_response(&json)
    }
}
