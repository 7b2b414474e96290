//! Reasoning backends — the external model endpoints agents call.
//!
//! Two wire formats are supported: OpenAI-compatible chat completions
//! (OpenAI, OpenRouter, vLLM, Ollama, ...) and the Anthropic messages API.
//! [`FallbackBackend`] chains several backends and skips models whose
//! circuit is open.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::resilience::CircuitBreaker;

/// Errors from a reasoning backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("API key not configured for {0}")]
    MissingApiKey(String),

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("no backend available: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) | Self::Timeout(_) | Self::Unavailable(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::MissingApiKey(_) | Self::Parse(_) => false,
        }
    }

    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// A single completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the backend for a JSON object response when it supports it.
    pub json_mode: bool,
}

impl BackendRequest {
    pub fn new(system: &str, prompt: &str) -> Self {
        Self {
            system: system.to_string(),
            prompt: prompt.to_string(),
            max_tokens: 2048,
            temperature: 0.2,
            json_mode: true,
        }
    }
}

/// Completion text plus the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub text: String,
    pub model: String,
    pub elapsed_ms: u64,
}

/// A model endpoint.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Label used in logs and circuit breaking (usually the model name).
    fn label(&self) -> &str;

    async fn complete(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError>;
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, BackendError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BackendError::Request(format!("failed to create HTTP client: {}", e)))
}

/// OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatibleBackend {
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            timeout,
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl ReasoningBackend for OpenAiCompatibleBackend {
    fn label(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let start = std::time::Instant::now();

        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt }
            ]
        });
        if request.json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;

        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| BackendError::Parse("missing choices[0].message.content".into()))?
            .to_string();

        Ok(BackendResponse {
            text,
            model: self.model.clone(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Anthropic messages API.
pub struct AnthropicBackend {
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Result<Self, BackendError> {
        if api_key.is_empty() {
            return Err(BackendError::MissingApiKey("anthropic".into()));
        }
        Ok(Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            timeout,
            client: http_client(timeout)?,
        })
    }

    /// Point at a different host (proxies, tests).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ReasoningBackend for AnthropicBackend {
    fn label(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let start = std::time::Instant::now();

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "system": request.system,
            "messages": [{ "role": "user", "content": request.prompt }]
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;

        let text = json["content"][0]["text"]
            .as_str()
            .ok_or_else(|| BackendError::Parse("missing content[0].text".into()))?
            .to_string();

        Ok(BackendResponse {
            text,
            model: self.model.clone(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Ordered chain of backends; the first healthy one that answers wins.
pub struct FallbackBackend {
    label: String,
    chain: Vec<Box<dyn ReasoningBackend>>,
    breaker: Mutex<CircuitBreaker>,
}

impl FallbackBackend {
    pub fn new(label: &str, chain: Vec<Box<dyn ReasoningBackend>>, breaker: CircuitBreaker) -> Self {
        Self {
            label: label.to_string(),
            chain,
            breaker: Mutex::new(breaker),
        }
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    fn available(&self, model: &str) -> bool {
        match self.breaker.lock() {
            Ok(b) => b.is_available(model),
            Err(poisoned) => poisoned.into_inner().is_available(model),
        }
    }

    fn record(&self, model: &str, ok: bool) {
        let mut guard = match self.breaker.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ok {
            guard.record_success(model);
        } else {
            guard.record_failure(model);
        }
    }
}

#[async_trait]
impl ReasoningBackend for FallbackBackend {
    fn label(&self) -> &str {
        &self.label
    }

    async fn complete(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let mut last_error: Option<BackendError> = None;

        for backend in &self.chain {
            let model = backend.label();
            if !self.available(model) {
                debug!(chain = %self.label, model, "Skipping model with open circuit");
                continue;
            }
            match backend.complete(request).await {
                Ok(resp) => {
                    self.record(model, true);
                    return Ok(resp);
                }
                Err(e) => {
                    warn!(chain = %self.label, model, error = %e, "Backend failed, trying next");
                    if e.is_transient() {
                        self.record(model, false);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) if e.is_transient() => {
                BackendError::Unavailable(format!("{}: all models failed, last: {}", self.label, e))
            }
            Some(e) => e,
            None => BackendError::Unavailable(format!("{}: every circuit is open", self.label)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Scripted {
        label: String,
        fail_with: Option<BackendError>,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ReasoningBackend for Scripted {
        fn label(&self) -> &str {
            &self.label
        }

        async fn complete(&self, _request: &BackendRequest) -> Result<BackendResponse, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(BackendResponse {
                    text: format!("from {}", self.label),
                    model: self.label.clone(),
                    elapsed_ms: 0,
                }),
            }
        }
    }

    fn scripted(label: &str, fail_with: Option<BackendError>) -> (Box<dyn ReasoningBackend>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Box::new(Scripted {
                label: label.to_string(),
                fail_with,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Status { status: 429, body: String::new() }.is_transient());
        assert!(BackendError::Status { status: 503, body: String::new() }.is_transient());
        assert!(!BackendError::Status { status: 401, body: String::new() }.is_transient());
        assert!(!BackendError::Parse("x".into()).is_transient());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_transient());
    }

    #[tokio::test]
    async fn test_fallback_uses_next_model() {
        let (primary, _) = scripted("primary", Some(BackendError::Request("refused".into())));
        let (secondary, _) = scripted("secondary", None);
        let chain = FallbackBackend::new("optimist", vec![primary, secondary], CircuitBreaker::default());
        let resp = chain.complete(&BackendRequest::new("s", "p")).await.unwrap();
        assert_eq!(resp.model, "secondary");
    }

    #[tokio::test]
    async fn test_open_circuit_is_skipped() {
        let (primary, primary_calls) = scripted("primary", Some(BackendError::Request("down".into())));
        let (secondary, _) = scripted("secondary", None);
        let breaker = CircuitBreaker::new(1, Duration::from_secs(3600));
        let chain = FallbackBackend::new("c", vec![primary, secondary], breaker);
        chain.complete(&BackendRequest::new("s", "p")).await.unwrap();
        chain.complete(&BackendRequest::new("s", "p")).await.unwrap();
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_failing_is_unavailable() {
        let (a, _) = scripted("a", Some(BackendError::Timeout(Duration::from_secs(1))));
        let chain = FallbackBackend::new("c", vec![a], CircuitBreaker::default());
        let err = chain.complete(&BackendRequest::new("s", "p")).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_permanent_error_surfaces() {
        let (a, _) = scripted("a", Some(BackendError::MissingApiKey("openai".into())));
        let chain = FallbackBackend::new("c", vec![a], CircuitBreaker::default());
        let err = chain.complete(&BackendRequest::new("s", "p")).await.unwrap_err();
        assert!(matches!(err, BackendError::MissingApiKey(_)));
    }
}
