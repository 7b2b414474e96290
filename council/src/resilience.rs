//! Resilience — bounded retry with backoff, and per-model circuit breaking.
//!
//! ```text
//! call ─▶ Ok ─────────────────────────────▶ value
//!   └──▶ Err(transient) ─▶ sleep(backoff) ─▶ call (up to max_attempts)
//!   └──▶ Err(permanent) ─────────────────▶ error
//! ```
//!
//! Agents that exhaust their retries abstain; the sandbox turns exhausted
//! retries into `SandboxUnavailable`.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let ms = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// `is_transient` decides which errors are worth another attempt. The last
/// error is returned when the budget is spent.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_attempts && is_transient(&e) => {
                let delay = policy.backoff_for(attempt);
                warn!(
                    label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(label, attempt, error = %e, "Giving up");
                return Err(e);
            }
        }
    }
}

/// Circuit breaker state for a single model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy — requests allowed.
    Closed,
    /// Tripped — requests blocked until cooldown expires.
    Open,
    /// Cooldown expired — one probe request allowed.
    HalfOpen,
}

/// Per-model circuit breaker tracking consecutive failures.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    consecutive_failures: HashMap<String, u32>,
    last_failure: HashMap<String, Instant>,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time after the last failure before Open → HalfOpen.
    pub cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: HashMap::new(),
            last_failure: HashMap::new(),
            failure_threshold,
            cooldown,
        }
    }

    /// Record a success — resets circuit to Closed.
    pub fn record_success(&mut self, model: &str) {
        self.consecutive_failures.remove(model);
        self.last_failure.remove(model);
    }

    /// Record a failure — may trip circuit to Open.
    pub fn record_failure(&mut self, model: &str) {
        *self
            .consecutive_failures
            .entry(model.to_string())
            .or_insert(0) += 1;
        self.last_failure.insert(model.to_string(), Instant::now());
    }

    pub fn state(&self, model: &str) -> CircuitState {
        let failures = self.failure_count(model);
        if failures < self.failure_threshold {
            return CircuitState::Closed;
        }
        match self.last_failure.get(model) {
            Some(at) if at.elapsed() < self.cooldown => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    /// Whether the model may be called (Closed or HalfOpen).
    pub fn is_available(&self, model: &str) -> bool {
        !matches!(self.state(model), CircuitState::Open)
    }

    pub fn failure_count(&self, model: &str) -> u32 {
        self.consecutive_failures.get(model).copied().unwrap_or(0)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}
