//! Council configuration: defaults, TOML file, then `COUNCIL_*` overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resilience::RetryPolicy;
use crate::sandbox::SandboxLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("invalid config: {0}")]
    Parse(String),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("{0}")]
    Invalid(String),
}

/// Recognized council options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CouncilConfig {
    /// Debate round cap.
    pub max_rounds: u32,
    /// Repair budget per candidate lineage.
    pub max_repair_attempts: u32,
    pub round_timeout_ms: u64,
    pub execution_timeout_ms: u64,
    /// Whole-question deadline; 0 disables it.
    pub question_timeout_ms: u64,
    /// Stop once a round unanimously accepts one candidate.
    pub early_convergence: bool,
    /// Arguments scoring above `1 - fairness_threshold` are flagged.
    pub fairness_threshold: f64,
    /// Backoff for agent calls.
    pub retry: RetryPolicy,
    pub sandbox: SandboxLimits,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            max_repair_attempts: 3,
            round_timeout_ms: 120_000,
            execution_timeout_ms: 30_000,
            question_timeout_ms: 0,
            early_convergence: true,
            fairness_threshold: crate::debate::bias::DEFAULT_FAIRNESS_THRESHOLD,
            retry: RetryPolicy::default(),
            sandbox: SandboxLimits::default(),
        }
    }
}

impl CouncilConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Defaults, then the file at `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| ConfigError::Read {
                    path: p.display().to_string(),
                    reason: e.to_string(),
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        let config = config.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `COUNCIL_*` variables from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    key: key.to_string(),
                    value,
                })
        }

        if let Some(v) = lookup("COUNCIL_MAX_ROUNDS") {
            self.max_rounds = parse("COUNCIL_MAX_ROUNDS", v)?;
        }
        if let Some(v) = lookup("COUNCIL_MAX_REPAIR_ATTEMPTS") {
            self.max_repair_attempts = parse("COUNCIL_MAX_REPAIR_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("COUNCIL_ROUND_TIMEOUT_MS") {
            self.round_timeout_ms = parse("COUNCIL_ROUND_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("COUNCIL_EXECUTION_TIMEOUT_MS") {
            self.execution_timeout_ms = parse("COUNCIL_EXECUTION_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("COUNCIL_QUESTION_TIMEOUT_MS") {
            self.question_timeout_ms = parse("COUNCIL_QUESTION_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("COUNCIL_FAIRNESS_THRESHOLD") {
            self.fairness_threshold = parse("COUNCIL_FAIRNESS_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("COUNCIL_EARLY_CONVERGENCE") {
            self.early_convergence = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "COUNCIL_EARLY_CONVERGENCE".into(),
                        value: v,
                    })
                }
            };
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rounds == 0 {
            return Err(ConfigError::Invalid("max_rounds must be at least 1".into()));
        }
        if self.round_timeout_ms == 0 || self.execution_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "round_timeout_ms and execution_timeout_ms must be positive".into(),
            ));
        }
        if !(self.fairness_threshold > 0.0 && self.fairness_threshold <= 1.0) {
            return Err(ConfigError::Invalid("fairness_threshold must be in (0, 1]".into()));
        }
        if self.sandbox.max_rows == 0 || self.sandbox.max_bytes == 0 {
            return Err(ConfigError::Invalid("sandbox limits must be positive".into()));
        }
        Ok(())
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn question_timeout(&self) -> Option<Duration> {
        (self.question_timeout_ms > 0).then(|| Duration::from_millis(self.question_timeout_ms))
    }
}
