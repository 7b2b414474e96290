//! Transcript persistence — write-once records plus a summary index.
//!
//! Layout of a [`FileTranscriptStore`] directory:
//!
//! ```text
//! debate_logs/
//! ├── debate_<id>.json         one pretty-printed record, never rewritten
//! └── debate_summaries.jsonl   one summary line per record, append-only
//! ```

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{AuditOutcome, Synthesis};
use crate::debate::bias::BiasReport;
use crate::debate::consensus::Verdict;
use crate::model::question::{Question, Schema};
use crate::model::transcript::{Abstention, Transcript};
use crate::orchestrator::state::{CouncilPhase, PhaseTransition};

const INDEX_FILE: &str = "debate_summaries.jsonl";

/// Error during persistence operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("serialize failed: {reason}")]
    SerializeFailed { reason: String },

    #[error("deserialize failed: {reason}")]
    DeserializeFailed { reason: String },

    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("integrity check failed: {reason}")]
    IntegrityCheckFailed { reason: String },

    #[error("transcript {id} already stored")]
    AlreadyExists { id: String },

    #[error("transcript {id} not found")]
    NotFound { id: String },

    #[error("io error on {path}: {reason}")]
    Io { path: String, reason: String },
}

impl PersistenceError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}

/// Everything recorded about one question's debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    /// Schema version for forward compatibility.
    pub version: u32,
    /// Content hash of the question text and start time.
    pub id: String,
    pub question: Question,
    pub schema: Schema,
    pub transcript: Transcript,
    /// Terminal phase: `completed` or `failed`.
    pub phase: CouncilPhase,
    pub phases: Vec<PhaseTransition>,
    pub verdict: Option<Verdict>,
    pub synthesis: Option<Synthesis>,
    pub audit: Option<AuditOutcome>,
    /// Bias analysis of the debate's arguments; absent in older records.
    #[serde(default)]
    pub bias: Option<BiasReport>,
    /// Aggregator or judge calls that failed after the decision.
    pub post_decision_abstentions: Vec<Abstention>,
    /// Set when the session failed.
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TranscriptRecord {
    /// Current schema version.
    pub const CURRENT_VERSION: u32 = 1;

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, PersistenceError> {
        serde_json::to_string_pretty(self).map_err(|e| PersistenceError::SerializeFailed {
            reason: e.to_string(),
        })
    }

    /// Deserialize and validate.
    pub fn from_json(json: &str) -> Result<Self, PersistenceError> {
        let record: Self = serde_json::from_str(json).map_err(|e| PersistenceError::DeserializeFailed {
            reason: e.to_string(),
        })?;
        if record.version != Self::CURRENT_VERSION {
            return Err(PersistenceError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                found: record.version,
            });
        }
        record.validate()?;
        Ok(record)
    }

    /// Check the transcript invariants a stored record must keep.
    pub fn validate(&self) -> Result<(), PersistenceError> {
        Transcript::from_rounds(self.transcript.question_id(), self.transcript.rounds().to_vec()).map_err(|e| {
            PersistenceError::IntegrityCheckFailed {
                reason: e.to_string(),
            }
        })?;
        if self.transcript.question_id() != self.question.id {
            return Err(PersistenceError::IntegrityCheckFailed {
                reason: format!(
                    "transcript belongs to question {}, record to {}",
                    self.transcript.question_id(),
                    self.question.id
                ),
            });
        }
        if let Some(chosen) = self.verdict.as_ref().and_then(|v| v.chosen()) {
            if !self.transcript.contains_candidate(chosen.id) {
                return Err(PersistenceError::IntegrityCheckFailed {
                    reason: format!("verdict candidate {} is not in the transcript", chosen.id),
                });
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> TranscriptSummary {
        let outcome = match (&self.phase, &self.verdict) {
            (CouncilPhase::Failed, _) => "failed",
            (_, Some(Verdict::Decided(_))) => "decided",
            (_, Some(Verdict::NoConsensus(_))) => "no_consensus",
            (_, None) => "undecided",
        };
        TranscriptSummary {
            id: self.id.clone(),
            question_id: self.question.id,
            storage_key: self.question.storage_key(),
            question: self.question.text.clone(),
            rounds: self.transcript.len() as u32,
            outcome: outcome.to_string(),
            chosen_sql: self
                .verdict
                .as_ref()
                .and_then(|v| v.chosen())
                .and_then(|c| c.sql())
                .map(str::to_string),
            finished_at: self.finished_at,
        }
    }
}

/// One line of the summary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSummary {
    pub id: String,
    pub question_id: Uuid,
    /// Session id when the question had one, else the question id.
    pub storage_key: String,
    pub question: String,
    pub rounds: u32,
    /// `decided`, `no_consensus`, `failed`, or `undecided`.
    pub outcome: String,
    pub chosen_sql: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Append-only store of finished transcripts.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Store a record. Records are write-once.
    async fn append(&self, record: &TranscriptRecord) -> Result<(), PersistenceError>;

    async fn load(&self, id: &str) -> Result<TranscriptRecord, PersistenceError>;

    /// Most recent summaries first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<TranscriptSummary>, PersistenceError>;
}

/// Directory of JSON records.
#[derive(Debug, Clone)]
pub struct FileTranscriptStore {
    dir: PathBuf,
}

impl FileTranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("debate_{}.json", id))
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }
}

/// Ids become file names; keep them to a safe alphabet.
fn check_id(id: &str) -> Result<(), PersistenceError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(PersistenceError::NotFound { id: id.to_string() });
    }
    Ok(())
}

#[async_trait]
impl TranscriptStore for FileTranscriptStore {
    async fn append(&self, record: &TranscriptRecord) -> Result<(), PersistenceError> {
        check_id(&record.id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PersistenceError::io(&self.dir, e))?;

        let path = self.record_path(&record.id);
        let json = record.to_json()?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    PersistenceError::AlreadyExists { id: record.id.clone() }
                } else {
                    PersistenceError::io(&path, e)
                }
            })?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| PersistenceError::io(&path, e))?;
        file.flush().await.map_err(|e| PersistenceError::io(&path, e))?;

        let index = self.index_path();
        let mut line = serde_json::to_string(&record.summary()).map_err(|e| PersistenceError::SerializeFailed {
            reason: e.to_string(),
        })?;
        line.push('\n');
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index)
            .await
            .map_err(|e| PersistenceError::io(&index, e))?;
        log.write_all(line.as_bytes())
            .await
            .map_err(|e| PersistenceError::io(&index, e))?;
        log.flush().await.map_err(|e| PersistenceError::io(&index, e))?;

        info!(id = %record.id, path = %path.display(), rounds = record.transcript.len(), "Transcript stored");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<TranscriptRecord, PersistenceError> {
        check_id(id)?;
        let path = self.record_path(id);
        let json = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PersistenceError::NotFound { id: id.to_string() }
            } else {
                PersistenceError::io(&path, e)
            }
        })?;
        TranscriptRecord::from_json(&json)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<TranscriptSummary>, PersistenceError> {
        let index = self.index_path();
        let content = match tokio::fs::read_to_string(&index).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(&index, e)),
        };
        let mut summaries = Vec::new();
        for (n, line) in content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            match serde_json::from_str::<TranscriptSummary>(line) {
                Ok(s) => summaries.push(s),
                Err(e) => warn!(line = n + 1, error = %e, "Skipping unreadable index line"),
            }
        }
        summaries.reverse();
        summaries.truncate(limit);
        debug!(count = summaries.len(), "Listed transcripts");
        Ok(summaries)
    }
}

/// In-process store, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryTranscriptStore {
    records: Mutex<Vec<TranscriptRecord>>,
}

impl MemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TranscriptStore for MemoryTranscriptStore {
    async fn append(&self, record: &TranscriptRecord) -> Result<(), PersistenceError> {
        record.validate()?;
        let mut records = self.records.lock().map_err(|e| PersistenceError::Io {
            path: "memory".into(),
            reason: e.to_string(),
        })?;
        if records.iter().any(|r| r.id == record.id) {
            return Err(PersistenceError::AlreadyExists { id: record.id.clone() });
        }
        records.push(record.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<TranscriptRecord, PersistenceError> {
        let records = self.records.lock().map_err(|e| PersistenceError::Io {
            path: "memory".into(),
            reason: e.to_string(),
        })?;
        records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound { id: id.to_string() })
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<TranscriptSummary>, PersistenceError> {
        let records = self.records.lock().map_err(|e| PersistenceError::Io {
            path: "memory".into(),
            reason: e.to_string(),
        })?;
        Ok(records.iter().rev().take(limit).map(|r| r.summary()).collect())
    }
}
