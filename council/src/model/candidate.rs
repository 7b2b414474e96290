//! Candidate — a proposed SQL statement or answer, with provenance.
//!
//! Candidates are immutable once created. A repair produces a new
//! [`Candidate`] whose provenance points back at its parent; nothing ever
//! edits a candidate in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sql;

/// Stable identifier of a council participant.
///
/// Ordering is lexicographic and drives every "stable by agent id" sort.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Unique candidate identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(Uuid);

impl CandidateId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a candidate proposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateBody {
    /// A read-only SQL statement to be executed by the sandbox.
    Sql { statement: String },
    /// A direct natural-language answer (no execution needed).
    Answer { text: String },
    /// Sentinel emitted when generation failed for this attempt.
    CannotAnswer { reason: String },
}

impl CandidateBody {
    pub fn sql(statement: &str) -> Self {
        Self::Sql {
            statement: statement.to_string(),
        }
    }

    pub fn answer(text: &str) -> Self {
        Self::Answer {
            text: text.to_string(),
        }
    }

    pub fn cannot_answer(reason: &str) -> Self {
        Self::CannotAnswer {
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for CandidateBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sql { statement } => write!(f, "sql: {}", statement),
            Self::Answer { text } => write!(f, "answer: {}", text),
            Self::CannotAnswer { reason } => write!(f, "cannot answer: {}", reason),
        }
    }
}

/// Where a candidate came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Agent that authored the candidate.
    pub agent: AgentId,
    /// Round the candidate belongs to.
    pub round: u32,
    /// Candidate this one was derived from (repair or carry-forward).
    pub parent: Option<CandidateId>,
    /// Id of the first candidate in this lineage.
    pub lineage: CandidateId,
    /// Repair transitions between the lineage root and this candidate.
    pub repair_attempt: u32,
}

/// A proposed answer to the question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub body: CandidateBody,
    pub provenance: Provenance,
    /// Author's explanation.
    pub rationale: String,
    /// Raw backend output, kept for audit.
    pub raw_output: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    /// A fresh candidate that starts its own lineage.
    pub fn seed(agent: &AgentId, round: u32, body: CandidateBody, rationale: &str) -> Self {
        let id = CandidateId::new();
        Self {
            id,
            body,
            provenance: Provenance {
                agent: agent.clone(),
                round,
                parent: None,
                lineage: id,
                repair_attempt: 0,
            },
            rationale: rationale.to_string(),
            raw_output: None,
            created_at: Utc::now(),
        }
    }

    /// A repair of `parent`, authored in `round`.
    ///
    /// Shares the parent's lineage and advances its repair counter.
    pub fn repair_of(parent: &Candidate, round: u32, body: CandidateBody, rationale: &str) -> Self {
        Self {
            id: CandidateId::new(),
            body,
            provenance: Provenance {
                agent: parent.provenance.agent.clone(),
                round,
                parent: Some(parent.id),
                lineage: parent.provenance.lineage,
                repair_attempt: parent.provenance.repair_attempt + 1,
            },
            rationale: rationale.to_string(),
            raw_output: None,
            created_at: Utc::now(),
        }
    }

    /// An unchanged copy of `previous` placed in a later round.
    ///
    /// Not a repair: the repair counter is preserved.
    pub fn carried_forward(previous: &Candidate, round: u32) -> Self {
        Self {
            id: CandidateId::new(),
            body: previous.body.clone(),
            provenance: Provenance {
                agent: previous.provenance.agent.clone(),
                round,
                parent: Some(previous.id),
                lineage: previous.provenance.lineage,
                repair_attempt: previous.provenance.repair_attempt,
            },
            rationale: previous.rationale.clone(),
            raw_output: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_raw_output(mut self, raw: &str) -> Self {
        self.raw_output = Some(raw.to_string());
        self
    }

    pub fn author(&self) -> &AgentId {
        &self.provenance.agent
    }

    /// The SQL statement, if this is a SQL candidate.
    pub fn sql(&self) -> Option<&str> {
        match &self.body {
            CandidateBody::Sql { statement } => Some(statement),
            _ => None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self.body, CandidateBody::CannotAnswer { .. })
    }

    /// Key under which semantically equivalent candidates are grouped.
    ///
    /// SQL is normalized (case, whitespace, comments, trailing `;`);
    /// answers are compared trimmed and case-folded.
    pub fn semantic_key(&self) -> String {
        match &self.body {
            CandidateBody::Sql { statement } => format!("sql:{}", sql::normalize(statement)),
            CandidateBody::Answer { text } => {
                let folded: Vec<&str> = text.split_whitespace().collect();
                format!("answer:{}", folded.join(" ").to_lowercase())
            }
            CandidateBody::CannotAnswer { .. } => format!("cannot_answer:{}", self.id),
        }
    }
}
