//! Critiques — structured reviews of a candidate by another agent.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::model::candidate::{AgentId, CandidateId};

/// A critic's verdict on a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CritiqueVerdict {
    /// The candidate answers the question correctly.
    Accept,
    /// The candidate is wrong and should be discarded.
    Reject,
    /// The candidate is close but needs changes.
    Revise,
}

impl CritiqueVerdict {
    /// Ordering used to pick the most severe objection.
    pub fn severity(self) -> u8 {
        match self {
            Self::Accept => 0,
            Self::Revise => 1,
            Self::Reject => 2,
        }
    }

    /// Whether this verdict asks the author to repair.
    pub fn requests_repair(self) -> bool {
        matches!(self, Self::Reject | Self::Revise)
    }

    /// Lenient parse of a verdict word from model output.
    pub fn parse_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "accept" | "accepted" | "approve" | "approved" => Some(Self::Accept),
            "reject" | "rejected" => Some(Self::Reject),
            "revise" | "revision" | "request_changes" | "needs_revision" => Some(Self::Revise),
            _ => None,
        }
    }
}

impl std::fmt::Display for CritiqueVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Reject => write!(f, "reject"),
            Self::Revise => write!(f, "revise"),
        }
    }
}

/// One agent's review of one candidate. Never mutates the candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Critique {
    pub critic: AgentId,
    pub candidate: CandidateId,
    pub verdict: CritiqueVerdict,
    pub rationale: String,
    pub suggested_revision: Option<String>,
    /// Raw backend output, kept for audit.
    pub raw_output: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Critique {
    pub fn new(critic: &AgentId, candidate: CandidateId, verdict: CritiqueVerdict, rationale: &str) -> Self {
        Self {
            critic: critic.clone(),
            candidate,
            verdict,
            rationale: rationale.to_string(),
            suggested_revision: None,
            raw_output: None,
            created_at: Utc::now(),
        }
    }

    pub fn accept(critic: &AgentId, candidate: CandidateId, rationale: &str) -> Self {
        Self::new(critic, candidate, CritiqueVerdict::Accept, rationale)
    }

    pub fn reject(critic: &AgentId, candidate: CandidateId, rationale: &str) -> Self {
        Self::new(critic, candidate, CritiqueVerdict::Reject, rationale)
    }

    pub fn revise(critic: &AgentId, candidate: CandidateId, rationale: &str) -> Self {
        Self::new(critic, candidate, CritiqueVerdict::Revise, rationale)
    }

    /// Set a suggested revision.
    pub fn with_suggestion(mut self, revision: &str) -> Self {
        self.suggested_revision = Some(revision.to_string());
        self
    }

    pub fn with_raw_output(mut self, raw: &str) -> Self {
        self.raw_output = Some(raw.to_string());
        self
    }
}

impl std::fmt::Display for Critique {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.verdict, self.critic, self.rationale)?;
        if let Some(rev) = &self.suggested_revision {
            write!(f, "\n  Suggested: {}", rev)?;
        }
        Ok(())
    }
}

/// Render critiques as a compact block for prompts and logs.
pub fn format_critiques(critiques: &[Critique]) -> String {
    if critiques.is_empty() {
        return "No critiques.".to_string();
    }
    critiques
        .iter()
        .map(|c| format!("- {}", c))
        .collect::<Vec<_>>()
        .join("\n")
}
