//! Rounds and the transcript — the durable record of one debate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::debate::critique::{Critique, CritiqueVerdict};
use crate::debate::metrics::RoundMetrics;
use crate::model::candidate::{AgentId, Candidate, CandidateId};
use crate::model::execution::ExecutionResult;
use crate::model::lineage::Lineage;

/// Which call an agent failed to answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum AbstentionPhase {
    Propose,
    Critique { candidate: CandidateId },
    Synthesize,
    Audit,
}

impl std::fmt::Display for AbstentionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Propose => write!(f, "propose"),
            Self::Critique { candidate } => write!(f, "critique of {}", candidate),
            Self::Synthesize => write!(f, "synthesize"),
            Self::Audit => write!(f, "audit"),
        }
    }
}

/// An agent that did not answer within its retry budget or deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abstention {
    pub agent: AgentId,
    pub phase: AbstentionPhase,
    pub reason: String,
}

impl Abstention {
    pub fn new(agent: &AgentId, phase: AbstentionPhase, reason: &str) -> Self {
        Self {
            agent: agent.clone(),
            phase,
            reason: reason.to_string(),
        }
    }
}

/// One proposer's lineage for the round plus the critiques of its surfaced candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundEntry {
    pub lineage: Lineage,
    /// Sorted by critic id.
    pub critiques: Vec<Critique>,
}

impl RoundEntry {
    pub fn new(lineage: Lineage, mut critiques: Vec<Critique>) -> Self {
        critiques.sort_by(|a, b| a.critic.cmp(&b.critic));
        Self { lineage, critiques }
    }

    /// The candidate the round presents for this proposer.
    pub fn candidate(&self) -> &Candidate {
        &self.lineage.surfaced().candidate
    }

    pub fn execution(&self) -> Option<&ExecutionResult> {
        self.lineage.surfaced().execution.as_ref()
    }

    pub fn author(&self) -> &AgentId {
        self.candidate().author()
    }

    pub fn accepts(&self) -> usize {
        self.count(CritiqueVerdict::Accept)
    }

    pub fn count(&self, verdict: CritiqueVerdict) -> usize {
        self.critiques.iter().filter(|c| c.verdict == verdict).count()
    }

    /// At least one critique, and every critique accepts.
    pub fn unanimously_accepted(&self) -> bool {
        !self.critiques.is_empty() && self.accepts() == self.critiques.len()
    }

    /// The most severe critique: reject before revise, then by critic id.
    pub fn most_severe_objection(&self) -> Option<&Critique> {
        self.critiques
            .iter()
            .filter(|c| c.verdict != CritiqueVerdict::Accept)
            .min_by(|a, b| {
                b.verdict
                    .severity()
                    .cmp(&a.verdict.severity())
                    .then_with(|| a.critic.cmp(&b.critic))
            })
    }
}

/// One closed sweep of propose + critique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub number: u32,
    /// Sorted by author id.
    pub entries: Vec<RoundEntry>,
    /// Sorted by agent id.
    pub abstentions: Vec<Abstention>,
    pub metrics: RoundMetrics,
    /// Candidate that every responding critic accepted, when early
    /// convergence applies.
    pub converged_on: Option<CandidateId>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl Round {
    /// Assemble a closed round, sorting entries and abstentions into
    /// their stable order and computing metrics.
    pub fn close(
        number: u32,
        mut entries: Vec<RoundEntry>,
        mut abstentions: Vec<Abstention>,
        expected_responses: usize,
        opened_at: DateTime<Utc>,
    ) -> Self {
        entries.sort_by(|a, b| a.author().cmp(b.author()));
        abstentions.sort_by(|a, b| {
            a.agent
                .cmp(&b.agent)
                .then_with(|| a.phase.to_string().cmp(&b.phase.to_string()))
        });
        let metrics = RoundMetrics::compute(&entries, abstentions.len(), expected_responses);
        let converged_on = entries
            .iter()
            .find(|e| {
                let id = e.candidate().id;
                e.unanimously_accepted()
                    && !abstentions
                        .iter()
                        .any(|a| a.phase == AbstentionPhase::Critique { candidate: id })
            })
            .map(|e| e.candidate().id);
        Self {
            number,
            entries,
            abstentions,
            metrics,
            converged_on,
            opened_at,
            closed_at: Utc::now(),
        }
    }

    pub fn entry_for(&self, agent: &AgentId) -> Option<&RoundEntry> {
        self.entries.iter().find(|e| e.author() == agent)
    }

    pub fn total_accepts(&self) -> usize {
        self.entries.iter().map(|e| e.accepts()).sum()
    }

    /// Whether `id` is any candidate of this round, surfaced or not.
    pub fn contains_candidate(&self, id: CandidateId) -> bool {
        self.entries
            .iter()
            .any(|e| e.lineage.steps().iter().any(|s| s.candidate.id == id))
    }
}

/// Violations of the transcript's append-only numbering.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptError {
    #[error("round {got} appended out of order (expected {expected})")]
    OutOfOrder { expected: u32, got: u32 },
    #[error("candidate {candidate} recorded in round {recorded} but claims round {claimed}")]
    ForeignCandidate {
        candidate: CandidateId,
        recorded: u32,
        claimed: u32,
    },
}

/// The full ordered sequence of rounds for one question.
///
/// Only the orchestrator appends; everyone else reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    question_id: Uuid,
    rounds: Vec<Round>,
}

impl Transcript {
    pub fn new(question_id: Uuid) -> Self {
        Self {
            question_id,
            rounds: Vec::new(),
        }
    }

    /// Rebuild a transcript from stored rounds, checking every invariant.
    pub fn from_rounds(question_id: Uuid, rounds: Vec<Round>) -> Result<Self, TranscriptError> {
        let mut transcript = Self::new(question_id);
        for round in rounds {
            transcript.append(round)?;
        }
        Ok(transcript)
    }

    /// Append the next closed round.
    pub(crate) fn append(&mut self, round: Round) -> Result<(), TranscriptError> {
        let expected = self.next_round_number();
        if round.number != expected {
            return Err(TranscriptError::OutOfOrder {
                expected,
                got: round.number,
            });
        }
        for entry in &round.entries {
            for step in entry.lineage.steps() {
                if step.candidate.provenance.round != round.number {
                    return Err(TranscriptError::ForeignCandidate {
                        candidate: step.candidate.id,
                        recorded: round.number,
                        claimed: step.candidate.provenance.round,
                    });
                }
            }
        }
        self.rounds.push(round);
        Ok(())
    }

    pub fn question_id(&self) -> Uuid {
        self.question_id
    }

    pub fn rounds(&self) -> &[Round] {
        &self.rounds
    }

    pub fn last_round(&self) -> Option<&Round> {
        self.rounds.last()
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn next_round_number(&self) -> u32 {
        self.rounds.len() as u32
    }

    pub fn contains_candidate(&self, id: CandidateId) -> bool {
        self.rounds.iter().any(|r| r.contains_candidate(id))
    }

    /// Whether any round recorded an accept.
    pub fn any_accept(&self) -> bool {
        self.rounds.iter().any(|r| r.total_accepts() > 0)
    }

    /// Round numbers are exactly 0..len.
    pub fn is_contiguous(&self) -> bool {
        self.rounds
            .iter()
            .enumerate()
            .all(|(i, r)| r.number == i as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::candidate::CandidateBody;

    fn entry(agent: &str, round: u32) -> RoundEntry {
        let c = Candidate::seed(&AgentId::new(agent), round, CandidateBody::sql("SELECT 1"), "");
        RoundEntry::new(Lineage::start(c, None), vec![])
    }

    fn round(number: u32, agents: &[&str]) -> Round {
        let entries = agents.iter().map(|a| entry(a, number)).collect();
        Round::close(number, entries, vec![], 0, Utc::now())
    }

    #[test]
    fn test_append_requires_contiguous_numbers() {
        let mut t = Transcript::new(Uuid::new_v4());
        t.append(round(0, &["a"])).unwrap();
        let err = t.append(round(2, &["a"])).unwrap_err();
        assert_eq!(err, TranscriptError::OutOfOrder { expected: 1, got: 2 });
        t.append(round(1, &["a"])).unwrap();
        assert!(t.is_contiguous());
        assert_eq!(t.next_round_number(), 2);
    }

    #[test]
    fn test_append_rejects_candidate_from_other_round() {
        let mut t = Transcript::new(Uuid::new_v4());
        let stray = entry("a", 3);
        let r = Round::close(0, vec![stray], vec![], 0, Utc::now());
        assert!(matches!(
            t.append(r),
            Err(TranscriptError::ForeignCandidate { claimed: 3, .. })
        ));
    }

    #[test]
    fn test_close_sorts_entries_by_author() {
        let r = round(0, &["zeta", "alpha", "mid"]);
        let authors: Vec<&str> = r.entries.iter().map(|e| e.author().as_str()).collect();
        assert_eq!(authors, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_from_rounds_validates() {
        let ok = Transcript::from_rounds(Uuid::new_v4(), vec![round(0, &["a"]), round(1, &["a"])]);
        assert!(ok.is_ok());
        let bad = Transcript::from_rounds(Uuid::new_v4(), vec![round(1, &["a"])]);
        assert!(bad.is_err());
    }
}
