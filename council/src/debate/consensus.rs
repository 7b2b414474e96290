//! Consensus engine — deterministic tally over the final round.
//!
//! Final-round entries are grouped by the semantic key of their surfaced
//! candidate. The group with the most accepts wins; ties fall through, in
//! order, to a successful execution, fewer repair attempts, and the
//! smallest creator id. No wall-clock or arrival-order input is read, so
//! deciding the same transcript twice gives the same verdict.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::debate::critique::CritiqueVerdict;
use crate::model::candidate::{AgentId, Candidate, CandidateId};
use crate::model::execution::ExecutionResult;
use crate::model::transcript::{RoundEntry, Transcript};

/// Which rule separated the winner from the runner-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakReason {
    /// Strictly more accepts (or no competitor).
    Majority,
    /// Tied on accepts; only the winner executed cleanly.
    ExecutionSucceeded,
    /// Tied so far; the winner's lineage needed fewer repairs.
    FewerRepairs,
    /// Tied on everything; smallest creator agent id.
    AgentIdOrder,
}

impl std::fmt::Display for TieBreakReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Majority => write!(f, "majority"),
            Self::ExecutionSucceeded => write!(f, "execution_succeeded"),
            Self::FewerRepairs => write!(f, "fewer_repairs"),
            Self::AgentIdOrder => write!(f, "agent_id_order"),
        }
    }
}

/// Votes for one semantically distinct candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyEntry {
    /// Normalized SQL or folded answer text.
    pub key: String,
    /// Surfaced candidates sharing the key, in author order.
    pub candidates: Vec<CandidateId>,
    /// Authors of those candidates, sorted.
    pub creators: Vec<AgentId>,
    pub accepts: usize,
    pub rejects: usize,
    pub revises: usize,
    /// The candidate that stands for the group.
    pub representative: CandidateId,
    /// Whether the representative's latest execution succeeded.
    pub latest_succeeded: bool,
    /// Repair attempts in the representative's lineage.
    pub repair_attempts: u32,
}

impl TallyEntry {
    fn first_creator(&self) -> Option<&AgentId> {
        self.creators.first()
    }
}

impl std::fmt::Display for TallyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let creators: Vec<&str> = self.creators.iter().map(|a| a.as_str()).collect();
        write!(
            f,
            "{} accept / {} reject / {} revise by [{}], {} repair(s), execution {}: {}",
            self.accepts,
            self.rejects,
            self.revises,
            creators.join(", "),
            self.repair_attempts,
            if self.latest_succeeded { "ok" } else { "failed" },
            self.key
        )
    }
}

/// A chosen candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub chosen: Candidate,
    pub execution: Option<ExecutionResult>,
    /// Round the chosen candidate was surfaced in.
    pub round: u32,
    /// Winner first.
    pub tally: Vec<TallyEntry>,
    pub tie_break: TieBreakReason,
}

/// The debate ended without any accepted candidate in its final round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoConsensus {
    pub reason: String,
    /// Rounds the debate closed.
    pub rounds: u32,
    /// Whether some earlier round had at least one accept.
    pub earlier_accepts: bool,
    pub tally: Vec<TallyEntry>,
}

/// Terminal outcome of consensus for one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Verdict {
    Decided(Decision),
    NoConsensus(NoConsensus),
}

impl Verdict {
    pub fn chosen(&self) -> Option<&Candidate> {
        match self {
            Self::Decided(d) => Some(&d.chosen),
            Self::NoConsensus(_) => None,
        }
    }

    pub fn execution(&self) -> Option<&ExecutionResult> {
        match self {
            Self::Decided(d) => d.execution.as_ref(),
            Self::NoConsensus(_) => None,
        }
    }

    pub fn tie_break(&self) -> Option<TieBreakReason> {
        match self {
            Self::Decided(d) => Some(d.tie_break),
            Self::NoConsensus(_) => None,
        }
    }

    pub fn tally(&self) -> &[TallyEntry] {
        match self {
            Self::Decided(d) => &d.tally,
            Self::NoConsensus(n) => &n.tally,
        }
    }

    pub fn is_no_consensus(&self) -> bool {
        matches!(self, Self::NoConsensus(_))
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decided(d) => write!(
                f,
                "decided on {} by {} (round {}, {})",
                d.chosen.id,
                d.chosen.author(),
                d.round,
                d.tie_break
            ),
            Self::NoConsensus(n) => write!(f, "no consensus after {} round(s): {}", n.rounds, n.reason),
        }
    }
}

/// Build the tally for one round's entries, winner first.
pub fn tally(entries: &[RoundEntry]) -> Vec<TallyEntry> {
    let mut groups: BTreeMap<String, Vec<&RoundEntry>> = BTreeMap::new();
    for entry in entries {
        groups.entry(entry.candidate().semantic_key()).or_default().push(entry);
    }

    let mut tally: Vec<TallyEntry> = groups
        .into_iter()
        .map(|(key, mut members)| {
            members.sort_by(|a, b| a.author().cmp(b.author()));
            let representative = members
                .iter()
                .min_by(|a, b| {
                    succeeded(b)
                        .cmp(&succeeded(a))
                        .then_with(|| a.lineage.repair_attempts().cmp(&b.lineage.repair_attempts()))
                        .then_with(|| a.author().cmp(b.author()))
                })
                .copied()
                .unwrap_or(members[0]);
            let mut creators: Vec<AgentId> = members.iter().map(|e| e.author().clone()).collect();
            creators.sort();
            creators.dedup();
            TallyEntry {
                key,
                candidates: members.iter().map(|e| e.candidate().id).collect(),
                creators,
                accepts: members.iter().map(|e| e.count(CritiqueVerdict::Accept)).sum(),
                rejects: members.iter().map(|e| e.count(CritiqueVerdict::Reject)).sum(),
                revises: members.iter().map(|e| e.count(CritiqueVerdict::Revise)).sum(),
                representative: representative.candidate().id,
                latest_succeeded: succeeded(representative),
                repair_attempts: representative.lineage.repair_attempts(),
            }
        })
        .collect();

    tally.sort_by(|a, b| {
        b.accepts
            .cmp(&a.accepts)
            .then_with(|| b.latest_succeeded.cmp(&a.latest_succeeded))
            .then_with(|| a.repair_attempts.cmp(&b.repair_attempts))
            .then_with(|| a.first_creator().cmp(&b.first_creator()))
            .then_with(|| a.key.cmp(&b.key))
    });
    tally
}

fn succeeded(entry: &RoundEntry) -> bool {
    entry.execution().is_some_and(|e| e.is_success())
}

fn tie_break(winner: &TallyEntry, runner_up: Option<&TallyEntry>) -> TieBreakReason {
    let Some(other) = runner_up else {
        return TieBreakReason::Majority;
    };
    if winner.accepts != other.accepts {
        TieBreakReason::Majority
    } else if winner.latest_succeeded != other.latest_succeeded {
        TieBreakReason::ExecutionSucceeded
    } else if winner.repair_attempts != other.repair_attempts {
        TieBreakReason::FewerRepairs
    } else {
        TieBreakReason::AgentIdOrder
    }
}

/// Select the final answer from a closed transcript.
pub fn decide(transcript: &Transcript) -> Verdict {
    let rounds = transcript.len() as u32;
    let Some(last) = transcript.last_round() else {
        return Verdict::NoConsensus(NoConsensus {
            reason: "no round closed".to_string(),
            rounds: 0,
            earlier_accepts: false,
            tally: Vec::new(),
        });
    };

    let tally = tally(&last.entries);
    let winner = tally.first().filter(|t| t.accepts > 0);

    let Some(winner) = winner else {
        let earlier_accepts = transcript.rounds()[..transcript.len() - 1]
            .iter()
            .any(|r| r.total_accepts() > 0);
        let reason = if last.entries.is_empty() {
            format!("final round {} produced no candidates", last.number)
        } else if earlier_accepts {
            format!(
                "no candidate accepted in final round {}; earlier rounds had accepts that did not hold",
                last.number
            )
        } else {
            format!("no candidate received an accept in {} round(s)", rounds)
        };
        return Verdict::NoConsensus(NoConsensus {
            reason,
            rounds,
            earlier_accepts,
            tally,
        });
    };

    let reason = tie_break(winner, tally.get(1));
    // The representative always comes from `last.entries`.
    let entry = last
        .entries
        .iter()
        .find(|e| e.candidate().id == winner.representative);
    match entry {
        Some(entry) => Verdict::Decided(Decision {
            chosen: entry.candidate().clone(),
            execution: entry.execution().cloned(),
            round: last.number,
            tie_break: reason,
            tally,
        }),
        None => Verdict::NoConsensus(NoConsensus {
            reason: "tally referenced a candidate missing from the final round".to_string(),
            rounds,
            earlier_accepts: transcript.any_accept(),
            tally,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debate::critique::Critique;
    use crate::model::candidate::CandidateBody;
    use crate::model::execution::{FailureKind, ResultSummary};
    use crate::model::lineage::{Lineage, RepairTrigger};
    use crate::model::execution::ExecutionFailure;
    use crate::model::transcript::Round;
    use chrono::Utc;
    use uuid::Uuid;

    fn ok() -> ExecutionResult {
        ExecutionResult::Success(ResultSummary {
            row_count: 1,
            columns: vec![],
            sample_rows: vec![],
            truncated: false,
            payload_bytes: 0,
            elapsed_ms: 1,
        })
    }

    fn entry(agent: &str, sql: &str, result: ExecutionResult, verdicts: &[(&str, CritiqueVerdict)]) -> RoundEntry {
        let c = Candidate::seed(&AgentId::new(agent), 0, CandidateBody::sql(sql), "");
        let id = c.id;
        let mut lineage = Lineage::start(c, None);
        lineage.record_execution(result).unwrap();
        let critiques = verdicts
            .iter()
            .map(|(critic, v)| Critique::new(&AgentId::new(critic), id, *v, "r"))
            .collect();
        RoundEntry::new(lineage, critiques)
    }

    fn transcript(entries: Vec<RoundEntry>) -> Transcript {
        let round = Round::close(0, entries, vec![], 0, Utc::now());
        Transcript::from_rounds(Uuid::new_v4(), vec![round]).unwrap()
    }

    use CritiqueVerdict::{Accept, Reject, Revise};

    #[test]
    fn test_empty_transcript_is_no_consensus() {
        let verdict = decide(&Transcript::new(Uuid::new_v4()));
        assert!(verdict.is_no_consensus());
    }

    #[test]
    fn test_majority_wins() {
        let t = transcript(vec![
            entry("a", "SELECT 1", ok(), &[("x", Accept), ("y", Accept)]),
            entry("b", "SELECT 2", ok(), &[("x", Accept), ("y", Reject)]),
        ]);
        let verdict = decide(&t);
        assert_eq!(verdict.chosen().unwrap().author().as_str(), "a");
        assert_eq!(verdict.tie_break(), Some(TieBreakReason::Majority));
    }

    #[test]
    fn test_semantic_duplicates_pool_votes() {
        let t = transcript(vec![
            entry("a", "select  COUNT(*) from t;", ok(), &[("x", Accept)]),
            entry("b", "SELECT count(*) FROM t", ok(), &[("y", Accept)]),
            entry("c", "SELECT 2", ok(), &[("x", Accept)]),
        ]);
        let verdict = decide(&t);
        let tally = verdict.tally();
        assert_eq!(tally.len(), 2);
        assert_eq!(tally[0].accepts, 2);
        assert_eq!(tally[0].creators.len(), 2);
        assert_eq!(verdict.tie_break(), Some(TieBreakReason::Majority));
    }

    #[test]
    fn test_tie_prefers_successful_execution() {
        let failed = ExecutionResult::Failure(ExecutionFailure::new(FailureKind::EngineError, "boom"));
        let t = transcript(vec![
            entry("a", "SELECT 1", failed, &[("x", Accept)]),
            entry("b", "SELECT 2", ok(), &[("y", Accept)]),
        ]);
        let verdict = decide(&t);
        assert_eq!(verdict.chosen().unwrap().author().as_str(), "b");
        assert_eq!(verdict.tie_break(), Some(TieBreakReason::ExecutionSucceeded));
    }

    #[test]
    fn test_tie_prefers_fewer_repairs() {
        let seed = Candidate::seed(&AgentId::new("a"), 0, CandidateBody::sql("SELECT bad"), "");
        let mut lineage = Lineage::start(seed.clone(), None);
        let failure = ExecutionResult::failure(FailureKind::SchemaMismatch, "no column");
        lineage.record_execution(failure.clone()).unwrap();
        lineage.transition(crate::model::lineage::LineageState::Repairing).unwrap();
        let repaired = Candidate::repair_of(&seed, 0, CandidateBody::sql("SELECT 1"), "fixed");
        let rid = repaired.id;
        lineage
            .push_repair(
                repaired,
                RepairTrigger::Execution {
                    statement: Some("SELECT bad".into()),
                    failure: failure.as_failure().cloned().unwrap(),
                },
            )
            .unwrap();
        lineage.record_execution(ok()).unwrap();
        let repaired_entry = RoundEntry::new(lineage, vec![Critique::accept(&AgentId::new("x"), rid, "ok")]);

        let t = transcript(vec![repaired_entry, entry("b", "SELECT 2", ok(), &[("y", Accept)])]);
        let verdict = decide(&t);
        assert_eq!(verdict.chosen().unwrap().author().as_str(), "b");
        assert_eq!(verdict.tie_break(), Some(TieBreakReason::FewerRepairs));
    }

    #[test]
    fn test_full_tie_uses_agent_id() {
        let t = transcript(vec![
            entry("zeta", "SELECT 1", ok(), &[("x", Accept), ("y", Revise)]),
            entry("alpha", "SELECT 2", ok(), &[("x", Revise), ("y", Accept)]),
        ]);
        let verdict = decide(&t);
        assert_eq!(verdict.chosen().unwrap().author().as_str(), "alpha");
        assert_eq!(verdict.tie_break(), Some(TieBreakReason::AgentIdOrder));
    }

    #[test]
    fn test_zero_accepts_is_no_consensus() {
        let t = transcript(vec![
            entry("a", "SELECT 1", ok(), &[("x", Reject)]),
            entry("b", "SELECT 2", ok(), &[("y", Revise)]),
        ]);
        match decide(&t) {
            Verdict::NoConsensus(n) => {
                assert_eq!(n.rounds, 1);
                assert!(!n.earlier_accepts);
                assert_eq!(n.tally.len(), 2);
            }
            other => panic!("expected no consensus, got {}", other),
        }
    }

    #[test]
    fn test_decide_is_deterministic() {
        let t = transcript(vec![
            entry("b", "SELECT 2", ok(), &[("x", Accept)]),
            entry("a", "SELECT 1", ok(), &[("y", Accept)]),
        ]);
        let first = decide(&t);
        for _ in 0..10 {
            assert_eq!(decide(&t), first);
        }
    }
}
