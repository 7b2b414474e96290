//! Per-round debate metrics derived from structured verdicts.

use serde::{Deserialize, Serialize};

use crate::model::transcript::RoundEntry;

/// Summary numbers for one closed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundMetrics {
    /// 1.0 (no objections) to 10.0 (every critique objects).
    pub conflict_intensity: f64,
    /// `1 - conflict_intensity / 10`.
    pub consensus_level: f64,
    /// Responses received over responses expected (0.0–1.0).
    pub participation_balance: f64,
    pub candidates: usize,
    pub critiques: usize,
    pub accepts: usize,
    pub abstentions: usize,
}

impl RoundMetrics {
    /// Compute metrics for a set of entries.
    ///
    /// `expected_responses` counts every propose and critique call the
    /// round issued; zero means "unknown" and yields full participation.
    pub fn compute(entries: &[RoundEntry], abstentions: usize, expected_responses: usize) -> Self {
        let critiques: usize = entries.iter().map(|e| e.critiques.len()).sum();
        let accepts: usize = entries.iter().map(|e| e.accepts()).sum();
        let objections = critiques - accepts;

        let conflict_intensity = if critiques == 0 {
            1.0
        } else {
            (1.0 + (objections as f64 / critiques as f64) * 9.0).min(10.0)
        };
        let consensus_level = 1.0 - conflict_intensity / 10.0;

        let participation_balance = if expected_responses == 0 {
            1.0
        } else {
            let responded = expected_responses.saturating_sub(abstentions);
            responded as f64 / expected_responses as f64
        };

        Self {
            conflict_intensity,
            consensus_level,
            participation_balance,
            candidates: entries.len(),
            critiques,
            accepts,
            abstentions,
        }
    }
}

impl Default for RoundMetrics {
    fn default() -> Self {
        Self::compute(&[], 0, 0)
    }
}

impl std::fmt::Display for RoundMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "conflict {:.1}/10, consensus {:.2}, participation {:.2} ({} candidates, {}/{} accepts, {} abstentions)",
            self.conflict_intensity,
            self.consensus_level,
            self.participation_balance,
            self.candidates,
            self.accepts,
            self.critiques,
            self.abstentions
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debate::critique::Critique;
    use crate::model::candidate::{AgentId, Candidate, CandidateBody};
    use crate::model::lineage::Lineage;

    fn entry_with(verdicts: &[&str]) -> RoundEntry {
        let c = Candidate::seed(&AgentId::new("p"), 0, CandidateBody::sql("SELECT 1"), "");
        let critiques = verdicts
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let critic = AgentId::new(&format!("c{}", i));
                match *v {
                    "accept" => Critique::accept(&critic, c.id, ""),
                    "reject" => Critique::reject(&critic, c.id, ""),
                    _ => Critique::revise(&critic, c.id, ""),
                }
            })
            .collect();
        RoundEntry::new(Lineage::start(c, None), critiques)
    }

    #[test]
    fn test_all_accepts_is_low_conflict() {
        let m = RoundMetrics::compute(&[entry_with(&["accept", "accept"])], 0, 3);
        assert_eq!(m.conflict_intensity, 1.0);
        assert!((m.consensus_level - 0.9).abs() < 1e-9);
        assert_eq!(m.participation_balance, 1.0);
    }

    #[test]
    fn test_all_objections_is_max_conflict() {
        let m = RoundMetrics::compute(&[entry_with(&["reject", "revise"])], 0, 0);
        assert_eq!(m.conflict_intensity, 10.0);
        assert_eq!(m.consensus_level, 0.0);
    }

    #[test]
    fn test_participation_counts_abstentions() {
        let m = RoundMetrics::compute(&[entry_with(&["accept"])], 1, 4);
        assert!((m.participation_balance - 0.75).abs() < 1e-9);
        assert_eq!(m.abstentions, 1);
    }

    #[test]
    fn test_empty_round_defaults() {
        let m = RoundMetrics::default();
        assert_eq!(m.candidates, 0);
        assert_eq!(m.conflict_intensity, 1.0);
    }
}
