//! Deterministic bias analysis over a debate's arguments.
//!
//! Every proposal rationale and critique rationale is scored against a
//! fixed set of bias patterns (keyword hits plus pattern-specific
//! detectors). Scores roll up into per-agent profiles, fairness
//! violations, debate-wide scores, and recommendations. No model is
//! consulted; the same transcript always yields the same report.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::candidate::AgentId;
use crate::model::transcript::Transcript;

/// Default fairness threshold; arguments scoring above `1 - threshold`
/// are violations.
pub const DEFAULT_FAIRNESS_THRESHOLD: f64 = 0.85;

const EXCERPT_CHARS: usize = 200;

/// Minimum pattern score that counts as a detection.
const DETECTION_FLOOR: f64 = 0.1;

/// Known bias patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasPattern {
    Confirmation,
    Anchoring,
    Availability,
    Demographic,
    Sample,
    Temporal,
}

impl BiasPattern {
    pub const ALL: [BiasPattern; 6] = [
        Self::Confirmation,
        Self::Anchoring,
        Self::Availability,
        Self::Demographic,
        Self::Sample,
        Self::Temporal,
    ];

    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            Self::Confirmation => &["confirms", "validates", "supports my view", "as expected", "obviously"],
            Self::Anchoring => &["initial data shows", "first analysis", "starting point", "baseline"],
            Self::Availability => &["recently", "just happened", "current trend", "latest"],
            Self::Demographic => &["urban vs rural", "age group", "gender", "ethnicity", "location"],
            Self::Sample => &["small sample", "limited data", "subset", "not representative"],
            Self::Temporal => &["seasonal", "temporary", "one-time event", "anomaly"],
        }
    }

    /// Upper bound a single argument can score for this pattern (0–1).
    pub fn severity(self) -> f64 {
        match self {
            Self::Confirmation => 0.7,
            Self::Anchoring => 0.6,
            Self::Availability => 0.5,
            Self::Demographic => 0.9,
            Self::Sample => 0.8,
            Self::Temporal => 0.6,
        }
    }

    pub fn category(self) -> &'static str {
        match self {
            Self::Confirmation | Self::Anchoring | Self::Availability => "cognitive",
            Self::Demographic => "fairness",
            Self::Sample => "statistical",
            Self::Temporal => "temporal",
        }
    }
}

impl std::fmt::Display for BiasPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirmation => write!(f, "confirmation_bias"),
            Self::Anchoring => write!(f, "anchoring_bias"),
            Self::Availability => write!(f, "availability_bias"),
            Self::Demographic => write!(f, "demographic_bias"),
            Self::Sample => write!(f, "sample_bias"),
            Self::Temporal => write!(f, "temporal_bias"),
        }
    }
}

const CONFIRMATION_PHRASES: &[&str] = &[
    "this proves",
    "clearly shows",
    "confirms our hypothesis",
    "as we suspected",
    "validates our approach",
    "supports our view",
];

const COUNTER_WORDS: &[&str] = &["however", "but", "although", "despite", "alternatively"];

static SAMPLE_ISSUES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b\d+\s*samples?\b",
        r"(?i)\blimited\s+data\b",
        r"(?i)\bsmall\s+dataset\b",
        r"(?i)\bfew\s+cases\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

const DEMOGRAPHIC_TERMS: &str =
    "urban|rural|city|suburban|young|old|elderly|millennials?|male|female|men|women";

static DEMOGRAPHIC_GENERALIZATIONS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        format!(r"(?i)\b(all|most|many)\s+({})\b", DEMOGRAPHIC_TERMS),
        format!(r"(?i)\b({})\s+(always|never|typically)\b", DEMOGRAPHIC_TERMS),
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

fn confirmation_signal(text: &str) -> f64 {
    let phrases = CONFIRMATION_PHRASES.iter().filter(|p| text.contains(*p)).count() as f64 * 0.15;
    let hedged = text
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| COUNTER_WORDS.contains(&word));
    let unhedged = if hedged { 0.0 } else { 0.1 };
    (phrases + unhedged).min(0.6)
}

fn sample_signal(text: &str) -> f64 {
    (SAMPLE_ISSUES.iter().filter(|re| re.is_match(text)).count() as f64 * 0.2).min(0.5)
}

fn demographic_signal(text: &str) -> f64 {
    (DEMOGRAPHIC_GENERALIZATIONS.iter().filter(|re| re.is_match(text)).count() as f64 * 0.3).min(0.8)
}

/// Score one argument: the combined bias score (0–1) and the patterns
/// detected in it.
pub fn score_argument(text: &str) -> (f64, Vec<BiasPattern>) {
    let text = text.to_lowercase();
    let mut total = 0.0;
    let mut detected = Vec::new();
    for pattern in BiasPattern::ALL {
        let keywords = pattern.keywords().iter().filter(|k| text.contains(*k)).count() as f64;
        let mut score = keywords * pattern.severity() * 0.2;
        score += match pattern {
            BiasPattern::Confirmation => confirmation_signal(&text),
            BiasPattern::Sample => sample_signal(&text),
            BiasPattern::Demographic => demographic_signal(&text),
            _ => 0.0,
        };
        if score > DETECTION_FLOOR {
            detected.push(pattern);
            total += score.min(pattern.severity());
        }
    }
    (total.min(1.0), detected)
}

/// One piece of reasoning attributed to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub agent: AgentId,
    pub round: u32,
    pub text: String,
}

/// Proposal and critique rationales in transcript order. Empty texts are
/// skipped, and an agent repeating the same text (a carried candidate)
/// counts once.
pub fn arguments(transcript: &Transcript) -> Vec<Argument> {
    let mut seen: HashSet<(AgentId, String)> = HashSet::new();
    let mut out = Vec::new();
    let mut push = |agent: &AgentId, round: u32, text: &str| {
        let text = text.trim();
        if text.is_empty() || !seen.insert((agent.clone(), text.to_string())) {
            return;
        }
        out.push(Argument {
            agent: agent.clone(),
            round,
            text: text.to_string(),
        });
    };
    for round in transcript.rounds() {
        for entry in &round.entries {
            for step in entry.lineage.steps() {
                push(step.candidate.author(), round.number, &step.candidate.rationale);
            }
            for critique in &entry.critiques {
                push(&critique.critic, round.number, &critique.rationale);
            }
        }
    }
    out
}

/// Accumulated bias for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentBiasProfile {
    pub total_score: f64,
    pub arguments: usize,
    /// Patterns detected, one per detection.
    pub patterns: Vec<BiasPattern>,
}

impl AgentBiasProfile {
    pub fn mean_score(&self) -> f64 {
        if self.arguments == 0 {
            0.0
        } else {
            self.total_score / self.arguments as f64
        }
    }
}

/// An argument whose score crossed the fairness threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairnessViolation {
    pub agent: AgentId,
    pub round: u32,
    pub excerpt: String,
    pub score: f64,
    pub patterns: Vec<BiasPattern>,
}

/// Debate-wide bias analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasReport {
    /// Mean argument score (0–1).
    pub overall_bias: f64,
    /// `1 - coefficient of variation` of per-agent argument counts (0–1).
    pub balance: f64,
    /// Length spread and vocabulary distinctness across agents (0–1).
    pub diversity: f64,
    pub fairness_threshold: f64,
    pub violations: Vec<FairnessViolation>,
    pub profiles: BTreeMap<AgentId, AgentBiasProfile>,
    pub recommendations: Vec<String>,
}

impl BiasReport {
    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }
}

/// Population mean and standard deviation.
fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

fn excerpt(text: &str) -> String {
    if text.chars().count() > EXCERPT_CHARS {
        let head: String = text.chars().take(EXCERPT_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

/// Scores debates against a fairness threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasAnalyzer {
    fairness_threshold: f64,
}

impl Default for BiasAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_FAIRNESS_THRESHOLD)
    }
}

impl BiasAnalyzer {
    pub fn new(fairness_threshold: f64) -> Self {
        Self {
            fairness_threshold: fairness_threshold.clamp(0.0, 1.0),
        }
    }

    pub fn analyze(&self, transcript: &Transcript) -> BiasReport {
        self.analyze_arguments(&arguments(transcript))
    }

    pub fn analyze_arguments(&self, arguments: &[Argument]) -> BiasReport {
        let mut profiles: BTreeMap<AgentId, AgentBiasProfile> = BTreeMap::new();
        let mut violations = Vec::new();
        let mut total = 0.0;

        for arg in arguments {
            let (score, patterns) = score_argument(&arg.text);
            total += score;
            let profile = profiles.entry(arg.agent.clone()).or_default();
            profile.total_score += score;
            profile.arguments += 1;
            profile.patterns.extend(patterns.iter().copied());
            if score > 1.0 - self.fairness_threshold {
                violations.push(FairnessViolation {
                    agent: arg.agent.clone(),
                    round: arg.round,
                    excerpt: excerpt(&arg.text),
                    score,
                    patterns,
                });
            }
        }

        let overall_bias = if arguments.is_empty() {
            0.0
        } else {
            total / arguments.len() as f64
        };
        let balance = balance(&profiles);
        let diversity = diversity(arguments);
        let recommendations = recommendations(overall_bias, &violations, &profiles);

        BiasReport {
            overall_bias,
            balance,
            diversity,
            fairness_threshold: self.fairness_threshold,
            violations,
            profiles,
            recommendations,
        }
    }
}

fn balance(profiles: &BTreeMap<AgentId, AgentBiasProfile>) -> f64 {
    if profiles.len() < 2 {
        return 0.0;
    }
    let counts: Vec<f64> = profiles.values().map(|p| p.arguments as f64).collect();
    let (mean, std) = mean_std(&counts);
    if mean == 0.0 {
        return 0.0;
    }
    (1.0 - std / mean).max(0.0)
}

fn diversity(arguments: &[Argument]) -> f64 {
    if arguments.len() < 2 {
        return 0.0;
    }
    let lengths: Vec<f64> = arguments
        .iter()
        .map(|a| a.text.split_whitespace().count() as f64)
        .collect();
    let (mean, std) = mean_std(&lengths);
    let length_diversity = if mean > 0.0 { (std / mean).min(1.0) } else { 0.0 };

    let mut vocabularies: BTreeMap<&AgentId, BTreeSet<String>> = BTreeMap::new();
    for arg in arguments {
        vocabularies
            .entry(&arg.agent)
            .or_default()
            .extend(arg.text.to_lowercase().split_whitespace().map(str::to_string));
    }
    let vocab: Vec<&BTreeSet<String>> = vocabularies.values().collect();
    let mut overlaps = Vec::new();
    for (i, a) in vocab.iter().enumerate() {
        for b in &vocab[i + 1..] {
            let union = a.union(b).count();
            let shared = a.intersection(b).count();
            overlaps.push(if union == 0 { 0.0 } else { shared as f64 / union as f64 });
        }
    }
    let vocab_diversity = if overlaps.is_empty() {
        0.0
    } else {
        1.0 - mean_std(&overlaps).0
    };

    length_diversity * 0.3 + vocab_diversity * 0.7
}

fn recommendations(
    overall_bias: f64,
    violations: &[FairnessViolation],
    profiles: &BTreeMap<AgentId, AgentBiasProfile>,
) -> Vec<String> {
    let mut out = Vec::new();
    if overall_bias > 0.3 {
        out.push("High bias detected; gather additional evidence and cross-validate the result.".to_string());
    }
    if !violations.is_empty() {
        out.push(format!(
            "{} fairness violation(s); review the flagged arguments for demographic or statistical bias.",
            violations.len()
        ));
    }
    let counts: Vec<usize> = profiles.values().map(|p| p.arguments).collect();
    if let (Some(max), Some(min)) = (counts.iter().max(), counts.iter().min()) {
        if counts.len() > 1 && *max > 2 * *min {
            out.push("Unbalanced participation; give less active agents more room to respond.".to_string());
        }
    }
    let mut frequency: BTreeMap<BiasPattern, usize> = BTreeMap::new();
    for profile in profiles.values() {
        for pattern in &profile.patterns {
            *frequency.entry(*pattern).or_default() += 1;
        }
    }
    let common: Vec<String> = frequency
        .iter()
        .filter(|(_, n)| **n > profiles.len())
        .map(|(p, _)| p.to_string())
        .collect();
    if !common.is_empty() {
        out.push(format!(
            "Recurring bias patterns: {}; require explicit counter-arguments.",
            common.join(", ")
        ));
    }
    if out.is_empty() {
        out.push("Bias within acceptable thresholds.".to_string());
    }
    out
}
