//! Prompt assembly for LLM-backed agents.

use crate::agent::llm::Persona;
use crate::agent::AgentContext;
use crate::debate::consensus::Verdict;
use crate::model::candidate::Candidate;
use crate::model::execution::{ExecutionResult, ResultSummary};

/// Rows of a result sample shown to a model.
const PROMPT_SAMPLE_ROWS: usize = 10;

pub fn system_prompt(persona: Persona) -> &'static str {
    match persona {
        Persona::DataDetective => {
            r#"You are the Data Detective of an analysis council. You translate business
questions into a single read-only SQL query over the schema you are given.
Only use tables and columns that appear in the schema. Never write data:
no INSERT, UPDATE, DELETE, MERGE, DDL or multiple statements.
When you are told a previous attempt failed, fix that specific problem and
do not resubmit the same statement."#
        }
        Persona::Optimist => {
            r#"You are the Optimist Analyst of an analysis council. You review proposed
queries looking for what they get right: whether they capture growth,
improvement and positive signals the question asks about. Accept a query
that answers the question; ask for a revision only when it misses something
material."#
        }
        Persona::Pessimist => {
            r#"You are the Pessimist Critic of an analysis council. You review proposed
queries hunting for risk: wrong joins, missing filters, double counting,
NULL handling, misleading aggregates, and results that hide declines or
anomalies. Reject queries that answer a different question."#
        }
        Persona::EthicalAuditor => {
            r#"You are the Ethical Auditor of an analysis council. You examine a result
set that contains demographic attributes for unfair treatment, systematic
bias or inequitable outcomes across groups. Report concrete concerns only;
if none are material, say so."#
        }
        Persona::SynthesisModerator => {
            r#"You are the Synthesis Moderator of an analysis council. You integrate the
debate into one balanced answer: state the chosen query's finding, where
reviewers agreed and disagreed, and the practical takeaway."#
        }
    }
}

fn question_block(ctx: &AgentContext) -> String {
    format!(
        "## Question\n\n{}\n\n## Schema\n\n```sql\n{}```\n",
        ctx.question.text,
        ctx.schema.to_ddl()
    )
}

/// Prompt asking for a SQL proposal (or a repair of `ctx.parent`).
pub fn proposal_prompt(ctx: &AgentContext, output_schema: &str) -> String {
    let mut prompt = question_block(ctx);

    if let (Some(parent), Some(hint)) = (&ctx.parent, &ctx.hint) {
        prompt.push_str("\n## Previous attempt\n\n");
        if let Some(sql) = parent.sql() {
            prompt.push_str(&format!("```sql\n{}\n```\n", sql));
        }
        prompt.push_str(&format!("\n## What went wrong\n\n{}\n", hint.describe()));
        prompt.push_str("\nReturn a corrected query. Do not repeat the previous statement.\n");
    }

    prompt.push_str(&format!(
        "\n## Output\n\nRespond with one JSON object matching this schema:\n\n```json\n{}\n```\n",
        output_schema
    ));
    prompt
}

fn render_summary(summary: &ResultSummary) -> String {
    let cols: Vec<String> = summary
        .columns
        .iter()
        .map(|c| format!("{} {}", c.name, c.data_type))
        .collect();
    let rows: Vec<String> = summary
        .sample_rows
        .iter()
        .take(PROMPT_SAMPLE_ROWS)
        .map(|r| serde_json::Value::Array(r.clone()).to_string())
        .collect();
    format!(
        "{} rows{}; columns: {}\n{}",
        summary.row_count,
        if summary.truncated { " (sample truncated)" } else { "" },
        cols.join(", "),
        rows.join("\n")
    )
}

fn render_execution(execution: Option<&ExecutionResult>) -> String {
    match execution {
        Some(ExecutionResult::Success(s)) => render_summary(s),
        Some(ExecutionResult::Failure(f)) => format!("Execution failed: {}", f),
        None => "Not executed.".to_string(),
    }
}

/// Prompt asking for a critique of `candidate`.
pub fn critique_prompt(
    candidate: &Candidate,
    execution: Option<&ExecutionResult>,
    ctx: &AgentContext,
    output_schema: &str,
) -> String {
    format!(
        "{}\n## Candidate from {}\n\n{}\n\nRationale: {}\n\n## Execution\n\n{}\n\n## Output\n\nRespond with one JSON object matching this schema:\n\n```json\n{}\n```\nUse verdict \"accept\", \"revise\" or \"reject\".\n",
        question_block(ctx),
        candidate.author(),
        candidate.body,
        candidate.rationale,
        render_execution(execution),
        output_schema
    )
}

/// Prompt asking for the final narrative.
pub fn synthesis_prompt(verdict: &Verdict, ctx: &AgentContext) -> String {
    let mut prompt = question_block(ctx);
    match verdict {
        Verdict::Decided(d) => {
            prompt.push_str(&format!(
                "\n## Chosen candidate\n\n{}\n\n## Result\n\n{}\n\n## Tally\n\n",
                d.chosen.body,
                render_execution(d.execution.as_ref())
            ));
            for entry in &d.tally {
                prompt.push_str(&format!("- {}\n", entry));
            }
        }
        Verdict::NoConsensus(n) => {
            prompt.push_str(&format!("\n## Outcome\n\nNo consensus: {}\n", n.reason));
        }
    }
    if let Some(last) = ctx.history.last() {
        prompt.push_str("\n## Final round critiques\n\n");
        for entry in &last.entries {
            for c in &entry.critiques {
                prompt.push_str(&format!("- on {}'s candidate: {}\n", entry.author(), c));
            }
        }
    }
    prompt.push_str("\nWrite the synthesis as plain prose.\n");
    prompt
}

/// Prompt asking for a fairness audit.
pub fn audit_prompt(result: &ResultSummary, ctx: &AgentContext, output_schema: &str) -> String {
    format!(
        "{}\n## Result under audit\n\n{}\n\n## Output\n\nRespond with one JSON object matching this schema:\n\n```json\n{}\n```\n",
        question_block(ctx),
        render_summary(result),
        output_schema
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::candidate::{AgentId, CandidateBody};
    use crate::model::execution::{ExecutionFailure, FailureKind};
    use crate::model::lineage::RepairTrigger;
    use crate::model::question::{ColumnDef, Question, Schema};
    use std::sync::Arc;

    fn ctx() -> AgentContext {
        let schema = Schema::new().with_table("T", vec![ColumnDef::new("id", "INT64", false)]);
        AgentContext::new(Arc::new(Question::new("count rows in T")), Arc::new(schema))
    }

    #[test]
    fn test_proposal_prompt_fresh() {
        let p = proposal_prompt(&ctx(), "{}");
        assert!(p.contains("count rows in T"));
        assert!(p.contains("CREATE TABLE T"));
        assert!(!p.contains("Previous attempt"));
    }

    #[test]
    fn test_repair_prompt_carries_only_the_trigger() {
        let base = ctx();
        let parent = base.draft(&AgentId::new("d"), CandidateBody::sql("SELECT nope FROM T"), "");
        let trigger = RepairTrigger::Execution {
            statement: parent.sql().map(str::to_string),
            failure: ExecutionFailure::new(FailureKind::SchemaMismatch, "column nope not found"),
        };
        let p = proposal_prompt(&base.for_repair(&parent, trigger), "{}");
        assert!(p.contains("SELECT nope FROM T"));
        assert!(p.contains("schema_mismatch: column nope not found"));
        assert!(p.contains("Do not repeat"));
    }

    #[test]
    fn test_every_persona_has_prompt() {
        for persona in Persona::ALL {
            assert!(!system_prompt(persona).is_empty());
        }
    }
}
