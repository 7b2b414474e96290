//! Command line runner for the insight council.
//!
//! ```bash
//! # Ask one question against BigQuery
//! BQ_PROJECT_ID=acme BQ_DATASET_ID=sales BQ_ACCESS_TOKEN=... OPENAI_API_KEY=... \
//!     council-cli ask "Which region grew fastest last quarter?" --schema schema.json
//!
//! # Inspect stored transcripts
//! council-cli history --limit 5
//! council-cli show 3f9a1c0de2b47a55
//! ```

mod setup;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use insight_council::{
    CouncilConfig, CouncilOrchestrator, FileTranscriptStore, Question, TranscriptStore,
};
use setup::{BackendSettings, EngineKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding transcript files and the summary index
    #[arg(long, global = true, default_value = "./debate_logs")]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Debate one question and print the outcome as JSON
    Ask {
        question: String,

        /// JSON schema of the tables the council may query
        #[arg(long)]
        schema: PathBuf,

        /// TOML council configuration (COUNCIL_* variables override it)
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = EngineKind::Bigquery)]
        engine: EngineKind,

        /// Session the question belongs to
        #[arg(long)]
        session: Option<String>,

        /// Skip writing the transcript
        #[arg(long, default_value_t = false)]
        no_store: bool,
    },

    /// Print a stored transcript
    Show { id: String },

    /// List recently finished transcripts
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "insight_council=info,council_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = Arc::new(FileTranscriptStore::new(&cli.store));

    match cli.command {
        Command::Ask {
            question,
            schema,
            config,
            engine,
            session,
            no_store,
        } => {
            let config = CouncilConfig::load(config.as_deref()).context("loading council config")?;
            let schema = setup::load_schema(&schema)?;
            let council = setup::build_council(&BackendSettings::from_env())?;
            let engine = setup::build_engine(engine)?;

            let mut orchestrator =
                CouncilOrchestrator::new(config, council, engine).context("assembling council")?;
            if !no_store {
                orchestrator = orchestrator.with_store(store);
            }

            let mut question = Question::new(&question);
            if let Some(session) = session {
                question = question.with_session(&session);
            }

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted; deciding over closed rounds");
                    on_interrupt.cancel();
                }
            });

            match orchestrator.run_with_cancel(question, schema, cancel).await {
                Ok(outcome) => {
                    info!(id = %outcome.id, verdict = %outcome.verdict, stored = outcome.stored, "Council finished");
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                    Ok(())
                }
                Err(failure) => {
                    error!(id = %failure.id, phase = %failure.phase, reason = %failure.reason, "Council failed");
                    let partial = serde_json::json!({
                        "id": &failure.id,
                        "phase": &failure.phase,
                        "reason": &failure.reason,
                        "phases": &failure.phases,
                        "transcript": &failure.transcript,
                    });
                    println!("{}", serde_json::to_string_pretty(&partial)?);
                    Err(failure.into())
                }
            }
        }
        Command::Show { id } => {
            let record = store
                .load(&id)
                .await
                .with_context(|| format!("loading transcript {}", id))?;
            println!("{}", record.to_json()?);
            Ok(())
        }
        Command::History { limit } => {
            let summaries = store.list_recent(limit).await.context("reading summary index")?;
            for summary in summaries {
                println!("{}", serde_json::to_string(&summary)?);
            }
            Ok(())
        }
    }
}
