//! CLI entry point — runs one query end-to-end against HTTP backends.
//!
//! ```bash
//! COMPLETION_ENDPOINT=http://localhost:8003/complete \
//! RETRIEVAL_ENDPOINT=http://localhost:8002/query \
//! deliberation "What is backpropagation?" --scope-id course-101
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use deliberation::{
    DeliberationConfig, Deliberation, DeliberationEvent, FileCheckpointStore,
    HttpCompletionClient, HttpRetrievalClient, Query,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The question to answer
    query: String,

    /// Knowledge-scope identifier to retrieve from
    #[arg(long)]
    scope_id: String,

    /// Session identifier (random if omitted)
    #[arg(long)]
    session_id: Option<String>,

    /// Maximum debate rounds
    #[arg(long, default_value_t = 3)]
    max_rounds: u32,

    /// Domain-specific instruction prefix for draft generation
    #[arg(long)]
    domain_instruction: Option<String>,

    /// Completion endpoint (overrides COMPLETION_ENDPOINT)
    #[arg(long)]
    completion_endpoint: Option<String>,

    /// Retrieval endpoint (overrides RETRIEVAL_ENDPOINT)
    #[arg(long)]
    retrieval_endpoint: Option<String>,

    /// Model name passed to the completion gateway
    #[arg(long, default_value = "tutor-large")]
    model: String,

    /// Directory for workflow checkpoints (disabled if omitted)
    #[arg(long)]
    checkpoint_dir: Option<std::path::PathBuf>,
}

fn endpoint(flag: Option<String>, env_var: &str) -> Result<String> {
    flag.or_else(|| std::env::var(env_var).ok())
        .with_context(|| format!("set {} or pass the matching flag", env_var))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let completion_endpoint = endpoint(args.completion_endpoint, "COMPLETION_ENDPOINT")?;
    let retrieval_endpoint = endpoint(args.retrieval_endpoint, "RETRIEVAL_ENDPOINT")?;

    let config = DeliberationConfig::default();
    let completion = Arc::new(HttpCompletionClient::new(
        &completion_endpoint,
        &args.model,
        config.completion_timeout_ms,
    ));
    let retrieval = Arc::new(HttpRetrievalClient::new(
        &retrieval_endpoint,
        config.retrieval_k,
        config.retrieval_timeout_ms,
    ));

    let mut engine = Deliberation::new(completion, retrieval, config);
    if let Some(dir) = args.checkpoint_dir {
        engine = engine.with_checkpoints(Arc::new(FileCheckpointStore::new(dir)));
    }

    let session_id = args
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut query = Query::new(&args.query, &args.scope_id, &session_id)
        .with_max_rounds(args.max_rounds);
    if let Some(instruction) = args.domain_instruction {
        query = query.with_domain_instruction(&instruction);
    }

    let (mut events, _cancel) = engine.process_query(query);
    while let Some(event) = events.recv().await {
        match event {
            DeliberationEvent::Progress {
                stage,
                status,
                round,
            } => info!(%stage, %status, round, "progress"),
            DeliberationEvent::Completed { answer } => {
                println!("{}", serde_json::to_string_pretty(&answer)?);
                return Ok(());
            }
            DeliberationEvent::Failed { message, answer } => {
                eprintln!("query failed: {}", message);
                println!("{}", serde_json::to_string_pretty(&answer)?);
                std::process::exit(1);
            }
        }
    }

    anyhow::bail!("event stream ended without a terminal event")
}
