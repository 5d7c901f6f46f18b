//! # docrag CLI
//!
//! ## Usage
//!
//! ```bash
//! docrag --config ./config/docrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docrag init` | Create the SQLite database and run schema migrations |
//! | `docrag upload <file> --owner <id>` | Stage a file and queue it for ingestion |
//! | `docrag worker [--drain]` | Process queued ingestion jobs |
//! | `docrag status <doc-id>` | Show a document's status and audit trail |
//! | `docrag ask "<question>" --owner <id>` | Stream a grounded answer as SSE frames |
//! | `docrag feedback ...` | Record feedback on an answer |
//! | `docrag serve` | Start the HTTP server |

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docrag::feedback::FeedbackRequest;
use docrag::{chat, config, feedback, migrate, server, status, upload, worker};

#[derive(Parser)]
#[command(
    name = "docrag",
    about = "docrag: document ingestion with PII redaction and streamed RAG answers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docrag.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Stage a file and queue it for ingestion.
    Upload {
        /// File to upload.
        file: PathBuf,

        /// Owner of the document.
        #[arg(long)]
        owner: String,
    },

    /// Consume ingestion jobs from the queue.
    Worker {
        /// Exit once the queue is empty instead of polling.
        #[arg(long)]
        drain: bool,
    },

    /// Show a document's status, metadata, and audit trail.
    Status {
        /// Document UUID.
        id: String,
    },

    /// Ask a question against an owner's documents.
    Ask {
        question: String,

        #[arg(long)]
        owner: String,
    },

    /// Record feedback on a generated answer.
    #[command(group(ArgGroup::new("verdict").required(true).args(["positive", "negative"])))]
    Feedback {
        #[arg(long)]
        owner: String,

        /// Client-side identifier of the answered message.
        #[arg(long)]
        message_id: String,

        #[arg(long)]
        positive: bool,

        #[arg(long)]
        negative: bool,

        #[arg(long)]
        comment: Option<String>,

        /// Prompt version to record (defaults to `[chat].prompt_version`).
        #[arg(long)]
        prompt_version: Option<String>,

        /// Model to record (defaults to the configured generation model).
        #[arg(long)]
        model: Option<String>,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Upload { file, owner } => {
            upload::run_upload(&cfg, &file, &owner).await?;
        }
        Commands::Worker { drain } => {
            worker::run_worker_command(&cfg, drain).await?;
        }
        Commands::Status { id } => {
            status::run_status(&cfg, &id).await?;
        }
        Commands::Ask { question, owner } => {
            chat::run_ask(&cfg, &question, &owner).await?;
        }
        Commands::Feedback {
            owner,
            message_id,
            positive,
            negative: _,
            comment,
            prompt_version,
            model,
        } => {
            let request = FeedbackRequest {
                message_id,
                is_positive: positive,
                comment,
                prompt_version,
                model_used: model,
            };
            feedback::run_feedback(&cfg, &owner, request).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
