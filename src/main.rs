//! # Requirements Harness CLI (`reqh`)
//!
//! ## Usage
//!
//! ```bash
//! reqh --config ./config/reqh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `reqh kb build <project> <docs.json>` | Build (or rebuild) a project knowledge base |
//! | `reqh kb add <project> <docs.json>` | Append new documents, skipping duplicates |
//! | `reqh kb query <project> "<text>"` | Top-k retrieval |
//! | `reqh kb status <project>` | Existence, version and chunk count |
//! | `reqh detect <input>` | Find conflicting requirements |
//! | `reqh serve` | Start the HTTP server |
//!
//! Logs go to stderr (`RUST_LOG` overrides the default `req_harness=info`);
//! results go to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use req_harness::config;
use req_harness::detect_cmd::{self, DetectArgs};
use req_harness::error::{classify, KbError};
use req_harness::kb_cmd;
use req_harness::server;

/// Requirements Harness: project knowledge bases and requirement conflict detection.
#[derive(Parser)]
#[command(name = "reqh", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "./config/reqh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage project knowledge bases.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },

    /// Detect conflicting requirements.
    ///
    /// Embeds the requirements, clusters them, and asks the configured LLM
    /// to check each cluster. Reports are exported to `--out` (or
    /// `[conflicts].output_dir`).
    Detect {
        /// JSON array of `{id, text}` objects, or a text file with one
        /// requirement per line.
        input: PathBuf,

        #[arg(long)]
        min_cluster_size: Option<usize>,

        /// Maximum requirements per LLM call.
        #[arg(long)]
        max_batch: Option<usize>,

        /// Cosine similarity above which cluster members count as duplicates.
        #[arg(long)]
        similarity_threshold: Option<f32>,

        /// Tag a sample of requirements with categories.
        #[arg(long)]
        tags: bool,

        #[arg(long)]
        out: Option<PathBuf>,

        /// JSON report on stdout, JSON progress on stderr.
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum KbAction {
    /// Build a knowledge base from a JSON document list. Replaces any existing one.
    Build { project_id: String, docs: PathBuf },
    /// Add documents to an existing knowledge base.
    Add { project_id: String, docs: PathBuf },
    Query {
        project_id: String,
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
    },
    Status { project_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("req_harness=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            match classify(&e) {
                Some(KbError::BadInput(_)) => ExitCode::from(2),
                Some(KbError::NotFound(_)) => ExitCode::from(3),
                Some(KbError::DependencyUnavailable(..)) => ExitCode::from(4),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Kb { action } => match action {
            KbAction::Build { project_id, docs } => {
                kb_cmd::run_kb_build(&cfg, &project_id, &docs).await?;
            }
            KbAction::Add { project_id, docs } => {
                kb_cmd::run_kb_add(&cfg, &project_id, &docs).await?;
            }
            KbAction::Query {
                project_id,
                query,
                top_k,
            } => {
                kb_cmd::run_kb_query(&cfg, &project_id, &query, top_k).await?;
            }
            KbAction::Status { project_id } => {
                kb_cmd::run_kb_status(&cfg, &project_id)?;
            }
        },
        Commands::Detect {
            input,
            min_cluster_size,
            max_batch,
            similarity_threshold,
            tags,
            out,
            json,
        } => {
            let args = DetectArgs {
                min_cluster_size,
                max_batch,
                similarity_threshold,
                tags,
                out,
                json,
            };
            detect_cmd::run_detect(&cfg, &input, args).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
