//! # passline CLI
//!
//! The `passline` binary drives the analysis pipeline: ingest source
//! artifacts, run every configured pass over them, and inspect the results.
//!
//! ## Usage
//!
//! ```bash
//! passline --config ./config/passline.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `passline init` | Create the SQLite database and run schema migrations |
//! | `passline ingest` | Scan the ingest root and upsert analysis records |
//! | `passline passes` | Show the configured pass order |
//! | `passline run` | Run missing passes for every pending record |
//! | `passline status` | Record counts, per-pass completion, scores |
//! | `passline show <path>` | One record with its results and scores |
//! | `passline forget <path>` | Delete a record and everything derived from it |
//!
//! ## Examples
//!
//! ```bash
//! passline init
//! passline ingest --dry-run
//! passline ingest
//! passline run --dry-run
//! passline run --concurrency 4 --limit 100
//! passline show app/Models/User.php --json
//! ```
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `passline=info`).

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use passline::backend::Backends;
use passline::config;
use passline::db;
use passline::ingest;
use passline::migrate;
use passline::progress::ProgressMode;
use passline::registry;
use passline::runner::{self, BatchRunner, RunOptions};
use passline::show;
use passline::status;
use passline::store::SqliteStore;

/// passline: multi-pass analysis over source artifacts.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/passline.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "passline",
    about = "passline: resumable multi-pass analysis of source artifacts",
    version,
    long_about = "passline stores one record per source artifact, runs an ordered set of \
    analysis passes over each record (AI completions or static analysis tools), persists \
    every result, and derives numeric quality scores from a designated scoring pass."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/passline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Scan the ingest root and create or refresh analysis records.
    ///
    /// Changed files get their source refreshed; completed passes are kept.
    Ingest {
        /// List the artifacts that would be ingested without writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the configured passes in execution order.
    Passes,

    /// Run the missing passes of every pending record.
    ///
    /// Safe to interrupt and re-run: completed passes are never repeated.
    Run {
        /// Report what would run without calling any backend or writing.
        #[arg(long)]
        dry_run: bool,

        /// Records processed at once (defaults to `runner.concurrency`).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Process at most this many pending records.
        #[arg(long)]
        limit: Option<usize>,

        /// Progress on stderr. Defaults to human when stderr is a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show record counts, per-pass completion, and score averages.
    Status,

    /// Show one record with its pass results and scores.
    Show {
        /// Artifact path relative to the ingest root.
        path: String,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete a record together with its results and scores.
    Forget {
        /// Artifact path relative to the ingest root.
        path: String,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("passline=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { dry_run } => {
            ingest::run_ingest(&cfg, dry_run).await?;
        }
        Commands::Passes => {
            registry::list_passes(&cfg)?;
        }
        Commands::Run {
            dry_run,
            concurrency,
            limit,
            progress,
            json,
        } => {
            let mut options = RunOptions::from_config(&cfg);
            options.dry_run = dry_run;
            options.limit = limit;
            if let Some(c) = concurrency {
                if c == 0 {
                    anyhow::bail!("--concurrency must be >= 1");
                }
                options.concurrency = c;
            }
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);

            let pool = db::connect(&cfg).await?;
            let store = Arc::new(SqliteStore::new(pool.clone()));
            let runner = BatchRunner::new(store, Backends::from_config(&cfg))
                .with_artifact_root(cfg.ingest.root.clone())
                .with_progress(progress.reporter());

            let shutdown = runner.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, finishing in-flight passes");
                    shutdown.store(true, Ordering::SeqCst);
                }
            });

            let report = runner.run_configured(&cfg, &options).await;
            pool.close().await;
            let report = report?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                runner::print_report(&report);
            }
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
        Commands::Show { path, json } => {
            show::run_show(&cfg, &path, json).await?;
        }
        Commands::Forget { path } => {
            show::run_forget(&cfg, &path).await?;
        }
    }

    Ok(())
}
