//! # Bizcard CLI (`bizcard`)
//!
//! The `bizcard` binary runs the pipeline and inspects its state.
//!
//! ## Usage
//!
//! ```bash
//! bizcard --config ./config/bizcard.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bizcard init` | Create the SQLite database and run schema migrations |
//! | `bizcard serve` | Start the upload API and every pipeline stage |
//! | `bizcard put <file>` | Store a file and enqueue it, without the HTTP API |
//! | `bizcard search "<query>"` | Search indexed cards |
//! | `bizcard get <image_id>` | Print an extracted record |
//! | `bizcard status` | Checkpoints, lag and counts per consumer group |
//! | `bizcard dead-letters` | List recent dead letters |
//!
//! Logging goes to stderr through `tracing`; set `RUST_LOG` to adjust
//! (default `info`).

use bizcard_pipeline::{config, get, migrate, pipeline, search, status};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Bizcard pipeline: uploaded business-card images in, searchable records out.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/bizcard.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "bizcard",
    about = "Bizcard pipeline: OCR ingestion of business-card images into a searchable index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/bizcard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all tables (records, documents,
    /// documents_fts, checkpoints, stream tables, dead_letters). Idempotent.
    Init,

    /// Run the upload API and all pipeline workers until Ctrl-C.
    Serve,

    /// Store a local file in object storage and enqueue it for extraction.
    Put {
        /// Image file to upload.
        file: PathBuf,

        /// Object key. Defaults to `<watcher.prefix><file name>`.
        #[arg(long)]
        key: Option<String>,
    },

    /// Search indexed business cards.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print the extracted record for an image id.
    Get {
        /// Image id (as returned by the upload API).
        image_id: String,
    },

    /// Show consumer checkpoints, lag and store counts.
    Status,

    /// List the most recent dead letters.
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            pipeline::run_serve(&cfg).await?;
        }
        Commands::Put { file, key } => {
            pipeline::run_put(&cfg, &file, key).await?;
        }
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &query, limit).await?;
        }
        Commands::Get { image_id } => {
            get::run_get(&cfg, &image_id).await?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
        Commands::DeadLetters { limit } => {
            status::run_dead_letters(&cfg, limit).await?;
        }
    }

    Ok(())
}
