//! Glint - asset enrichment worker.
//!
//! A long-running loop that leases image assets from a shared SQLite
//! queue, enriches them through a vision-language model, and commits
//! captions, grounded tags, embeddings, and filename aliases back to the
//! store.
//!
//! # Usage
//!
//! ```bash
//! # Run against the default local station and database
//! glint
//!
//! # Point at a different database with debug logging
//! GLINT_DB_PATH=/srv/app/data/app.sqlite3 glint --verbose
//! ```
//!
//! All pipeline knobs are `GLINT_*` environment variables; see
//! [`glint_core::Config`].

use clap::Parser;

mod logging;

/// Glint - asset enrichment worker for captions, tags, and embeddings.
#[derive(Parser, Debug)]
#[command(name = "glint")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json_logs: bool,

    /// Override the SQLite database path (defaults to GLINT_DB_PATH)
    #[arg(long, value_name = "PATH")]
    db: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.json_logs);

    let mut config = glint_core::Config::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    tracing::debug!("glint v{}", glint_core::VERSION);

    let worker = glint_core::Worker::new(config)?;
    // Runs until the process is terminated; only failures outside the job
    // body (e.g. an unopenable database) land here.
    worker.run().await?;
    Ok(())
}
