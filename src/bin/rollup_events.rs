//! # Event Rollup Driver
//!
//! Reads newline-delimited JSON events, stores each one and rolls it up into the
//! hourly counters.
//!
//! ## Usage
//!
//! ```
//! # Ingest a file of events
//! cargo run --bin rollup_events -- events.ndjson
//!
//! # Ingest from stdin, giving up on a conflicting rollup after 3 attempts
//! cat events.ndjson | cargo run --bin rollup_events -- --max-attempts 3
//! ```
//!
//! Each line looks like
//! `{"title": "..", "country": "USA", "time": "2025-11-01T10:05:00Z", "entities": [{"name": "NASA", "type": "ORG"}]}`.
//! Blank lines are skipped. Database settings come from the environment (`DATABASE_PATH`,
//! `STORE_TIMEOUT_MS`, `ROLLUP_MAX_ATTEMPTS`, ...).

use anyhow::{Context, Result};
use atlas::config::AtlasConfig;
use atlas::db::Database;
use atlas::ingest::{ingest_event, IngestOutcome};
use atlas::model::Event;
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Parser)]
#[clap(name = "rollup-events", about = "Store and roll up newline-delimited JSON events")]
struct Cli {
    /// File to read events from (stdin when omitted)
    input: Option<PathBuf>,

    /// Attempts per event before a conflicting rollup is given up on
    #[clap(short, long)]
    max_attempts: Option<u32>,
}

#[derive(Debug, Default)]
struct Summary {
    applied: usize,
    dropped: usize,
    failed: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    atlas::logging::configure_logging();

    let args = Cli::parse();
    let config = AtlasConfig::from_env();
    let max_attempts = args.max_attempts.unwrap_or(config.rollup_max_attempts);

    let db = Database::from_config(&config)
        .await
        .with_context(|| format!("opening database {}", config.database_path))?;

    let started = Instant::now();
    let summary = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            ingest_lines(&db, BufReader::new(file), max_attempts).await?
        }
        None => ingest_lines(&db, BufReader::new(tokio::io::stdin()), max_attempts).await?,
    };

    info!(
        "Processed {} events in {:?}",
        summary.applied + summary.dropped + summary.failed,
        started.elapsed()
    );
    println!(
        "applied: {}, dropped: {}, failed: {}",
        summary.applied, summary.dropped, summary.failed
    );

    Ok(())
}

async fn ingest_lines<R>(db: &Database, reader: R, max_attempts: u32) -> Result<Summary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = Summary::default();
    let mut lines = reader.lines();
    let mut line_number = 0;

    while let Some(line) = lines.next_line().await.context("reading events")? {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: Event = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Line {}: dropping unparseable event: {}", line_number, e);
                summary.dropped += 1;
                continue;
            }
        };

        match ingest_event(db, &event, max_attempts).await {
            Ok(IngestOutcome::Applied(_)) => summary.applied += 1,
            Ok(IngestOutcome::Dropped(_)) => summary.dropped += 1,
            Err(e) => {
                error!("Line {}: failed to roll up '{}': {}", line_number, event.title, e);
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}
