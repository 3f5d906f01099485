use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use paddock_extract::load_event_file;
use paddock_fetch::{ApiClient, HttpDetailClient, RequestGate};
use paddock_store::{MemoryEntityStore, PgEntityStore};
use paddock_sync::{build_pipeline, CategoryOutcome, SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "paddock")]
#[command(about = "Discover racing entities from event payloads and keep them stored")]
struct Cli {
    /// Print the run summary as JSON instead of one line per category.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline over event payload files already on disk.
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Resolve and enrich against an empty in-memory store; nothing is written.
        #[arg(long)]
        dry_run: bool,
    },
    /// Fetch the results listing for a date range and run the pipeline over it.
    Sync {
        #[arg(long)]
        start_date: NaiveDate,
        #[arg(long)]
        end_date: NaiveDate,
    },
    /// Create the entity tables if they do not exist.
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let summary = match cli.command {
        Commands::Ingest { files, dry_run } => {
            let mut events = Vec::new();
            for path in &files {
                let loaded = load_event_file(path)?;
                info!(path = %path.display(), events = loaded.len(), "payload loaded");
                events.extend(loaded);
            }

            if dry_run {
                let gate = Arc::new(RequestGate::new(config.gate_config()));
                let api = ApiClient::new(config.http_config(), gate)?;
                let pipeline = SyncPipeline::new(
                    MemoryEntityStore::new(),
                    HttpDetailClient::new(api),
                    config.pipeline_options(),
                );
                pipeline.run_events(&events).await
            } else {
                let (pipeline, _listing) = build_pipeline(&config).await?;
                pipeline.run_events(&events).await
            }
        }
        Commands::Sync {
            start_date,
            end_date,
        } => {
            if end_date < start_date {
                bail!("--end-date {end_date} is before --start-date {start_date}");
            }
            let (pipeline, listing) = build_pipeline(&config).await?;
            pipeline
                .run_date_range(&listing, start_date, end_date)
                .await?
        }
        Commands::InitDb => {
            let store = PgEntityStore::connect(&config.database_url)
                .await
                .context("connecting to entity store")?;
            store.ensure_schema().await?;
            println!("entity tables ready");
            return Ok(());
        }
    };

    print_summary(&summary, cli.json)?;
    for report in &summary.categories {
        if let CategoryOutcome::Fatal { error } = &report.outcome {
            error!(category = %report.category, %error, "category aborted");
        }
    }
    if summary.has_fatal() {
        bail!("sync run {} aborted at least one category", summary.run_id);
    }
    Ok(())
}

fn print_summary(summary: &SyncRunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    println!(
        "run {} events={} inserted={} updated={}",
        summary.run_id,
        summary.events,
        summary.total_inserted(),
        summary.total_updated()
    );
    for report in &summary.categories {
        println!("  {}", report.summary_line());
    }
    Ok(())
}
