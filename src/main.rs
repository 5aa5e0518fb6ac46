use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod error;
mod features;
mod ingest;
mod models;
mod pipeline;
mod report;
mod scoring;
mod state;
mod store;

use crate::config::PipelineConfig;
use crate::ingest::{CsvSource, HubSource, SnapshotSource};
use crate::pipeline::{Orchestrator, PipelineSettings, RunOptions, RunSummary};
use crate::scoring::{ModelArtifact, ScoringEngine};

#[derive(Parser)]
#[command(name = "model-momentum")]
#[command(about = "Daily momentum features and trend predictions for hub models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceKind {
    Hub,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Backfill snapshot history from a CSV export
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Ingest, score and persist one observation date
    Run {
        /// Observation date, defaults to today (UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        overwrite: bool,
        #[arg(long, value_enum, default_value_t = SourceKind::Hub)]
        source: SourceKind,
        #[arg(long, required_if_eq("source", "csv"))]
        csv: Option<PathBuf>,
    },
    /// Generate a markdown report of one day's predictions
    Report {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value = "trends.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let pool = connect().await?;
    let store = db::PgStore::new(pool.clone());

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Import { csv } => {
            let summary = store.import_csv(&csv, Utc::now()).await?;
            println!(
                "Read {} rows from {}: {} snapshots inserted, {} rejected.",
                summary.rows,
                csv.display(),
                summary.inserted,
                summary.rejected.len()
            );
            for (entity_id, reason) in summary.rejected.iter().take(10) {
                println!("- {entity_id}: {reason}");
            }
        }
        Commands::Run {
            date,
            dry_run,
            overwrite,
            source,
            csv,
        } => {
            let config = PipelineConfig::from_env()?;
            let artifact = ModelArtifact::load(&config.model_path).with_context(|| {
                format!("failed to load model artifact {}", config.model_path.display())
            })?;
            info!(
                name = %artifact.name,
                version = %artifact.version,
                path = %config.model_path.display(),
                "model artifact loaded"
            );
            let engine = ScoringEngine::new(Arc::new(artifact), config.threshold)?;
            info!(threshold = engine.threshold(), "scoring engine ready");

            let source: Arc<dyn SnapshotSource> = match (source, csv) {
                (SourceKind::Csv, Some(path)) => Arc::new(CsvSource::new(path)),
                (SourceKind::Csv, None) => bail!("--csv is required with --source csv"),
                (SourceKind::Hub, _) => {
                    Arc::new(HubSource::new(config.hub.clone(), config.ingest_timeout)?)
                }
            };

            let mut orchestrator = Orchestrator::new(
                Arc::new(store),
                source,
                engine,
                PipelineSettings {
                    concurrency: config.concurrency,
                    store_timeout: config.store_timeout,
                    ingest_timeout: config.ingest_timeout,
                },
            );
            let options = RunOptions {
                observation_date: date.unwrap_or_else(|| Utc::now().date_naive()),
                dry_run,
                overwrite,
            };

            match orchestrator.run_once(options).await {
                Ok(summary) => print_summary(&summary),
                Err(err) => {
                    eprintln!(
                        "Run {} ended {} ({:?} failure).",
                        orchestrator.run_id(),
                        orchestrator.state().kind().as_str(),
                        err.class()
                    );
                    return Err(err)
                        .with_context(|| format!("run for {} failed", options.observation_date));
                }
            }
        }
        Commands::Report { date, limit, out } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let trends = store.fetch_trends(date).await?;
            let report = report::build_report(date, limit, &trends);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Run {} for {} ({}){}",
        summary.run_id,
        summary.observation_date,
        summary.state.kind().as_str(),
        if summary.dry_run { ", dry run" } else { "" }
    );
    println!("Model version: {}", summary.model_version);
    println!("Fetched: {}", summary.fetched);
    println!("Scored: {} ({} trending)", summary.scored, summary.trending);
    println!(
        "Persisted: {} snapshots, {} scores",
        summary.snapshots_inserted, summary.scores_persisted
    );

    let skipped = summary.skipped_by_reason();
    if skipped.is_empty() {
        println!("Skipped: 0");
    } else {
        println!("Skipped: {}", summary.skipped.len());
        for (reason, count) in skipped {
            println!("- {reason}: {count}");
        }
    }
}
