use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use firewatch_ingest::{build_scheduler, fixture_job, job_from_config, job_with_store, FirewatchConfig};
use firewatch_storage::{MemoryReportStore, PgReportStore, ReportStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "firewatch")]
#[command(about = "NASA FIRMS hotspot ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle and print the outcome as JSON.
    Ingest {
        /// Read hotspots from a local FIRMS CSV instead of the API.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Deduplicate and "insert" into an in-memory store only.
        #[arg(long)]
        dry_run: bool,
    },
    Migrate,
    Serve,
    /// Run the job on FIREWATCH_SCHEDULE until interrupted.
    Schedule,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("firewatch=info".parse()?);
    let json = std::env::var("FIREWATCH_LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    let cli = Cli::parse();
    let config = FirewatchConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Ingest {
        fixture: None,
        dry_run: false,
    }) {
        Commands::Ingest { fixture, dry_run } => {
            let store: Arc<dyn ReportStore> = if dry_run {
                Arc::new(MemoryReportStore::new())
            } else {
                Arc::new(PgReportStore::connect_lazy(
                    &config.database_url,
                    config.ingest.storage_timeout,
                )?)
            };
            let job = match fixture {
                Some(path) => fixture_job(&config, path, store).await?,
                None => job_with_store(&config, store)?,
            };
            let outcome = job.run().await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Commands::Migrate => {
            let store = PgReportStore::connect_lazy(&config.database_url, config.ingest.storage_timeout)?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => {
            firewatch_web::serve(&config).await?;
        }
        Commands::Schedule => {
            let job = Arc::new(job_from_config(&config)?);
            let mut sched = build_scheduler(job, &config.schedule).await?;
            sched.start().await.context("starting scheduler")?;
            info!(schedule = %config.schedule, "scheduler running");
            tokio::signal::ctrl_c().await?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
