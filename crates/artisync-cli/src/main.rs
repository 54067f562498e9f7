use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use artisync_core::TriggerSource;
use artisync_partner::{FixturePartnerApi, HttpPartnerClient, PartnerApi};
use artisync_storage::{CatalogStore, MemoryCatalogStore, PgCatalogStore, RunHistoryStore};
use artisync_sync::{
    maybe_build_scheduler, render_report_markdown, yesterday_from, RunLogger, SyncConfig, SyncPipeline,
};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "artisync")]
#[command(about = "Artisan data sync pipeline")]
struct Cli {
    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Args)]
struct SourceArgs {
    /// Replay partner pages from a fixture bundle instead of calling the partner.
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Keep the catalog in memory instead of Postgres.
    #[arg(long)]
    in_memory: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one date (default: yesterday, UTC).
    Sync {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Sync yesterday and then today.
    SyncDates {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Push one day's call statistics to the partner (default: yesterday).
    PushStats {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[command(flatten)]
        source: SourceArgs,
    },
    Migrate,
    /// Run the HTTP trigger surface and, when enabled, the cron jobs.
    Serve,
    /// Comprehensive run report.
    Report {
        #[arg(long)]
        json: bool,
    },
    Summary,
}

async fn build_store(config: &SyncConfig, in_memory: bool) -> Result<Arc<dyn CatalogStore>> {
    if in_memory {
        return Ok(Arc::new(MemoryCatalogStore::new()));
    }
    Ok(Arc::new(PgCatalogStore::connect_and_migrate(&config.database_url).await?))
}

fn build_partner(config: &SyncConfig, fixtures: Option<&PathBuf>) -> Result<Arc<dyn PartnerApi>> {
    match fixtures {
        Some(path) => Ok(Arc::new(FixturePartnerApi::load(path)?)),
        None => Ok(Arc::new(HttpPartnerClient::new(config.partner_config())?)),
    }
}

async fn build_pipeline(config: &SyncConfig, source: &SourceArgs) -> Result<SyncPipeline> {
    let store = build_store(config, source.in_memory).await?;
    let partner = build_partner(config, source.fixtures.as_ref())?;
    Ok(SyncPipeline::from_config(config, store, partner))
}

/// History queries read the run file only; no database or partner needed.
fn run_logger(config: &SyncConfig) -> RunLogger {
    RunLogger::new(RunHistoryStore::new(&config.history_path))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("rendering output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.log_level);
    let config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Sync {
        date: None,
        source: SourceArgs {
            fixtures: None,
            in_memory: false,
        },
    });

    match command {
        Commands::Sync { date, source } => {
            let pipeline = build_pipeline(&config, &source).await?;
            let date = date.unwrap_or_else(|| yesterday_from(Utc::now()));
            let outcome = pipeline.sync_for_date(date, TriggerSource::Manual).await;
            print_json(&outcome)?;
            if !outcome.success {
                bail!("sync for {date} failed");
            }
        }
        Commands::SyncDates { source } => {
            let pipeline = build_pipeline(&config, &source).await?;
            let outcome = pipeline.sync_yesterday_and_today().await;
            print_json(&outcome)?;
            if !(outcome.yesterday.success && outcome.today.success) {
                bail!("catch-up sync failed");
            }
        }
        Commands::PushStats { date, source } => {
            let pipeline = build_pipeline(&config, &source).await?;
            let date = date.unwrap_or_else(|| yesterday_from(Utc::now()));
            let outcome = pipeline.push_call_stats(date).await;
            print_json(&outcome)?;
            if !outcome.success {
                bail!("call stats push for {date} failed");
            }
        }
        Commands::Migrate => {
            PgCatalogStore::connect_and_migrate(&config.database_url).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let pipeline = Arc::new(build_pipeline(&config, &SourceArgs { fixtures: None, in_memory: false }).await?);
            let scheduler = maybe_build_scheduler(Arc::clone(&pipeline), &config).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
                info!(sync_cron = %config.sync_cron, push_stats_cron = %config.push_stats_cron, "scheduler started");
            }
            tokio::select! {
                served = artisync_web::serve(artisync_web::AppState::new(pipeline), config.web_port) => served?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
            if let Some(mut scheduler) = scheduler {
                scheduler.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Report { json } => {
            let report = run_logger(&config).report().await;
            if json {
                print_json(&report)?;
            } else {
                print!("{}", render_report_markdown(&report));
            }
        }
        Commands::Summary => {
            let summary = run_logger(&config).summary().await;
            print_json(&summary)?;
        }
    }

    Ok(())
}
