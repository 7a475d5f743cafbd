use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use roulette_core::EventProfile;
use roulette_storage::{DocumentStore, LoadOrigin};
use roulette_sync::{
    build_scheduler, document_path_from_env, status_markdown, ConfigError, SourceRegistry, SyncConfig, SyncPipeline,
};
use tracing::info;

const EXIT_CONFIG: u8 = 2;
const EXIT_FAILURE: u8 = 1;

#[derive(Debug, Parser)]
#[command(name = "roulette-cli")]
#[command(about = "Keeps the RA Roulette event document in sync")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Event document to read and write (overrides ROULETTE_DOCUMENT)
    #[arg(long, global = true)]
    document: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass
    Sync {
        /// Print the run summary as JSON instead of one line
        #[arg(long)]
        json: bool,
    },
    /// Show stored weeks without touching the network
    Status,
    /// Print the current week and a week's date range
    Schedule {
        #[arg(long)]
        week: Option<u32>,
    },
    /// Run sync on ROULETTE_SYNC_CRON until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) if err.downcast_ref::<ConfigError>().is_some() => {
            eprintln!("configuration error: {err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let (config, registry) = load_config(cli.document).await?;
            let pipeline = SyncPipeline::from_config(&config, &registry)?;
            let summary = pipeline.run_once(Utc::now()).await?;
            if json {
                let rendered = serde_json::to_string_pretty(&summary).context("rendering run summary")?;
                println!("{rendered}");
            } else {
                println!("{}", summary.one_line());
            }
            Ok(summary.exit_code())
        }
        Commands::Status => {
            let path = cli.document.unwrap_or_else(document_path_from_env);
            let store = DocumentStore::new(path, EventProfile::roulette_2026());
            let loaded = store.load().await;
            match &loaded.origin {
                LoadOrigin::Existing => {}
                LoadOrigin::Missing => eprintln!("{} does not exist yet", store.path().display()),
                LoadOrigin::Corrupt(reason) => eprintln!("{} is unreadable: {reason}", store.path().display()),
            }
            print!("{}", status_markdown(&loaded.event, &store.profile().schedule(), Utc::now()));
            Ok(0)
        }
        Commands::Schedule { week } => {
            let schedule = EventProfile::roulette_2026().schedule();
            let current = schedule.current_week_number(Utc::now());
            let week = week.unwrap_or(current).max(1);
            let (start, end) = schedule.week_date_range(week);
            println!("current week: {current}");
            println!(
                "week {week}: {} .. {}",
                start.to_rfc3339_opts(SecondsFormat::Millis, true),
                end.to_rfc3339_opts(SecondsFormat::Millis, true)
            );
            Ok(0)
        }
        Commands::Watch => {
            let (config, registry) = load_config(cli.document).await?;
            if !config.scheduler_enabled {
                return Err(ConfigError::SchedulerDisabled.into());
            }
            let pipeline = Arc::new(SyncPipeline::from_config(&config, &registry)?);
            let mut sched = build_scheduler(pipeline, &config.sync_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "watching; press Ctrl-C to stop");

            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(0)
        }
    }
}

async fn load_config(document: Option<PathBuf>) -> Result<(SyncConfig, SourceRegistry)> {
    let mut config = SyncConfig::from_env()?;
    if let Some(path) = document {
        config.document_path = path;
    }
    let registry = SourceRegistry::load(&config.sources_path).await?;
    info!(
        user = %config.credentials.username,
        api_key = %config.credentials.masked_key(),
        document = %config.document_path.display(),
        sources = registry.enabled().count(),
        "configuration loaded"
    );
    Ok((config, registry))
}
