use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use marquee_sync::{build_scheduler, run_scheduled_cycle, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "marquee")]
#[command(about = "London theatre listings and reviews aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one aggregation cycle and persist the result.
    Sync {
        /// Max records per source.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Fetch a single source and print its records without persisting them.
    Source {
        name: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Aggregate now, then on the configured cron until Ctrl-C.
    Schedule,
    /// Start the JSON API (and the scheduler when MARQUEE_SCHEDULER_ENABLED is set).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("marquee=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { limit: None }) {
        Commands::Sync { limit } => {
            let report = marquee_sync::run_sync_once_from_env(limit).await?;
            let s = &report.summary;
            println!(
                "sync complete: run_id={} sources={}/{} shows={} reviews={} errors={}",
                s.run_id, s.successful_sources, s.total_sources, s.total_shows, s.total_reviews, s.errors.len()
            );
            for err in &s.errors {
                eprintln!("  {}: {}", err.source, err.message);
            }
        }
        Commands::Source { name, limit } => {
            let config = SyncConfig::from_env();
            let pipeline = SyncPipeline::from_config(&config).await?;
            let records = pipeline.run_source(&name, limit).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env();
            let pipeline = Arc::new(SyncPipeline::from_config(&config).await?);
            run_scheduled_cycle(&pipeline, None).await;

            let mut sched = build_scheduler(pipeline, &config.sync_cron, None).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "aggregation scheduler started; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => marquee_web::serve_from_env().await?,
    }

    Ok(())
}
