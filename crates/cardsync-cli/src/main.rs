use std::sync::Arc;

use anyhow::{Context, Result};
use cardsync_core::{CardGameType, ImportMode};
use cardsync_storage::postgres;
use cardsync_sync::{
    report_recent_runs, CycleSummary, ImportService, ManualTrigger, SyncConfig,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cardsync")]
#[command(about = "Trading card catalog import pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one cycle over every game, DELTA where supported.
    Sync,
    /// Run a manual import for one game or all of them.
    Import {
        #[arg(long)]
        game: Option<CardGameType>,
        #[arg(long, default_value = "full")]
        mode: ImportMode,
    },
    /// Start the cron scheduler and block until Ctrl-C.
    Schedule,
    Migrate,
    /// Print per-game import progress.
    Status,
    /// Summarize the newest run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let service = ImportService::from_config(config).await?;
            match service.run_scheduled().await {
                Some(summary) => print_summary(&summary),
                None => println!("import skipped: another cycle holds the lock"),
            }
        }
        Commands::Import { game, mode } => {
            let service = ImportService::from_config(config).await?;
            match service.run_manual(ManualTrigger { game, mode }).await {
                Some(summary) => print_summary(&summary),
                None => println!("import skipped: another cycle holds the lock"),
            }
        }
        Commands::Schedule => {
            let service = Arc::new(ImportService::from_config(config).await?);
            let Some(mut sched) = service.build_scheduler().await? else {
                println!("scheduler disabled; set CARDSYNC_SCHEDULER_ENABLED=true");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let pool = postgres::connect(&config.database_url, 1).await?;
            postgres::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::Status => {
            let service = ImportService::from_config(config).await?;
            let rows = service.progress().await?;
            if rows.is_empty() {
                println!("no import progress recorded yet");
            }
            for row in rows {
                println!(
                    "{:<10} cursor={:<8} complete={:<5} last_run_at={}",
                    row.game.slug(),
                    row.cursor,
                    row.complete,
                    row.last_run_at
                );
            }
            let supported = service.registry().supported_games();
            for game in CardGameType::ALL {
                if !supported.contains(&game) {
                    println!("{:<10} no provider configured", game.slug());
                }
            }
        }
        Commands::Report { runs } => {
            print!("{}", report_recent_runs(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}

fn print_summary(summary: &CycleSummary) {
    println!(
        "import complete: run_id={} attempted={} succeeded={} failed={} \
         not_attempted={} imported={}",
        summary.run_id,
        summary.attempted,
        summary.succeeded,
        summary.failed,
        summary.skipped,
        summary.imported
    );
    for report in &summary.reports {
        if let Some(reason) = &report.reason {
            println!("  {} failed: {reason}", report.game);
        }
    }
}
