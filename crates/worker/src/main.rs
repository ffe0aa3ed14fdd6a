//! duraq worker: schema migrations, queue maintenance, and the scheduler/reaper daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use duraq_core::NewTask;
use duraq_infra::{parse_cron_jobs, DuraqConfig, PgStore, Queue, Reaper, Scheduler};

#[derive(Debug, Parser)]
#[command(name = "duraq-worker")]
#[command(version, about = "Durable task queue worker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,

    /// Reset tasks stuck in running back to pending
    Cleanup {
        /// Stuck threshold in seconds (defaults to DURAQ_STUCK_TIMEOUT_SECS)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Print task counts per status as JSON
    Stats,

    /// Publish a single task
    Publish {
        /// Routing subject, e.g. `reports.nightly`
        subject: String,

        /// Payload, stored as raw bytes
        #[arg(long, default_value = "")]
        payload: String,

        /// Delay before the task becomes eligible
        #[arg(long)]
        delay_secs: Option<u64>,

        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Run the cron scheduler and stuck-task reaper until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    duraq_observability::init();

    let cli = Cli::parse();
    let config = DuraqConfig::from_env().context("failed to load configuration")?;
    let store = PgStore::connect(&config.database_url, config.max_connections)
        .await
        .context("failed to connect to database")?;

    match cli.command {
        Command::Migrate => {
            store.migrate().await.context("migration failed")?;
            info!("migrations applied");
        }
        Command::Cleanup { timeout_secs } => {
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(config.reaper.stuck_timeout);
            let queue = Queue::new(Arc::new(store));
            let reset = queue.cleanup_stuck_tasks(timeout).await?;
            info!(reset, "cleanup finished");
        }
        Command::Stats => {
            let queue = Queue::new(Arc::new(store));
            let stats = queue.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Publish {
            subject,
            payload,
            delay_secs,
            max_attempts,
        } => {
            let mut task = NewTask::new(subject, payload.into_bytes());
            if let Some(secs) = delay_secs {
                task = task
                    .delayed(Duration::from_secs(secs))
                    .context("invalid --delay-secs")?;
            }
            if let Some(max) = max_attempts {
                task = task.max_attempts(max);
            }
            let queue = Queue::new(Arc::new(store));
            let id = queue.publish_one(task).await?;
            println!("{id}");
        }
        Command::Run => run(store, config).await?,
    }

    Ok(())
}

async fn run(store: PgStore, config: DuraqConfig) -> Result<()> {
    let mut scheduler = Scheduler::new(Arc::new(store.clone()), config.scheduler.clone());

    if let Some(path) = &config.cron_file {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read cron file {}", path.display()))?;
        let specs = parse_cron_jobs(&json)
            .with_context(|| format!("invalid cron file {}", path.display()))?;
        let jobs = scheduler.create_or_update_cron_jobs(specs).await?;
        info!(count = jobs.len(), "cron jobs registered");
    } else {
        warn!("DURAQ_CRON_FILE not set; scheduling existing cron jobs only");
    }

    let mut reaper = Reaper::new(Queue::new(Arc::new(store)), config.reaper.clone());

    scheduler.start()?;
    reaper.start()?;
    info!("worker running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    let scheduler_result = scheduler.stop().await;
    let reaper_result = reaper.stop().await;
    scheduler_result?;
    reaper_result?;

    info!("worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_publish_command() {
        let cli = Cli::try_parse_from([
            "duraq-worker",
            "publish",
            "reports.nightly",
            "--payload",
            "{}",
            "--delay-secs",
            "30",
        ])
        .unwrap();
        match cli.command {
            Command::Publish {
                subject,
                payload,
                delay_secs,
                max_attempts,
            } => {
                assert_eq!(subject, "reports.nightly");
                assert_eq!(payload, "{}");
                assert_eq!(delay_secs, Some(30));
                assert_eq!(max_attempts, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_cleanup_timeout() {
        let cli = Cli::try_parse_from(["duraq-worker", "cleanup", "--timeout-secs", "600"]).unwrap();
        assert!(matches!(cli.command, Command::Cleanup { timeout_secs: Some(600) }));
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(Cli::try_parse_from(["duraq-worker", "explode"]).is_err());
    }
}
