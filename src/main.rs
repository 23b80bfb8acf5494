use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;

use conductor::config::{config, init_config, ConductorConfig};
use conductor::database::DatabaseManager;
use conductor::github::OctocrabWriter;
use conductor::orchestrator::Orchestrator;
use conductor::outbox::{self, ProcessOptions};
use conductor::store::runs;
use conductor::telemetry::{init_telemetry, shutdown_telemetry};

#[derive(Parser)]
#[command(
    name = "conductor",
    about = "Run-orchestration control plane for autonomous engineering agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List runs awaiting operator attention in a project
    Status {
        #[arg(long)]
        project: String,
    },
    /// Outbox maintenance commands
    Outbox {
        #[command(subcommand)]
        command: OutboxCommands,
    },
    /// Cancel a run: abort in-flight work and pending GitHub writes
    Cancel {
        run_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum OutboxCommands {
    /// Deliver pending GitHub writes
    Process {
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        run: Option<String>,
    },
    /// Re-queue writes stuck in processing after a worker crash
    Janitor {
        #[arg(long)]
        stale_minutes: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    ConductorConfig::load_env_file()?;
    init_telemetry()?;
    init_config()?;
    let cfg = config()?;

    let cli = Cli::parse();
    let db = DatabaseManager::new(
        &cfg.database.url,
        cfg.database.max_connections,
        cfg.database.auto_migrate,
    )
    .await
    .context("failed to open database")?;

    match cli.command {
        Commands::Status { project } => {
            let waiting = runs::runs_awaiting_gates(db.pool(), &project).await?;
            if waiting.is_empty() {
                println!("No runs awaiting gates in project {project}");
            }
            for run in waiting {
                println!(
                    "{}  task={}  phase={}  blocked_reason={}",
                    run.run_id,
                    run.task_id,
                    run.phase,
                    run.blocked_reason.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Outbox { command } => match command {
            OutboxCommands::Process { limit, run } => {
                let Some(token) = cfg.github.token.clone() else {
                    bail!("no GitHub token configured; set GITHUB_TOKEN");
                };
                let writer = OctocrabWriter::new(token)?;
                let opts = ProcessOptions {
                    limit: limit.unwrap_or(cfg.outbox.batch_limit),
                    run_id: run,
                    max_retries: cfg.outbox.max_retries,
                    base_backoff: Duration::from_millis(cfg.outbox.base_backoff_ms),
                };
                let report = outbox::process_outbox(db.pool(), &writer, &opts).await?;
                println!(
                    "fetched={} completed={} failed={} backoff={} lost_claim={}",
                    report.fetched,
                    report.completed,
                    report.failed,
                    report.skipped_backoff,
                    report.skipped_claim
                );
            }
            OutboxCommands::Janitor { stale_minutes } => {
                let stale = Duration::from_secs(
                    stale_minutes.unwrap_or(cfg.outbox.stalled_after_minutes) * 60,
                );
                let reset = outbox::reset_stalled_writes(db.pool(), stale).await?;
                println!("re-queued {reset} stalled writes");
            }
        },
        Commands::Cancel { run_id, reason } => {
            let orchestrator = Orchestrator::new(db.pool().clone());
            let outcome = orchestrator.cancel_run(&run_id, "operator", reason).await?;
            println!(
                "run {} cancelled at sequence {}",
                outcome.run.run_id,
                outcome.event.sequence.unwrap_or_default()
            );
        }
    }

    db.shutdown().await;
    shutdown_telemetry();
    Ok(())
}
