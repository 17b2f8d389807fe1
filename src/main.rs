use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use matching_lib::memory::db::{load_memory_store, persist_dirty};
use matching_lib::models::core::{ProductId, RecordId, TaskId, TemplateId};
use matching_lib::task::db::claim_next_pending_task;
use matching_lib::task::review;
use matching_lib::task::runner::{run_claimed_task, run_task_by_id};
use matching_lib::utils::config::MatcherConfig;
use matching_lib::utils::db_connect::{connect, get_pool_status};
use matching_lib::utils::env::load_env;
use matching_lib::utils::get_memory_usage;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "matcher", about = "Wholesale product matching and memory engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll for pending tasks and run them until interrupted
    Worker,
    /// Run the automated pass for one task
    RunTask {
        /// Task id to process
        task_id: String,
    },
    /// Confirm a binding on a processed record
    Confirm {
        record_id: String,
        product_id: String,
        /// Reviewer identity recorded on the action
        #[arg(long)]
        actor: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Reject the suggested binding on a processed record
    Reject {
        record_id: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Return a reviewed record to the pending queue
    Clear {
        record_id: String,
        #[arg(long)]
        actor: String,
    },
    /// Deprecate duplicate active memory records
    CleanupMemory {
        /// Restrict the pass to one template
        #[arg(long)]
        template_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();

    let cli = Cli::parse();
    let config = MatcherConfig::from_env();
    config.log_config();

    let pool = connect().await.context("Failed to connect to database")?;
    info!("Successfully connected to the database");

    match cli.command {
        Command::Worker => run_worker(&pool, &config).await,
        Command::RunTask { task_id } => run_task_by_id(&pool, &TaskId(task_id), &config).await,
        Command::Confirm {
            record_id,
            product_id,
            actor,
            note,
        } => {
            review::confirm(
                &pool,
                &RecordId(record_id),
                &ProductId(product_id),
                &actor,
                note,
            )
            .await
        }
        Command::Reject {
            record_id,
            actor,
            note,
        } => review::reject(&pool, &RecordId(record_id), &actor, note).await,
        Command::Clear { record_id, actor } => {
            review::clear(&pool, &RecordId(record_id), &actor, None).await
        }
        Command::CleanupMemory { template_id } => {
            let template = template_id.map(TemplateId);
            cleanup_memory(&pool, template.as_ref(), &config.system_actor).await
        }
    }
}

async fn run_worker(
    pool: &matching_lib::utils::db_connect::PgPool,
    config: &MatcherConfig,
) -> Result<()> {
    info!("🚀 Worker started, polling every {}s", config.worker_poll_secs);
    loop {
        match claim_next_pending_task(pool).await {
            Ok(Some(task)) => {
                let task_id = task.id.clone();
                if let Err(e) = run_claimed_task(pool, task, config).await {
                    // The failure is recorded on the task row; the worker
                    // moves on to the next one.
                    warn!("Task {} failed: {:#}", task_id.0, e);
                }
                let (total, available) = get_pool_status(pool);
                info!(
                    "Worker status: memory {} MB, DB pool {}/{} in use",
                    get_memory_usage().await,
                    total - available,
                    total
                );
            }
            Ok(None) => {
                tokio::time::sleep(Duration::from_secs(config.worker_poll_secs)).await;
            }
            Err(e) => {
                warn!("Failed to poll for pending tasks: {:#}", e);
                tokio::time::sleep(Duration::from_secs(config.worker_poll_secs)).await;
            }
        }
    }
}

async fn cleanup_memory(
    pool: &matching_lib::utils::db_connect::PgPool,
    template_id: Option<&TemplateId>,
    actor: &str,
) -> Result<()> {
    let mut store = load_memory_store(pool, template_id).await?;
    let deprecated = store.cleanup_duplicates(template_id, actor, Utc::now());
    let written = persist_dirty(pool, &mut store).await?;
    info!(
        "Memory cleanup finished: {} duplicate(s) deprecated, {} record(s) written",
        deprecated, written
    );
    Ok(())
}
