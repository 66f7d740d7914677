//! # Conversations Pipeline Worker
//!
//! Runs the background pipeline and provides operator commands. Handlers are
//! registered by the embedding service; the stock binary starts with empty
//! registries, so jobs and events it cannot dispatch are dead-lettered.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use conversations::backoff::ExponentialBackoff;
use conversations::config::ConfigLoader;
use conversations::handler::HandlerRegistry;
use conversations::repositories::DeadLetterStore;
use conversations::scheduler::PipelineScheduler;
use conversations::{db, telemetry};

#[derive(Debug, Parser)]
#[command(name = "conversations", version, about = "Conversations pipeline worker")]
struct Cli {
    /// Run a single scheduler tick and exit
    #[arg(long)]
    once: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler until interrupted (default)
    Run,
    /// Print dead-letter queue statistics as JSON
    DlqStats {
        #[arg(long)]
        tenant: Option<Uuid>,
    },
    /// Put a dead-letter entry back into the replay rotation
    DlqRequeue {
        /// Dead-letter entry id
        id: Uuid,
    },
    /// Apply pending database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;
    telemetry::init_tracing(&config).context("failed to initialize tracing")?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        info!(config = %redacted, "Effective configuration");
    }

    let db = Arc::new(db::init_pool(&config).await?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Migrate => {
            db::migrate(&db).await?;
            info!("Migrations applied");
        }
        Command::DlqStats { tenant } => {
            let store = DeadLetterStore::new(db.clone(), ExponentialBackoff::from(&config.backoff));
            let stats = store
                .stats(tenant)
                .await
                .context("failed to compute dead-letter statistics")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::DlqRequeue { id } => {
            let store = DeadLetterStore::new(db.clone(), ExponentialBackoff::from(&config.backoff));
            if !store
                .requeue(id)
                .await
                .context("failed to requeue dead-letter entry")?
            {
                anyhow::bail!("dead-letter entry {id} not found");
            }
            println!("requeued {id}");
        }
        Command::Run => {
            db::migrate(&db).await?;
            warn!("No operation handlers registered; undispatchable work will be dead-lettered");
            let scheduler = PipelineScheduler::new(
                Arc::new(config),
                db.clone(),
                HandlerRegistry::new(),
                HandlerRegistry::new(),
            );

            if cli.once {
                let stats = scheduler.tick().await;
                info!(?stats, "Single tick finished");
                return Ok(());
            }

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received; finishing current tick");
                    signal_token.cancel();
                }
            });
            scheduler.run(shutdown).await;
        }
    }

    Ok(())
}
