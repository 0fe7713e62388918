//! Command-line interface for makerworks-sync
//!
//! # Usage Examples
//!
//! ```bash
//! # One-shot delta sync (full when the reconciliation interval elapsed)
//! makerworks-sync sync --database-url postgres://localhost/fulfillment
//!
//! # Forced full reconciliation, bypassing cooldown and in-flight sharing
//! makerworks-sync sync --full --force \
//!   --database-url postgres://localhost/fulfillment
//!
//! # Long-running freshness loop for deployments without a scheduler
//! makerworks-sync watch --interval 30s \
//!   --database-url postgres://localhost/fulfillment
//!
//! # Inspect sync telemetry
//! makerworks-sync status --database-url postgres://localhost/fulfillment
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use makerworks_sync::config::duration::parse_duration_to_secs;
use makerworks_sync::postgres::PgSyncStore;
use makerworks_sync::{SyncEngine, SyncOpts, SyncRequest};

#[derive(Parser)]
#[command(name = "makerworks-sync")]
#[command(about = "Mirrors MakerWorks fabrication job records into the fulfillment store")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync and exit
    Sync {
        #[command(flatten)]
        opts: SyncOpts,

        /// Force full reconciliation regardless of the stored watermark
        #[arg(long)]
        full: bool,

        /// Treat this as a manual run: bypass cooldown and in-flight sharing
        #[arg(long)]
        force: bool,
    },

    /// Keep the replica fresh by evaluating the staleness trigger on an
    /// interval
    Watch {
        #[command(flatten)]
        opts: SyncOpts,

        /// How often to evaluate staleness
        #[arg(long, default_value = "30s")]
        interval: String,
    },

    /// Print the current sync telemetry as JSON
    Status {
        #[command(flatten)]
        opts: SyncOpts,
    },

    /// Create the local fulfillment tables
    InitSchema {
        #[command(flatten)]
        opts: SyncOpts,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync { opts, full, force } => {
            let engine = build_engine(&opts).await?;
            let request = if force {
                SyncRequest::manual(full)
            } else {
                SyncRequest { force: false, full }
            };
            let report = engine.sync(request).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Watch { opts, interval } => {
            let interval_secs = parse_duration_to_secs(&interval)?.max(1) as u64;
            let engine = build_engine(&opts).await?;
            let max_age = engine.config().max_staleness;
            info!(interval_secs, "watching replica freshness");
            loop {
                if engine.trigger_if_stale(max_age) {
                    info!("replica stale, background sync scheduled");
                }
                tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
            }
        }

        Commands::Status { opts } => {
            let engine = build_engine(&opts).await?;
            let snapshot = engine.refresh_telemetry().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }

        Commands::InitSchema { opts } => {
            let config = opts.to_config()?;
            PgSyncStore::new(&opts.database_url, config)
                .ensure_schema()
                .await?;
        }
    }

    Ok(())
}

async fn build_engine(opts: &SyncOpts) -> anyhow::Result<SyncEngine> {
    let config = opts.to_config()?;
    let store = PgSyncStore::new(&opts.database_url, config.clone());
    store.ensure_schema().await?;
    let engine = SyncEngine::new(Arc::new(store), config);
    engine.refresh_telemetry().await?;
    Ok(engine)
}
