//! Runtime configuration for the sync engine.
//!
//! [`SyncOpts`] is the clap-facing surface (flags with environment-variable
//! fallbacks, durations as human strings); [`SyncConfig`] is the resolved
//! form the engine consumes.

use chrono::Duration;
use clap::Parser;

pub mod duration;

use duration::parse_duration_to_secs;

use crate::dead_letter::RetryPolicy;

/// Advisory lock key for the sync transaction, shared by all instances.
pub const SYNC_LOCK_KEY: i64 = 0x6d61_6b65_7277_6b73; // "makerwks"

#[derive(Parser, Clone, Debug)]
pub struct SyncOpts {
    /// PostgreSQL connection string for the fulfillment database
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Foreign MakerWorks job table
    #[arg(long, default_value = "makerworks_jobs", env = "MAKERWORKS_JOBS_TABLE")]
    pub source_table: String,

    /// Companion checkout table joined on payment_intent_id (may be absent)
    #[arg(
        long,
        default_value = "makerworks_checkouts",
        env = "MAKERWORKS_CHECKOUTS_TABLE"
    )]
    pub checkout_table: String,

    /// Interval between full reconciliations ("6h", "30m", "300")
    #[arg(long, default_value = "6h", env = "SYNC_FULL_INTERVAL")]
    pub full_sync_interval: String,

    /// Age of the last successful sync beyond which the replica is stale
    #[arg(long, default_value = "5m", env = "SYNC_MAX_STALENESS")]
    pub max_staleness: String,

    /// Cooldown between background-triggered runs
    #[arg(long, default_value = "30s", env = "SYNC_TRIGGER_COOLDOWN")]
    pub trigger_cooldown: String,

    /// Delay before the first dead-letter retry
    #[arg(long, default_value = "60s", env = "SYNC_RETRY_BASE")]
    pub retry_base: String,

    /// Upper bound on the dead-letter backoff
    #[arg(long, default_value = "4h", env = "SYNC_RETRY_CEILING")]
    pub retry_ceiling: String,

    /// Dead-letter retries stop once an entry reaches this count
    #[arg(long, default_value_t = 8, env = "SYNC_MAX_RETRIES")]
    pub max_retries: i32,

    /// Maximum dead-letter retries picked up per run
    #[arg(long, default_value_t = 25, env = "SYNC_RETRY_BATCH")]
    pub retry_batch: i64,

    /// Queries slower than this are counted into the slow-query telemetry
    #[arg(long, default_value = "500", env = "SYNC_SLOW_QUERY_MS")]
    pub slow_query_ms: u64,
}

impl SyncOpts {
    /// Resolve the human-readable flags into a [`SyncConfig`].
    pub fn to_config(&self) -> anyhow::Result<SyncConfig> {
        Ok(SyncConfig {
            source_table: self.source_table.clone(),
            checkout_table: self.checkout_table.clone(),
            full_sync_interval: Duration::seconds(parse_duration_to_secs(
                &self.full_sync_interval,
            )?),
            max_staleness: Duration::seconds(parse_duration_to_secs(&self.max_staleness)?),
            trigger_cooldown: std::time::Duration::from_secs(
                parse_duration_to_secs(&self.trigger_cooldown)?.max(0) as u64,
            ),
            retry: RetryPolicy {
                base: Duration::seconds(parse_duration_to_secs(&self.retry_base)?),
                ceiling: Duration::seconds(parse_duration_to_secs(&self.retry_ceiling)?),
                max_retries: self.max_retries,
            },
            retry_batch: self.retry_batch,
            slow_query: std::time::Duration::from_millis(self.slow_query_ms),
            lock_key: SYNC_LOCK_KEY,
        })
    }
}

/// Resolved sync-engine settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_table: String,
    pub checkout_table: String,
    pub full_sync_interval: Duration,
    pub max_staleness: Duration,
    pub trigger_cooldown: std::time::Duration,
    pub retry: RetryPolicy,
    pub retry_batch: i64,
    pub slow_query: std::time::Duration,
    pub lock_key: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            source_table: "makerworks_jobs".to_string(),
            checkout_table: "makerworks_checkouts".to_string(),
            full_sync_interval: Duration::hours(6),
            max_staleness: Duration::minutes(5),
            trigger_cooldown: std::time::Duration::from_secs(30),
            retry: RetryPolicy::default(),
            retry_batch: 25,
            slow_query: std::time::Duration::from_millis(500),
            lock_key: SYNC_LOCK_KEY,
        }
    }
}
