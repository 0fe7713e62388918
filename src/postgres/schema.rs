//! Local table DDL.
//!
//! The destination job table, the sync-state singleton, and the dead-letter
//! table are created idempotently; the foreign MakerWorks tables are never
//! touched.

use anyhow::Result;
use tokio_postgres::Client;
use tracing::info;

const LOCAL_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id text PRIMARY KEY,
    payment_intent_id text NOT NULL,
    total bigint NOT NULL,
    currency text NOT NULL,
    line_items jsonb NOT NULL DEFAULT '[]'::jsonb,
    shipping jsonb,
    metadata jsonb,
    user_id text,
    customer_email text,
    payment_method text,
    status text NOT NULL DEFAULT 'pending',
    fulfillment_status text NOT NULL DEFAULT 'pending',
    fulfilled_at timestamptz,
    source_created_at timestamptz NOT NULL,
    source_updated_at timestamptz NOT NULL,
    queue_position bigint NOT NULL,
    viewed_at timestamptz,
    invoiced_at timestamptz,
    receipted_at timestamptz,
    synced_at timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_jobs_queue_position ON jobs (queue_position);
CREATE INDEX IF NOT EXISTS idx_jobs_source_updated_at ON jobs (source_updated_at);

CREATE TABLE IF NOT EXISTS sync_state (
    id smallint PRIMARY KEY DEFAULT 1 CHECK (id = 1),
    watermark timestamptz,
    last_success_at timestamptz,
    last_run_started_at timestamptz,
    last_run_duration_ms bigint,
    last_run_rows bigint NOT NULL DEFAULT 0,
    last_run_mode text,
    last_full_sync_at timestamptz,
    last_error text,
    consecutive_failures integer NOT NULL DEFAULT 0,
    slow_queries_last_run integer NOT NULL DEFAULT 0,
    slow_queries_total bigint NOT NULL DEFAULT 0,
    login_failures bigint NOT NULL DEFAULT 0,
    queue_latency_sum_ms bigint NOT NULL DEFAULT 0,
    queue_latency_max_ms bigint NOT NULL DEFAULT 0,
    queue_mutations bigint NOT NULL DEFAULT 0,
    synced_rows_total bigint NOT NULL DEFAULT 0,
    sync_duration_total_ms bigint NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS sync_dead_letters (
    source_id text PRIMARY KEY,
    payment_intent_id text,
    payload jsonb NOT NULL DEFAULT 'null'::jsonb,
    error text NOT NULL,
    retry_count integer NOT NULL DEFAULT 1,
    next_retry_at timestamptz NOT NULL,
    last_failed_at timestamptz NOT NULL,
    resolved_at timestamptz,
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_dead_letters_retry
    ON sync_dead_letters (next_retry_at) WHERE resolved_at IS NULL;
";

/// Create the locally-owned tables if they do not exist yet.
pub async fn ensure_local_schema(client: &Client) -> Result<()> {
    client.batch_execute(LOCAL_SCHEMA).await?;
    info!("local fulfillment schema is in place");
    Ok(())
}

/// Create the sync-state singleton row if missing.
pub async fn ensure_state_row(client: &Client) -> Result<()> {
    client
        .execute(
            "INSERT INTO sync_state (id) VALUES (1) ON CONFLICT (id) DO NOTHING",
            &[],
        )
        .await?;
    Ok(())
}
