//! PostgreSQL backend for the sync engine.
//!
//! One connection per sync run. The run drives its transaction explicitly
//! (`BEGIN` / `COMMIT`); dropping the run without committing closes the
//! connection, which aborts the transaction server-side and releases the
//! advisory lock with it. Store-level operations (telemetry reads, atomic
//! counter bumps, failure persistence) open short-lived connections of
//! their own and never touch the run transaction.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::dead_letter::DeadLetterEntry;
use crate::job::{NormalizedJob, SourceRow};
use crate::state::{SyncState, SyncStateUpdate};
use crate::store::{SourceCapabilities, SyncRun, SyncStore};

pub mod schema;
pub mod source;
pub mod state;

/// Open a connection and spawn its driver task onto the runtime.
pub async fn connect(database_url: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .context("failed to connect to PostgreSQL")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("postgres connection error: {e}");
        }
    });
    Ok(client)
}

/// Production [`SyncStore`] backed by PostgreSQL.
pub struct PgSyncStore {
    database_url: String,
    config: SyncConfig,
}

impl PgSyncStore {
    pub fn new(database_url: impl Into<String>, config: SyncConfig) -> Self {
        PgSyncStore {
            database_url: database_url.into(),
            config,
        }
    }

    /// Create the locally-owned tables if needed.
    pub async fn ensure_schema(&self) -> Result<()> {
        let client = connect(&self.database_url).await?;
        schema::ensure_local_schema(&client).await
    }

    async fn control_connection(&self) -> Result<Client> {
        let client = connect(&self.database_url).await?;
        schema::ensure_state_row(&client).await?;
        Ok(client)
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn begin(&self) -> Result<Box<dyn SyncRun>> {
        let client = connect(&self.database_url).await?;
        client.batch_execute("BEGIN").await?;
        Ok(Box::new(PgSyncRun {
            client,
            config: self.config.clone(),
            slow_queries: 0,
            capabilities: None,
        }))
    }

    async fn load_state(&self) -> Result<SyncState> {
        let client = self.control_connection().await?;
        let row = client.query_one(state::SELECT_STATE, &[]).await?;
        state::map_state_row(&row)
    }

    async fn apply_state(&self, update: SyncStateUpdate) -> Result<()> {
        let mode = update.last_run_mode.map(|m| m.as_str().to_string());
        let Some((sql, params)) = state::build_state_update(&update, &mode) else {
            return Ok(());
        };
        let client = self.control_connection().await?;
        client.execute(&sql, &params).await?;
        Ok(())
    }

    async fn record_run_failure(&self, error: &str) -> Result<()> {
        let client = self.control_connection().await?;
        client
            .execute(
                "UPDATE sync_state SET last_error = $1, \
                 consecutive_failures = consecutive_failures + 1 WHERE id = 1",
                &[&error],
            )
            .await?;
        Ok(())
    }

    async fn record_login_failure(&self) -> Result<()> {
        let client = self.control_connection().await?;
        client
            .execute(
                "UPDATE sync_state SET login_failures = login_failures + 1 WHERE id = 1",
                &[],
            )
            .await?;
        Ok(())
    }

    async fn record_queue_mutation_latency(&self, elapsed_ms: i64) -> Result<()> {
        let client = self.control_connection().await?;
        client
            .execute(
                "UPDATE sync_state SET queue_latency_sum_ms = queue_latency_sum_ms + $1, \
                 queue_latency_max_ms = greatest(queue_latency_max_ms, $1), \
                 queue_mutations = queue_mutations + 1 WHERE id = 1",
                &[&elapsed_ms],
            )
            .await?;
        Ok(())
    }
}

/// One sync transaction on its own connection.
pub struct PgSyncRun {
    client: Client,
    config: SyncConfig,
    slow_queries: i32,
    /// Probed once per run; the read strategy must not flip mid-transaction.
    capabilities: Option<SourceCapabilities>,
}

impl PgSyncRun {
    async fn query(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>> {
        let started = Instant::now();
        let rows = self.client.query(sql, params).await?;
        self.note_elapsed(sql, started);
        Ok(rows)
    }

    async fn execute(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        let started = Instant::now();
        let affected = self.client.execute(sql, params).await?;
        self.note_elapsed(sql, started);
        Ok(affected)
    }

    fn note_elapsed(&mut self, sql: &str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed > self.config.slow_query {
            self.slow_queries += 1;
            let fragment: String = sql.chars().take(60).collect();
            warn!(elapsed_ms = elapsed.as_millis() as u64, %fragment, "slow sync query");
        }
    }

    /// Run a single-row write under a savepoint so a failing statement does
    /// not poison the surrounding transaction; the row is dead-lettered and
    /// the batch continues.
    async fn apply_row(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<()> {
        self.client.batch_execute("SAVEPOINT apply_row").await?;
        match self.execute(sql, params).await {
            Ok(_) => {
                self.client.batch_execute("RELEASE SAVEPOINT apply_row").await?;
                Ok(())
            }
            Err(error) => {
                if let Err(rollback_error) = self
                    .client
                    .batch_execute("ROLLBACK TO SAVEPOINT apply_row")
                    .await
                {
                    warn!("failed to roll back row savepoint: {rollback_error}");
                }
                Err(error)
            }
        }
    }
}

#[async_trait]
impl SyncRun for PgSyncRun {
    async fn try_acquire_lock(&mut self) -> Result<bool> {
        let key = self.config.lock_key;
        let rows = self
            .query("SELECT pg_try_advisory_xact_lock($1)", &[&key])
            .await?;
        Ok(rows[0].try_get::<_, bool>(0)?)
    }

    async fn state(&mut self) -> Result<SyncState> {
        self.execute(
            "INSERT INTO sync_state (id) VALUES (1) ON CONFLICT (id) DO NOTHING",
            &[],
        )
        .await?;
        let rows = self.query(state::SELECT_STATE, &[]).await?;
        state::map_state_row(&rows[0])
    }

    async fn source_capabilities(&mut self) -> Result<SourceCapabilities> {
        if let Some(capabilities) = self.capabilities {
            return Ok(capabilities);
        }
        let jobs = self.config.source_table.clone();
        let checkouts = self.config.checkout_table.clone();
        let rows = self
            .query(
                "SELECT to_regclass($1) IS NOT NULL, to_regclass($2) IS NOT NULL",
                &[&jobs, &checkouts],
            )
            .await?;
        let capabilities = SourceCapabilities {
            jobs_table: rows[0].try_get(0)?,
            checkout_table: rows[0].try_get(1)?,
        };
        debug!(?capabilities, "probed source capabilities");
        self.capabilities = Some(capabilities);
        Ok(capabilities)
    }

    async fn source_watermark(&mut self) -> Result<Option<DateTime<Utc>>> {
        let sql = source::watermark_query(&self.config);
        let rows = self.query(&sql, &[]).await?;
        Ok(rows[0].try_get(0)?)
    }

    async fn source_rows_since(&mut self, since: Option<DateTime<Utc>>) -> Result<Vec<SourceRow>> {
        let strategy = self.source_capabilities().await?.read_strategy();
        let sql = source::rows_query(&self.config, strategy, since.is_some());
        let rows = match since {
            Some(since) => self.query(&sql, &[&since]).await?,
            None => self.query(&sql, &[]).await?,
        };
        rows.iter().map(source::decode_row).collect()
    }

    async fn source_rows_by_ids(&mut self, ids: &[String]) -> Result<Vec<SourceRow>> {
        let strategy = self.source_capabilities().await?.read_strategy();
        let sql = source::rows_by_ids_query(&self.config, strategy);
        let ids: Vec<String> = ids.to_vec();
        let rows = self.query(&sql, &[&ids]).await?;
        rows.iter().map(source::decode_row).collect()
    }

    async fn ready_dead_letters(&mut self, now: DateTime<Utc>) -> Result<Vec<DeadLetterEntry>> {
        let sql = format!(
            "{} WHERE resolved_at IS NULL AND retry_count < $1 AND next_retry_at <= $2 \
             ORDER BY next_retry_at ASC LIMIT $3",
            state::SELECT_DEAD_LETTER
        );
        let max_retries = self.config.retry.max_retries;
        let batch = self.config.retry_batch;
        let rows = self.query(&sql, &[&max_retries, &now, &batch]).await?;
        rows.iter().map(state::map_dead_letter_row).collect()
    }

    async fn dead_letter(&mut self, source_id: &str) -> Result<Option<DeadLetterEntry>> {
        let sql = format!("{} WHERE source_id = $1", state::SELECT_DEAD_LETTER);
        let rows = self.query(&sql, &[&source_id]).await?;
        rows.first().map(state::map_dead_letter_row).transpose()
    }

    async fn record_failure(&mut self, entry: &DeadLetterEntry) -> Result<()> {
        self.execute(
            "INSERT INTO sync_dead_letters (source_id, payment_intent_id, payload, error, \
             retry_count, next_retry_at, last_failed_at, resolved_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, NULL) \
             ON CONFLICT (source_id) DO UPDATE SET \
             payment_intent_id = excluded.payment_intent_id, \
             payload = excluded.payload, \
             error = excluded.error, \
             retry_count = excluded.retry_count, \
             next_retry_at = excluded.next_retry_at, \
             last_failed_at = excluded.last_failed_at, \
             resolved_at = NULL",
            &[
                &entry.source_id,
                &entry.payment_intent_id,
                &entry.payload,
                &entry.error,
                &entry.retry_count,
                &entry.next_retry_at,
                &entry.last_failed_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn resolve_dead_letter(&mut self, source_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.execute(
            "UPDATE sync_dead_letters SET resolved_at = $2 \
             WHERE source_id = $1 AND resolved_at IS NULL",
            &[&source_id, &now],
        )
        .await?;
        Ok(())
    }

    async fn existing_job_ids(&mut self, ids: &[String]) -> Result<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let ids: Vec<String> = ids.to_vec();
        let rows = self
            .query("SELECT id FROM jobs WHERE id = ANY($1)", &[&ids])
            .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<_, String>(0)?))
            .collect()
    }

    async fn max_queue_position(&mut self) -> Result<i64> {
        let rows = self
            .query("SELECT coalesce(max(queue_position), 0) FROM jobs", &[])
            .await?;
        Ok(rows[0].try_get(0)?)
    }

    async fn insert_job(&mut self, job: &NormalizedJob, queue_position: i64) -> Result<()> {
        let status = job.status.as_str();
        let fulfillment = job.fulfillment_status.as_str();
        self.apply_row(
            "INSERT INTO jobs (id, payment_intent_id, total, currency, line_items, shipping, \
             metadata, user_id, customer_email, payment_method, status, fulfillment_status, \
             fulfilled_at, source_created_at, source_updated_at, queue_position) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            &[
                &job.id,
                &job.payment_intent_id,
                &job.total,
                &job.currency,
                &job.line_items,
                &job.shipping,
                &job.metadata,
                &job.user_id,
                &job.customer_email,
                &job.payment_method,
                &status,
                &fulfillment,
                &job.fulfilled_at,
                &job.created_at,
                &job.updated_at,
                &queue_position,
            ],
        )
        .await
    }

    async fn update_job(&mut self, job: &NormalizedJob) -> Result<()> {
        let status = job.status.as_str();
        let fulfillment = job.fulfillment_status.as_str();
        // Locally-owned columns (queue_position, viewed_at, invoiced_at,
        // receipted_at) are deliberately absent from the SET list.
        self.apply_row(
            "UPDATE jobs SET payment_intent_id = $2, total = $3, currency = $4, \
             line_items = $5, shipping = $6, metadata = $7, user_id = $8, \
             customer_email = $9, payment_method = $10, status = $11, \
             fulfillment_status = $12, fulfilled_at = $13, source_created_at = $14, \
             source_updated_at = $15, synced_at = now() WHERE id = $1",
            &[
                &job.id,
                &job.payment_intent_id,
                &job.total,
                &job.currency,
                &job.line_items,
                &job.shipping,
                &job.metadata,
                &job.user_id,
                &job.customer_email,
                &job.payment_method,
                &status,
                &fulfillment,
                &job.fulfilled_at,
                &job.created_at,
                &job.updated_at,
            ],
        )
        .await
    }

    async fn write_state(&mut self, update: SyncStateUpdate) -> Result<()> {
        let mode = update.last_run_mode.map(|m| m.as_str().to_string());
        let Some((sql, params)) = state::build_state_update(&update, &mode) else {
            return Ok(());
        };
        self.execute(&sql, &params).await?;
        Ok(())
    }

    fn slow_queries(&self) -> i32 {
        self.slow_queries
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }
}
