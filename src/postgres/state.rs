//! Sync-state row mapping and partial-update SQL.

use anyhow::Result;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use crate::dead_letter::DeadLetterEntry;
use crate::state::{SyncMode, SyncState, SyncStateUpdate};

pub const SELECT_STATE: &str = "SELECT watermark, last_success_at, last_run_started_at, \
     last_run_duration_ms, last_run_rows, last_run_mode, last_full_sync_at, last_error, \
     consecutive_failures, slow_queries_last_run, slow_queries_total, login_failures, \
     queue_latency_sum_ms, queue_latency_max_ms, queue_mutations, synced_rows_total, \
     sync_duration_total_ms FROM sync_state WHERE id = 1";

pub fn map_state_row(row: &Row) -> Result<SyncState> {
    let mode: Option<String> = row.try_get("last_run_mode")?;
    Ok(SyncState {
        watermark: row.try_get("watermark")?,
        last_success_at: row.try_get("last_success_at")?,
        last_run_started_at: row.try_get("last_run_started_at")?,
        last_run_duration_ms: row.try_get("last_run_duration_ms")?,
        last_run_rows: row.try_get("last_run_rows")?,
        last_run_mode: mode.as_deref().and_then(SyncMode::parse),
        last_full_sync_at: row.try_get("last_full_sync_at")?,
        last_error: row.try_get("last_error")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        slow_queries_last_run: row.try_get("slow_queries_last_run")?,
        slow_queries_total: row.try_get("slow_queries_total")?,
        login_failures: row.try_get("login_failures")?,
        queue_latency_sum_ms: row.try_get("queue_latency_sum_ms")?,
        queue_latency_max_ms: row.try_get("queue_latency_max_ms")?,
        queue_mutations: row.try_get("queue_mutations")?,
        synced_rows_total: row.try_get("synced_rows_total")?,
        sync_duration_total_ms: row.try_get("sync_duration_total_ms")?,
    })
}

pub const SELECT_DEAD_LETTER: &str = "SELECT source_id, payment_intent_id, payload, error, \
     retry_count, next_retry_at, last_failed_at, resolved_at FROM sync_dead_letters";

pub fn map_dead_letter_row(row: &Row) -> Result<DeadLetterEntry> {
    Ok(DeadLetterEntry {
        source_id: row.try_get("source_id")?,
        payment_intent_id: row.try_get("payment_intent_id")?,
        payload: row.try_get("payload")?,
        error: row.try_get("error")?,
        retry_count: row.try_get("retry_count")?,
        next_retry_at: row.try_get("next_retry_at")?,
        last_failed_at: row.try_get("last_failed_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

/// Translate a [`SyncStateUpdate`] into one UPDATE statement that only
/// touches the fields the caller set. `mode` must be the stringified
/// `last_run_mode` so the borrow can outlive the parameter list.
///
/// Returns `None` when the update is empty.
pub fn build_state_update<'a>(
    update: &'a SyncStateUpdate,
    mode: &'a Option<String>,
) -> Option<(String, Vec<&'a (dyn ToSql + Sync)>)> {
    let mut sets: Vec<String> = Vec::new();
    let mut params: Vec<&'a (dyn ToSql + Sync)> = Vec::new();

    if let Some(watermark) = &update.watermark {
        params.push(watermark);
        sets.push(format!("watermark = ${}", params.len()));
    }
    if let Some(at) = &update.last_success_at {
        params.push(at);
        sets.push(format!("last_success_at = ${}", params.len()));
    }
    if let Some(at) = &update.last_run_started_at {
        params.push(at);
        sets.push(format!("last_run_started_at = ${}", params.len()));
    }
    if let Some(ms) = &update.last_run_duration_ms {
        params.push(ms);
        sets.push(format!("last_run_duration_ms = ${}", params.len()));
    }
    if let Some(rows) = &update.last_run_rows {
        params.push(rows);
        sets.push(format!("last_run_rows = ${}", params.len()));
    }
    if let Some(m) = mode {
        params.push(m);
        sets.push(format!("last_run_mode = ${}", params.len()));
    }
    if let Some(at) = &update.last_full_sync_at {
        params.push(at);
        sets.push(format!("last_full_sync_at = ${}", params.len()));
    }
    if let Some(error) = &update.last_error {
        params.push(error);
        sets.push(format!("last_error = ${}", params.len()));
    }
    if let Some(n) = &update.consecutive_failures {
        params.push(n);
        sets.push(format!("consecutive_failures = ${}", params.len()));
    }
    if let Some(n) = &update.slow_queries_last_run {
        params.push(n);
        sets.push(format!("slow_queries_last_run = ${}", params.len()));
    }
    if let Some(n) = &update.add_slow_queries {
        params.push(n);
        sets.push(format!(
            "slow_queries_total = slow_queries_total + ${}",
            params.len()
        ));
    }
    if let Some(n) = &update.add_synced_rows {
        params.push(n);
        sets.push(format!(
            "synced_rows_total = synced_rows_total + ${}",
            params.len()
        ));
    }
    if let Some(n) = &update.add_sync_duration_ms {
        params.push(n);
        sets.push(format!(
            "sync_duration_total_ms = sync_duration_total_ms + ${}",
            params.len()
        ));
    }

    if sets.is_empty() {
        return None;
    }

    let sql = format!("UPDATE sync_state SET {} WHERE id = 1", sets.join(", "));
    Some((sql, params))
}
