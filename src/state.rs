//! Sync state and telemetry persistence types.
//!
//! The sync state is a process-wide singleton row: last-observed source
//! watermark, run bookkeeping, failure streak, and the cumulative counters
//! read by the out-of-scope readiness endpoint. Mutations go through
//! [`SyncStateUpdate`], which only touches fields the caller explicitly set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a sync run reads the source table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Read only rows modified after the stored watermark.
    Delta,
    /// Ignore the watermark and read the entire source table.
    Full,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Delta => "delta",
            SyncMode::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<SyncMode> {
        match s {
            "delta" => Some(SyncMode::Delta),
            "full" => Some(SyncMode::Full),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The singleton sync-state row.
#[derive(Debug, Clone, Serialize)]
pub struct SyncState {
    /// Maximum source modification time observed as of the start of the last
    /// completed run; bounds future delta scans. Never regresses.
    pub watermark: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_duration_ms: Option<i64>,
    pub last_run_rows: i64,
    pub last_run_mode: Option<SyncMode>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    /// Cleared on success; on a partially-failed run it carries the
    /// aggregate "N rows moved to dead letter" note.
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
    pub slow_queries_last_run: i32,
    pub slow_queries_total: i64,

    // Cumulative counters incremented atomically outside the sync lock.
    pub login_failures: i64,
    pub queue_latency_sum_ms: i64,
    pub queue_latency_max_ms: i64,
    pub queue_mutations: i64,
    pub synced_rows_total: i64,
    pub sync_duration_total_ms: i64,
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState {
            watermark: None,
            last_success_at: None,
            last_run_started_at: None,
            last_run_duration_ms: None,
            last_run_rows: 0,
            last_run_mode: None,
            last_full_sync_at: None,
            last_error: None,
            consecutive_failures: 0,
            slow_queries_last_run: 0,
            slow_queries_total: 0,
            login_failures: 0,
            queue_latency_sum_ms: 0,
            queue_latency_max_ms: 0,
            queue_mutations: 0,
            synced_rows_total: 0,
            sync_duration_total_ms: 0,
        }
    }
}

/// Partial update of the sync-state singleton.
///
/// Every field carries an explicit "set this" wrapper: `Option<T>` for
/// non-nullable columns and `Option<Option<T>>` for nullable ones, so a
/// caller can write NULL without clobbering fields it did not mention.
/// The `add_*` fields are atomic increments (`SET x = x + n`), not
/// read-modify-write.
#[derive(Debug, Clone, Default)]
pub struct SyncStateUpdate {
    pub watermark: Option<Option<DateTime<Utc>>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_duration_ms: Option<i64>,
    pub last_run_rows: Option<i64>,
    pub last_run_mode: Option<SyncMode>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<Option<String>>,
    pub consecutive_failures: Option<i32>,
    pub slow_queries_last_run: Option<i32>,
    pub add_slow_queries: Option<i64>,
    pub add_synced_rows: Option<i64>,
    pub add_sync_duration_ms: Option<i64>,
}

impl SyncStateUpdate {
    /// Apply the update to an in-memory state. The Postgres store translates
    /// the same semantics into a single UPDATE statement.
    pub fn apply(&self, state: &mut SyncState) {
        if let Some(watermark) = &self.watermark {
            state.watermark = *watermark;
        }
        if let Some(at) = self.last_success_at {
            state.last_success_at = Some(at);
        }
        if let Some(at) = self.last_run_started_at {
            state.last_run_started_at = Some(at);
        }
        if let Some(ms) = self.last_run_duration_ms {
            state.last_run_duration_ms = Some(ms);
        }
        if let Some(rows) = self.last_run_rows {
            state.last_run_rows = rows;
        }
        if let Some(mode) = self.last_run_mode {
            state.last_run_mode = Some(mode);
        }
        if let Some(at) = self.last_full_sync_at {
            state.last_full_sync_at = Some(at);
        }
        if let Some(error) = &self.last_error {
            state.last_error = error.clone();
        }
        if let Some(n) = self.consecutive_failures {
            state.consecutive_failures = n;
        }
        if let Some(n) = self.slow_queries_last_run {
            state.slow_queries_last_run = n;
        }
        if let Some(n) = self.add_slow_queries {
            state.slow_queries_total += n;
        }
        if let Some(n) = self.add_synced_rows {
            state.synced_rows_total += n;
        }
        if let Some(n) = self.add_sync_duration_ms {
            state.sync_duration_total_ms += n;
        }
    }
}

/// Read model of the sync state cached in-process for cheap staleness checks
/// and served to the readiness endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub watermark: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_duration_ms: Option<i64>,
    pub last_run_rows: i64,
    pub last_run_mode: Option<SyncMode>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
    pub slow_queries_last_run: i32,
    pub slow_queries_total: i64,
    pub synced_rows_total: i64,
    pub sync_duration_total_ms: i64,
}

impl From<&SyncState> for TelemetrySnapshot {
    fn from(state: &SyncState) -> Self {
        TelemetrySnapshot {
            watermark: state.watermark,
            last_success_at: state.last_success_at,
            last_run_started_at: state.last_run_started_at,
            last_run_duration_ms: state.last_run_duration_ms,
            last_run_rows: state.last_run_rows,
            last_run_mode: state.last_run_mode,
            last_full_sync_at: state.last_full_sync_at,
            last_error: state.last_error.clone(),
            consecutive_failures: state.consecutive_failures,
            slow_queries_last_run: state.slow_queries_last_run,
            slow_queries_total: state.slow_queries_total,
            synced_rows_total: state.synced_rows_total,
            sync_duration_total_ms: state.sync_duration_total_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_only_touches_set_fields() {
        let mut state = SyncState {
            watermark: Some(Utc::now()),
            last_error: Some("old error".into()),
            consecutive_failures: 3,
            slow_queries_total: 10,
            ..SyncState::default()
        };
        let old_watermark = state.watermark;

        let update = SyncStateUpdate {
            last_error: Some(None),
            consecutive_failures: Some(0),
            add_slow_queries: Some(2),
            ..SyncStateUpdate::default()
        };
        update.apply(&mut state);

        assert_eq!(state.watermark, old_watermark);
        assert_eq!(state.last_error, None);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.slow_queries_total, 12);
    }

    #[test]
    fn watermark_can_be_set_to_null_explicitly() {
        let mut state = SyncState {
            watermark: Some(Utc::now()),
            ..SyncState::default()
        };
        let update = SyncStateUpdate {
            watermark: Some(None),
            ..SyncStateUpdate::default()
        };
        update.apply(&mut state);
        assert_eq!(state.watermark, None);
    }

    #[test]
    fn mode_round_trips_through_strings() {
        assert_eq!(SyncMode::parse(SyncMode::Delta.as_str()), Some(SyncMode::Delta));
        assert_eq!(SyncMode::parse(SyncMode::Full.as_str()), Some(SyncMode::Full));
        assert_eq!(SyncMode::parse("hourly"), None);
    }
}
