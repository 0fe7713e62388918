//! Storage abstraction driven by the sync orchestrator.
//!
//! A [`SyncStore`] opens [`SyncRun`]s: one transaction per sync run, holding
//! the advisory lock for its lifetime. The production backend lives in
//! [`crate::postgres`]; [`crate::testing`] provides an in-memory
//! implementation with the same semantics for tests.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dead_letter::DeadLetterEntry;
use crate::job::{NormalizedJob, SourceRow};
use crate::state::{SyncState, SyncStateUpdate};

/// Which foreign tables are present, resolved once per run.
///
/// The companion checkout table may or may not exist depending on the
/// MakerWorks deployment; its absence only downgrades the read strategy,
/// it never fails a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceCapabilities {
    pub jobs_table: bool,
    pub checkout_table: bool,
}

impl SourceCapabilities {
    pub fn read_strategy(&self) -> ReadStrategy {
        if self.checkout_table {
            ReadStrategy::Joined
        } else {
            ReadStrategy::Bare
        }
    }
}

/// How source rows are read: joined with the companion checkout table, or
/// from the job table alone with the checkout-owned fields left NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    Joined,
    Bare,
}

/// Store-level operations available outside a sync transaction.
///
/// The counter methods are atomic increments usable by concurrent writers
/// (API handlers, queue mutations) while a sync run is in flight.
#[async_trait]
pub trait SyncStore: Send + Sync + 'static {
    /// Open a sync run: one connection, one transaction.
    async fn begin(&self) -> Result<Box<dyn SyncRun>>;

    /// Read the sync-state singleton, creating it if missing.
    async fn load_state(&self) -> Result<SyncState>;

    /// Partially update the sync-state singleton outside a run transaction.
    async fn apply_state(&self, update: SyncStateUpdate) -> Result<()>;

    /// Persist a whole-run failure: set the error message and increment the
    /// consecutive-failure streak by one, atomically.
    async fn record_run_failure(&self, error: &str) -> Result<()>;

    /// Atomic `login_failures + 1`, used by the authentication layer.
    async fn record_login_failure(&self) -> Result<()>;

    /// Atomic queue-mutation latency accumulation (sum, max, count), used by
    /// the dashboard's reorder paths.
    async fn record_queue_mutation_latency(&self, elapsed_ms: i64) -> Result<()>;
}

/// One sync transaction.
///
/// Dropping a run without calling [`SyncRun::commit`] rolls the transaction
/// back, which also releases the advisory lock.
#[async_trait]
pub trait SyncRun: Send {
    /// Attempt the transaction-scoped advisory lock. `false` means another
    /// instance is syncing; the caller must treat the run as a no-op.
    async fn try_acquire_lock(&mut self) -> Result<bool>;

    /// Read the sync-state singleton inside this transaction, creating it
    /// idempotently on first use.
    async fn state(&mut self) -> Result<SyncState>;

    /// Probe which foreign tables exist.
    async fn source_capabilities(&mut self) -> Result<SourceCapabilities>;

    /// Maximum modification time currently visible at the source.
    async fn source_watermark(&mut self) -> Result<Option<DateTime<Utc>>>;

    /// Source rows modified strictly after `since` (all rows when `None`),
    /// ordered by modification time ascending.
    async fn source_rows_since(&mut self, since: Option<DateTime<Utc>>) -> Result<Vec<SourceRow>>;

    /// Current source rows for the given ids. Ids deleted upstream are simply
    /// absent from the result.
    async fn source_rows_by_ids(&mut self, ids: &[String]) -> Result<Vec<SourceRow>>;

    /// Unresolved dead-letter entries whose retry time has passed and whose
    /// retry count is under the cap, ordered by retry time ascending and
    /// bounded by the configured batch size.
    async fn ready_dead_letters(&mut self, now: DateTime<Utc>) -> Result<Vec<DeadLetterEntry>>;

    /// Look up a dead-letter entry regardless of resolution state.
    async fn dead_letter(&mut self, source_id: &str) -> Result<Option<DeadLetterEntry>>;

    /// Upsert a dead-letter entry keyed by source id.
    async fn record_failure(&mut self, entry: &DeadLetterEntry) -> Result<()>;

    /// Mark an outstanding dead-letter entry resolved; no-op when there is
    /// none or it is already resolved.
    async fn resolve_dead_letter(&mut self, source_id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Which of the candidate ids already exist in the destination table.
    async fn existing_job_ids(&mut self, ids: &[String]) -> Result<HashSet<String>>;

    /// Current maximum queue position among destination jobs (0 when empty).
    async fn max_queue_position(&mut self) -> Result<i64>;

    /// Insert a new destination row with the given queue position and
    /// locally-owned fields in their untouched state.
    async fn insert_job(&mut self, job: &NormalizedJob, queue_position: i64) -> Result<()>;

    /// Update the MakerWorks-origin fields of an existing destination row,
    /// leaving locally-owned fields untouched.
    async fn update_job(&mut self, job: &NormalizedJob) -> Result<()>;

    /// Partially update the sync-state singleton inside this transaction.
    async fn write_state(&mut self, update: SyncStateUpdate) -> Result<()>;

    /// Queries in this run that exceeded the slow-query threshold.
    fn slow_queries(&self) -> i32;

    /// Commit the transaction, releasing the advisory lock.
    async fn commit(self: Box<Self>) -> Result<()>;
}
