//! Sync orchestration.
//!
//! # Design Overview
//!
//! A sync run moves through mode selection, lock acquisition, source
//! availability check, row collection, reconciliation, and state
//! persistence, all inside one database transaction that also holds the
//! advisory lock:
//!
//! 1. Mode is `full` when forced, when no successful sync exists yet, or
//!    when the full-reconciliation interval has elapsed; otherwise `delta`.
//! 2. Failing to acquire the lock means another instance is already
//!    syncing; the run completes as a no-op with zero rows processed.
//! 3. Delta/full rows are merged with ready dead-letter retries (retries
//!    win on conflict) and applied in ascending source-modification order,
//!    so the persisted watermark equals the maximum modification time
//!    observed at run start and future delta scans stay bounded even while
//!    individual rows keep failing.
//! 4. One row's failure never aborts the batch: it is recorded into the
//!    dead-letter store with exponential backoff and the run moves on.
//!
//! The engine also owns the in-process coordination state: the cached
//! telemetry snapshot consulted by [`SyncEngine::is_stale`], the shared
//! in-flight future handed to concurrent non-forced callers, and the
//! cooldown window for background triggers. All of it lives in an
//! explicitly constructed engine instance; there are no module-level
//! singletons.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::dead_letter::DeadLetterEntry;
use crate::job::SourceRow;
use crate::normalize::normalize;
use crate::state::{SyncMode, SyncState, SyncStateUpdate, TelemetrySnapshot};
use crate::store::{SyncRun, SyncStore};

/// What a caller is asking for.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncRequest {
    /// Bypass the trigger cooldown and in-flight sharing (manual endpoint).
    pub force: bool,
    /// Force full reconciliation regardless of the stored watermark.
    pub full: bool,
}

impl SyncRequest {
    /// A background run fired by the staleness trigger.
    pub fn background() -> Self {
        SyncRequest {
            force: false,
            full: false,
        }
    }

    /// A manually requested run.
    pub fn manual(full: bool) -> Self {
        SyncRequest { force: true, full }
    }
}

/// Terminal disposition of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Rows were collected and reconciled (possibly zero).
    Completed,
    /// Nothing to do: empty candidate set and no watermark movement.
    NoChanges,
    /// Another instance holds the sync lock.
    LockBusy,
    /// The foreign source table does not exist yet.
    SourceMissing,
}

/// Result of a completed (non-erroring) sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub mode: SyncMode,
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub dead_lettered: u64,
    pub watermark: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl SyncReport {
    fn empty(outcome: SyncOutcome, mode: SyncMode, started_at: DateTime<Utc>) -> Self {
        SyncReport {
            outcome,
            mode,
            processed: 0,
            inserted: 0,
            updated: 0,
            dead_lettered: 0,
            watermark: None,
            started_at,
            duration_ms: 0,
        }
    }
}

/// Error shared between concurrent awaiters of the same run.
#[derive(Clone)]
struct SharedRunError(Arc<anyhow::Error>);

impl SharedRunError {
    fn into_anyhow(self) -> anyhow::Error {
        anyhow::anyhow!("{:#}", self.0)
    }
}

type SharedRunFuture = Shared<BoxFuture<'static, Result<SyncReport, SharedRunError>>>;

struct InflightRun {
    id: u64,
    forced: bool,
    future: SharedRunFuture,
}

struct EngineInner {
    store: Arc<dyn SyncStore>,
    config: SyncConfig,
    /// Telemetry snapshot refreshed after each run; consulted by the cheap
    /// staleness check instead of a database read.
    telemetry: RwLock<Option<TelemetrySnapshot>>,
    inflight: Mutex<Option<InflightRun>>,
    last_trigger: Mutex<Option<Instant>>,
    run_seq: AtomicU64,
}

/// The sync orchestrator. Cheap to clone; all clones share the same
/// in-process coordination state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn SyncStore>, config: SyncConfig) -> Self {
        SyncEngine {
            inner: Arc::new(EngineInner {
                store,
                config,
                telemetry: RwLock::new(None),
                inflight: Mutex::new(None),
                last_trigger: Mutex::new(None),
                run_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Run a sync, sharing the pending result with concurrent non-forced
    /// callers instead of starting a duplicate transaction.
    pub async fn sync(&self, request: SyncRequest) -> Result<SyncReport> {
        // Decide under the lock (atomically), but perform every `.await`
        // outside the guard's scope so no `MutexGuard` is held across an
        // await point and the future stays `Send`.
        let mut join_future: Option<SharedRunFuture> = None;
        let new_run = {
            let mut inflight = self.inner.inflight.lock().unwrap();

            if !request.force {
                if let Some(run) = inflight.as_ref() {
                    // Join an in-flight non-forced run; a forced run is not
                    // shared with background callers, so fall through and
                    // let the advisory lock no-op the duplicate.
                    if !run.forced {
                        join_future = Some(run.future.clone());
                    }
                }
            }

            if join_future.is_some() {
                None
            } else {
                let run_id = self.inner.run_seq.fetch_add(1, Ordering::Relaxed);
                let inner = self.inner.clone();
                let future: SharedRunFuture = async move {
                    Self::run_once(inner, request)
                        .await
                        .map_err(|e| SharedRunError(Arc::new(e)))
                }
                .boxed()
                .shared();

                *inflight = Some(InflightRun {
                    id: run_id,
                    forced: request.force,
                    future: future.clone(),
                });
                Some((run_id, future))
            }
        };

        if let Some(future) = join_future {
            return future.await.map_err(SharedRunError::into_anyhow);
        }

        let (run_id, future) = new_run.expect("new run present when not joining");
        let result = future.await;

        let mut inflight = self.inner.inflight.lock().unwrap();
        if inflight.as_ref().map(|run| run.id) == Some(run_id) {
            *inflight = None;
        }
        drop(inflight);

        result.map_err(SharedRunError::into_anyhow)
    }

    /// Whether the replica is stale: no successful sync has ever completed,
    /// or the last one is older than `max_age`. Reads only the in-process
    /// cache, so it is safe to call on every request.
    pub fn is_stale(&self, max_age: chrono::Duration) -> bool {
        let snapshot = self.inner.telemetry.read().unwrap();
        match snapshot.as_ref().and_then(|t| t.last_success_at) {
            None => true,
            Some(at) => Utc::now() - at > max_age,
        }
    }

    /// Fire a background sync when the replica is stale. Returns `true` when
    /// a run was scheduled; never blocks on the run itself. A cooldown
    /// window suppresses repeated triggers from concurrent observers.
    pub fn trigger_if_stale(&self, max_age: chrono::Duration) -> bool {
        if !self.is_stale(max_age) {
            return false;
        }

        {
            let mut last = self.inner.last_trigger.lock().unwrap();
            if let Some(at) = *last {
                if at.elapsed() < self.inner.config.trigger_cooldown {
                    return false;
                }
            }
            *last = Some(Instant::now());
        }

        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.sync(SyncRequest::background()).await {
                warn!("background sync failed: {e:#}");
            }
        });
        true
    }

    /// Re-read the sync state and refresh the cached telemetry snapshot.
    pub async fn refresh_telemetry(&self) -> Result<TelemetrySnapshot> {
        let state = self.inner.store.load_state().await?;
        let snapshot = TelemetrySnapshot::from(&state);
        *self.inner.telemetry.write().unwrap() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// The cached telemetry snapshot, if any run or refresh has populated it.
    pub fn telemetry(&self) -> Option<TelemetrySnapshot> {
        self.inner.telemetry.read().unwrap().clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    async fn run_once(inner: Arc<EngineInner>, request: SyncRequest) -> Result<SyncReport> {
        let started_at = Utc::now();
        let timer = Instant::now();

        match Self::execute(&inner, request, started_at, timer).await {
            Ok(report) => {
                info!(
                    outcome = ?report.outcome,
                    mode = %report.mode,
                    processed = report.processed,
                    inserted = report.inserted,
                    updated = report.updated,
                    dead_lettered = report.dead_lettered,
                    duration_ms = report.duration_ms,
                    "sync run finished"
                );
                Self::refresh_cache(&inner).await;
                Ok(report)
            }
            Err(error) => {
                warn!("sync run failed: {error:#}");
                if let Err(persist_error) =
                    inner.store.record_run_failure(&format!("{error:#}")).await
                {
                    warn!("failed to persist sync failure: {persist_error:#}");
                }
                Self::refresh_cache(&inner).await;
                Err(error)
            }
        }
    }

    async fn refresh_cache(inner: &Arc<EngineInner>) {
        match inner.store.load_state().await {
            Ok(state) => {
                *inner.telemetry.write().unwrap() = Some(TelemetrySnapshot::from(&state));
            }
            Err(e) => warn!("failed to refresh telemetry snapshot: {e:#}"),
        }
    }

    async fn execute(
        inner: &Arc<EngineInner>,
        request: SyncRequest,
        started_at: DateTime<Utc>,
        timer: Instant,
    ) -> Result<SyncReport> {
        let config = &inner.config;
        let mut run = inner.store.begin().await?;

        let state = run.state().await?;
        let mode = select_mode(&request, &state, config, started_at);
        debug!(mode = %mode, watermark = ?state.watermark, "selected sync mode");

        if !run.try_acquire_lock().await? {
            info!("sync lock busy, another instance is syncing");
            return Ok(SyncReport::empty(SyncOutcome::LockBusy, mode, started_at));
        }

        let capabilities = run.source_capabilities().await?;
        if !capabilities.jobs_table {
            // Freshly provisioned environment: report a healthy empty run
            // instead of erroring.
            info!("source table absent, completing as empty run");
            let mut update = run_bookkeeping(run.as_mut(), mode, started_at, timer, 0, 0);
            update.watermark = Some(None);
            if mode == SyncMode::Full {
                update.last_full_sync_at = Some(started_at);
            }
            run.write_state(update).await?;
            run.commit().await?;
            let mut report = SyncReport::empty(SyncOutcome::SourceMissing, mode, started_at);
            report.duration_ms = timer.elapsed().as_millis() as i64;
            return Ok(report);
        }

        // Captured before row iteration: the persisted watermark reflects
        // what the source looked like at run start, not which rows applied.
        let observed_watermark = run.source_watermark().await?;

        let since = match mode {
            SyncMode::Delta => state.watermark,
            SyncMode::Full => None,
        };
        let changed = run.source_rows_since(since).await?;

        let retries = run.ready_dead_letters(started_at).await?;
        let retry_ids: Vec<String> = retries.iter().map(|e| e.source_id.clone()).collect();
        let retry_rows = if retry_ids.is_empty() {
            Vec::new()
        } else {
            run.source_rows_by_ids(&retry_ids).await?
        };

        let mut dead_lettered = 0u64;

        // Retry ids whose source row has vanished upstream are recorded as a
        // failure with a distinct message, without aborting the run.
        let found: HashSet<&str> = retry_rows.iter().map(|r| r.id.as_str()).collect();
        for entry in retries
            .iter()
            .filter(|e| !found.contains(e.source_id.as_str()))
        {
            let next = DeadLetterEntry::next_attempt(
                Some(entry),
                &config.retry,
                &entry.source_id,
                entry.payment_intent_id.clone(),
                entry.payload.clone(),
                "source row no longer exists".to_string(),
                started_at,
            );
            warn!(source_id = %entry.source_id, "retry row deleted upstream");
            run.record_failure(&next).await?;
            dead_lettered += 1;
        }

        let prior_entries: HashMap<String, DeadLetterEntry> = retries
            .into_iter()
            .map(|e| (e.source_id.clone(), e))
            .collect();

        let candidates = merge_candidates(changed, retry_rows);
        debug!(candidates = candidates.len(), "collected candidate rows");

        if candidates.is_empty() && !watermark_advanced(state.watermark, observed_watermark) {
            let mut update =
                run_bookkeeping(run.as_mut(), mode, started_at, timer, 0, dead_lettered);
            if mode == SyncMode::Full {
                // An empty full scan still covered the whole table.
                update.last_full_sync_at = Some(started_at);
            }
            run.write_state(update).await?;
            run.commit().await?;
            let mut report = SyncReport::empty(SyncOutcome::NoChanges, mode, started_at);
            report.watermark = state.watermark;
            report.dead_lettered = dead_lettered;
            report.duration_ms = timer.elapsed().as_millis() as i64;
            return Ok(report);
        }

        let candidate_ids: Vec<String> = candidates.iter().map(|r| r.id.clone()).collect();
        let existing = run.existing_job_ids(&candidate_ids).await?;
        let mut queue_position = run.max_queue_position().await?;

        let mut inserted = 0u64;
        let mut updated = 0u64;

        for row in &candidates {
            let job = match normalize(row) {
                Ok(job) => job,
                Err(error) => {
                    debug!(source_id = %row.id, %error, "row failed validation");
                    dead_lettered += 1;
                    Self::dead_letter_row(
                        run.as_mut(),
                        config,
                        &prior_entries,
                        row,
                        error.to_string(),
                        started_at,
                    )
                    .await?;
                    continue;
                }
            };

            let applied = if existing.contains(&job.id) {
                run.update_job(&job).await.map(|()| false)
            } else {
                queue_position += 1;
                run.insert_job(&job, queue_position).await.map(|()| true)
            };

            match applied {
                Ok(was_insert) => {
                    if was_insert {
                        inserted += 1;
                    } else {
                        updated += 1;
                    }
                    run.resolve_dead_letter(&job.id, started_at).await?;
                }
                Err(error) => {
                    // A single row's persistence error takes the same path
                    // as a validation failure.
                    warn!(source_id = %row.id, "row failed to persist: {error:#}");
                    dead_lettered += 1;
                    if !existing.contains(&job.id) {
                        queue_position -= 1;
                    }
                    Self::dead_letter_row(
                        run.as_mut(),
                        config,
                        &prior_entries,
                        row,
                        format!("{error:#}"),
                        started_at,
                    )
                    .await?;
                }
            }
        }

        let processed = inserted + updated;
        let new_watermark = match (state.watermark, observed_watermark) {
            (Some(stored), Some(observed)) => Some(stored.max(observed)),
            (stored, observed) => observed.or(stored),
        };

        let mut update = run_bookkeeping(
            run.as_mut(),
            mode,
            started_at,
            timer,
            processed,
            dead_lettered,
        );
        update.watermark = Some(new_watermark);
        if mode == SyncMode::Full {
            update.last_full_sync_at = Some(started_at);
        }
        run.write_state(update).await?;
        run.commit().await?;

        Ok(SyncReport {
            outcome: SyncOutcome::Completed,
            mode,
            processed,
            inserted,
            updated,
            dead_lettered,
            watermark: new_watermark,
            started_at,
            duration_ms: timer.elapsed().as_millis() as i64,
        })
    }

    async fn dead_letter_row(
        run: &mut dyn SyncRun,
        config: &SyncConfig,
        prior_entries: &HashMap<String, DeadLetterEntry>,
        row: &SourceRow,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let prior = match prior_entries.get(&row.id) {
            Some(entry) => Some(entry.clone()),
            None => run.dead_letter(&row.id).await?,
        };
        let entry = DeadLetterEntry::next_attempt(
            prior.as_ref(),
            &config.retry,
            &row.id,
            row.payment_intent_id.clone(),
            row.payload(),
            error,
            now,
        );
        run.record_failure(&entry).await
    }
}

/// Select the run mode; pure, persists nothing.
fn select_mode(
    request: &SyncRequest,
    state: &SyncState,
    config: &SyncConfig,
    now: DateTime<Utc>,
) -> SyncMode {
    if request.full || state.last_success_at.is_none() {
        return SyncMode::Full;
    }
    match state.last_full_sync_at {
        Some(at) if now - at < config.full_sync_interval => SyncMode::Delta,
        _ => SyncMode::Full,
    }
}

/// Merge delta/full rows with retry rows (retries win on id conflict) and
/// re-sort by modification time ascending; ids break ties so the order is
/// deterministic. Rows with no modification time sort first.
fn merge_candidates(changed: Vec<SourceRow>, retries: Vec<SourceRow>) -> Vec<SourceRow> {
    let mut by_id: BTreeMap<String, SourceRow> = BTreeMap::new();
    for row in changed {
        by_id.insert(row.id.clone(), row);
    }
    for row in retries {
        by_id.insert(row.id.clone(), row);
    }
    let mut merged: Vec<SourceRow> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    merged
}

fn watermark_advanced(stored: Option<DateTime<Utc>>, observed: Option<DateTime<Utc>>) -> bool {
    match (stored, observed) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(stored), Some(observed)) => observed > stored,
    }
}

/// Bookkeeping written at the end of every successful run: success time,
/// run stats, cleared-or-aggregate error, reset failure streak, slow-query
/// counters, and cumulative sync totals.
fn run_bookkeeping(
    run: &mut dyn SyncRun,
    mode: SyncMode,
    started_at: DateTime<Utc>,
    timer: Instant,
    processed: u64,
    dead_lettered: u64,
) -> SyncStateUpdate {
    let duration_ms = timer.elapsed().as_millis() as i64;
    let last_error = if dead_lettered > 0 {
        Some(format!("{dead_lettered} rows moved to dead letter"))
    } else {
        None
    };
    let slow = run.slow_queries();
    SyncStateUpdate {
        last_success_at: Some(Utc::now()),
        last_run_started_at: Some(started_at),
        last_run_duration_ms: Some(duration_ms),
        last_run_rows: Some(processed as i64),
        last_run_mode: Some(mode),
        last_error: Some(last_error),
        consecutive_failures: Some(0),
        slow_queries_last_run: Some(slow),
        add_slow_queries: Some(slow as i64),
        add_synced_rows: Some(processed as i64),
        add_sync_duration_ms: Some(duration_ms),
        ..SyncStateUpdate::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn state_with(
        last_success_at: Option<DateTime<Utc>>,
        last_full_sync_at: Option<DateTime<Utc>>,
    ) -> SyncState {
        SyncState {
            last_success_at,
            last_full_sync_at,
            ..SyncState::default()
        }
    }

    fn row(id: &str, updated_secs: i64) -> SourceRow {
        SourceRow {
            id: id.to_string(),
            payment_intent_id: Some(format!("pi_{id}")),
            total: Some(100.0),
            currency: Some("usd".into()),
            line_items: Some(serde_json::json!([])),
            shipping: None,
            metadata: None,
            user_id: None,
            customer_email: None,
            payment_method: None,
            status: None,
            fulfillment_status: None,
            fulfilled_at: None,
            created_at: Some(Utc.timestamp_opt(updated_secs, 0).unwrap()),
            updated_at: Some(Utc.timestamp_opt(updated_secs, 0).unwrap()),
        }
    }

    #[test]
    fn mode_is_full_without_prior_success() {
        let config = SyncConfig::default();
        let now = Utc::now();
        let mode = select_mode(
            &SyncRequest::background(),
            &state_with(None, None),
            &config,
            now,
        );
        assert_eq!(mode, SyncMode::Full);
    }

    #[test]
    fn mode_is_full_when_requested() {
        let config = SyncConfig::default();
        let now = Utc::now();
        let state = state_with(Some(now), Some(now));
        let mode = select_mode(&SyncRequest::manual(true), &state, &config, now);
        assert_eq!(mode, SyncMode::Full);
    }

    #[test]
    fn mode_is_full_after_interval_elapses() {
        let config = SyncConfig::default();
        let now = Utc::now();
        let stale_full = now - config.full_sync_interval - Duration::minutes(1);
        let mode = select_mode(
            &SyncRequest::background(),
            &state_with(Some(now), Some(stale_full)),
            &config,
            now,
        );
        assert_eq!(mode, SyncMode::Full);
    }

    #[test]
    fn mode_is_delta_between_reconciliations() {
        let config = SyncConfig::default();
        let now = Utc::now();
        let recent_full = now - Duration::minutes(10);
        let mode = select_mode(
            &SyncRequest::background(),
            &state_with(Some(now), Some(recent_full)),
            &config,
            now,
        );
        assert_eq!(mode, SyncMode::Delta);
    }

    #[test]
    fn merge_prefers_retry_rows_and_sorts_ascending() {
        let changed = vec![row("b", 200), row("a", 100)];
        let mut retry_b = row("b", 150);
        retry_b.total = Some(999.0);
        let merged = merge_candidates(changed, vec![retry_b]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, "a");
        assert_eq!(merged[1].id, "b");
        // Retry row won the conflict.
        assert_eq!(merged[1].total, Some(999.0));
    }

    #[test]
    fn merge_sorts_missing_timestamps_first() {
        let mut no_ts = row("z", 0);
        no_ts.updated_at = None;
        let merged = merge_candidates(vec![row("a", 100), no_ts], Vec::new());
        assert_eq!(merged[0].id, "z");
        assert_eq!(merged[1].id, "a");
    }

    #[test]
    fn watermark_advance_checks() {
        let t1 = Utc.timestamp_opt(1000, 0).unwrap();
        let t2 = Utc.timestamp_opt(2000, 0).unwrap();
        assert!(watermark_advanced(None, Some(t1)));
        assert!(watermark_advanced(Some(t1), Some(t2)));
        assert!(!watermark_advanced(Some(t2), Some(t1)));
        assert!(!watermark_advanced(Some(t1), Some(t1)));
        assert!(!watermark_advanced(Some(t1), None));
        assert!(!watermark_advanced(None, None));
    }
}
