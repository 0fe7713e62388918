//! Test infrastructure: an in-memory [`SyncStore`] with the same
//! transactional semantics as the PostgreSQL backend, plus source-row
//! fixture builders.
//!
//! Runs buffer their writes and apply them atomically on commit; a dropped
//! run discards its buffer and releases the lock, mirroring transaction
//! rollback. Failure injection knobs cover per-row persistence errors and
//! whole-run read errors.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::config::SyncConfig;
use crate::dead_letter::DeadLetterEntry;
use crate::job::{DestinationJob, NormalizedJob, SourceRow};
use crate::state::{SyncState, SyncStateUpdate};
use crate::store::{SourceCapabilities, SyncRun, SyncStore};

#[derive(Default)]
struct MemoryInner {
    source_present: bool,
    checkout_present: bool,
    source_rows: Vec<SourceRow>,
    jobs: BTreeMap<String, DestinationJob>,
    dead_letters: BTreeMap<String, DeadLetterEntry>,
    state: SyncState,
    lock_held: bool,
    begin_count: u64,
    fail_inserts: HashSet<String>,
    fail_source_reads: bool,
    source_read_delay: Option<std::time::Duration>,
    simulated_slow_queries: i32,
}

/// In-memory sync store. Clones share the same underlying data, so tests
/// keep one handle for fixtures while the engine owns another.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    config: SyncConfig,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new(SyncConfig::default())
    }
}

impl MemoryStore {
    pub fn new(config: SyncConfig) -> Self {
        MemoryStore {
            inner: Arc::new(Mutex::new(MemoryInner {
                source_present: true,
                ..MemoryInner::default()
            })),
            config,
        }
    }

    // ── Fixture surface ─────────────────────────────────────────

    pub fn add_source_row(&self, row: SourceRow) {
        self.inner.lock().unwrap().source_rows.push(row);
    }

    pub fn remove_source_row(&self, id: &str) {
        self.inner
            .lock()
            .unwrap()
            .source_rows
            .retain(|row| row.id != id);
    }

    pub fn set_source_present(&self, present: bool) {
        self.inner.lock().unwrap().source_present = present;
    }

    pub fn set_checkout_present(&self, present: bool) {
        self.inner.lock().unwrap().checkout_present = present;
    }

    pub fn job(&self, id: &str) -> Option<DestinationJob> {
        self.inner.lock().unwrap().jobs.get(id).cloned()
    }

    pub fn jobs(&self) -> Vec<DestinationJob> {
        self.inner.lock().unwrap().jobs.values().cloned().collect()
    }

    pub fn dead_letter_entry(&self, id: &str) -> Option<DeadLetterEntry> {
        self.inner.lock().unwrap().dead_letters.get(id).cloned()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.inner
            .lock()
            .unwrap()
            .dead_letters
            .values()
            .cloned()
            .collect()
    }

    pub fn state(&self) -> SyncState {
        self.inner.lock().unwrap().state.clone()
    }

    pub fn mutate_state(&self, mutate: impl FnOnce(&mut SyncState)) {
        mutate(&mut self.inner.lock().unwrap().state);
    }

    pub fn mutate_job(&self, id: &str, mutate: impl FnOnce(&mut DestinationJob)) {
        if let Some(job) = self.inner.lock().unwrap().jobs.get_mut(id) {
            mutate(job);
        }
    }

    pub fn insert_dead_letter(&self, entry: DeadLetterEntry) {
        self.inner
            .lock()
            .unwrap()
            .dead_letters
            .insert(entry.source_id.clone(), entry);
    }

    pub fn begin_count(&self) -> u64 {
        self.inner.lock().unwrap().begin_count
    }

    // ── Failure injection ───────────────────────────────────────

    /// Make the next insert of `id` fail with a simulated persistence error.
    pub fn fail_insert_of(&self, id: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_inserts
            .insert(id.to_string());
    }

    pub fn set_fail_source_reads(&self, fail: bool) {
        self.inner.lock().unwrap().fail_source_reads = fail;
    }

    /// Delay source reads, holding runs open long enough for concurrency
    /// tests to observe them.
    pub fn set_source_read_delay(&self, delay: std::time::Duration) {
        self.inner.lock().unwrap().source_read_delay = Some(delay);
    }

    pub fn set_simulated_slow_queries(&self, count: i32) {
        self.inner.lock().unwrap().simulated_slow_queries = count;
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn SyncRun>> {
        let slow = {
            let mut inner = self.inner.lock().unwrap();
            inner.begin_count += 1;
            inner.simulated_slow_queries
        };
        Ok(Box::new(MemoryRun {
            inner: self.inner.clone(),
            config: self.config.clone(),
            locked: false,
            writes: Vec::new(),
            slow,
        }))
    }

    async fn load_state(&self) -> Result<SyncState> {
        Ok(self.inner.lock().unwrap().state.clone())
    }

    async fn apply_state(&self, update: SyncStateUpdate) -> Result<()> {
        update.apply(&mut self.inner.lock().unwrap().state);
        Ok(())
    }

    async fn record_run_failure(&self, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.last_error = Some(error.to_string());
        inner.state.consecutive_failures += 1;
        Ok(())
    }

    async fn record_login_failure(&self) -> Result<()> {
        self.inner.lock().unwrap().state.login_failures += 1;
        Ok(())
    }

    async fn record_queue_mutation_latency(&self, elapsed_ms: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.queue_latency_sum_ms += elapsed_ms;
        inner.state.queue_latency_max_ms = inner.state.queue_latency_max_ms.max(elapsed_ms);
        inner.state.queue_mutations += 1;
        Ok(())
    }
}

enum WriteOp {
    Insert(NormalizedJob, i64),
    Update(NormalizedJob),
    Failure(DeadLetterEntry),
    Resolve(String, DateTime<Utc>),
    State(SyncStateUpdate),
}

struct MemoryRun {
    inner: Arc<Mutex<MemoryInner>>,
    config: SyncConfig,
    locked: bool,
    writes: Vec<WriteOp>,
    slow: i32,
}

impl MemoryRun {
    async fn source_read_guard(&self) -> Result<()> {
        let (delay, fail) = {
            let inner = self.inner.lock().unwrap();
            (inner.source_read_delay, inner.fail_source_reads)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            bail!("simulated source read failure");
        }
        Ok(())
    }
}

#[async_trait]
impl SyncRun for MemoryRun {
    async fn try_acquire_lock(&mut self) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.lock_held {
            return Ok(false);
        }
        inner.lock_held = true;
        self.locked = true;
        Ok(true)
    }

    async fn state(&mut self) -> Result<SyncState> {
        Ok(self.inner.lock().unwrap().state.clone())
    }

    async fn source_capabilities(&mut self) -> Result<SourceCapabilities> {
        let inner = self.inner.lock().unwrap();
        Ok(SourceCapabilities {
            jobs_table: inner.source_present,
            checkout_table: inner.checkout_present,
        })
    }

    async fn source_watermark(&mut self) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .source_rows
            .iter()
            .filter_map(|row| row.updated_at)
            .max())
    }

    async fn source_rows_since(&mut self, since: Option<DateTime<Utc>>) -> Result<Vec<SourceRow>> {
        self.source_read_guard().await?;
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<SourceRow> = inner
            .source_rows
            .iter()
            .filter(|row| match (since, row.updated_at) {
                (None, _) => true,
                (Some(since), Some(updated)) => updated > since,
                (Some(_), None) => false,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn source_rows_by_ids(&mut self, ids: &[String]) -> Result<Vec<SourceRow>> {
        self.source_read_guard().await?;
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .source_rows
            .iter()
            .filter(|row| wanted.contains(row.id.as_str()))
            .cloned()
            .collect())
    }

    async fn ready_dead_letters(&mut self, now: DateTime<Utc>) -> Result<Vec<DeadLetterEntry>> {
        let inner = self.inner.lock().unwrap();
        let mut ready: Vec<DeadLetterEntry> = inner
            .dead_letters
            .values()
            .filter(|entry| {
                entry.resolved_at.is_none()
                    && entry.retry_count < self.config.retry.max_retries
                    && entry.next_retry_at <= now
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.next_retry_at.cmp(&b.next_retry_at));
        ready.truncate(self.config.retry_batch.max(0) as usize);
        Ok(ready)
    }

    async fn dead_letter(&mut self, source_id: &str) -> Result<Option<DeadLetterEntry>> {
        // Prefer writes buffered in this run over the committed view.
        for op in self.writes.iter().rev() {
            if let WriteOp::Failure(entry) = op {
                if entry.source_id == source_id {
                    return Ok(Some(entry.clone()));
                }
            }
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .dead_letters
            .get(source_id)
            .cloned())
    }

    async fn record_failure(&mut self, entry: &DeadLetterEntry) -> Result<()> {
        self.writes.push(WriteOp::Failure(entry.clone()));
        Ok(())
    }

    async fn resolve_dead_letter(&mut self, source_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.writes
            .push(WriteOp::Resolve(source_id.to_string(), now));
        Ok(())
    }

    async fn existing_job_ids(&mut self, ids: &[String]) -> Result<HashSet<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .filter(|id| inner.jobs.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn max_queue_position(&mut self) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .map(|job| job.queue_position)
            .max()
            .unwrap_or(0))
    }

    async fn insert_job(&mut self, job: &NormalizedJob, queue_position: i64) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_inserts.remove(&job.id) {
                bail!("simulated insert failure for {}", job.id);
            }
        }
        self.writes.push(WriteOp::Insert(job.clone(), queue_position));
        Ok(())
    }

    async fn update_job(&mut self, job: &NormalizedJob) -> Result<()> {
        self.writes.push(WriteOp::Update(job.clone()));
        Ok(())
    }

    async fn write_state(&mut self, update: SyncStateUpdate) -> Result<()> {
        self.writes.push(WriteOp::State(update));
        Ok(())
    }

    fn slow_queries(&self) -> i32 {
        self.slow
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        for op in self.writes.drain(..) {
            match op {
                WriteOp::Insert(job, position) => {
                    inner
                        .jobs
                        .insert(job.id.clone(), DestinationJob::from_normalized(&job, position, now));
                }
                WriteOp::Update(job) => {
                    if let Some(existing) = inner.jobs.get_mut(&job.id) {
                        existing.apply_normalized(&job, now);
                    }
                }
                WriteOp::Failure(entry) => {
                    inner.dead_letters.insert(entry.source_id.clone(), entry);
                }
                WriteOp::Resolve(id, at) => {
                    if let Some(entry) = inner.dead_letters.get_mut(&id) {
                        if entry.resolved_at.is_none() {
                            entry.resolved_at = Some(at);
                        }
                    }
                }
                WriteOp::State(update) => update.apply(&mut inner.state),
            }
        }
        if self.locked {
            inner.lock_held = false;
            self.locked = false;
        }
        Ok(())
    }
}

impl Drop for MemoryRun {
    fn drop(&mut self) {
        // Rollback semantics: discard buffered writes, release the lock.
        if self.locked {
            self.inner.lock().unwrap().lock_held = false;
        }
    }
}

// ── Fixture builders ────────────────────────────────────────────

/// Fixed base instant fixtures count from.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// A fully valid source row modified `offset_minutes` after [`base_time`].
pub fn valid_row(id: &str, offset_minutes: i64) -> SourceRow {
    let updated = base_time() + chrono::Duration::minutes(offset_minutes);
    SourceRow {
        id: id.to_string(),
        payment_intent_id: Some(format!("pi_{id}")),
        total: Some(2500.0),
        currency: Some("USD".into()),
        line_items: Some(serde_json::json!([{"sku": "bracket", "qty": 1}])),
        shipping: Some(serde_json::json!({"method": "pickup"})),
        metadata: None,
        user_id: Some("user-1".into()),
        customer_email: Some("maker@example.com".into()),
        payment_method: Some("card".into()),
        status: Some("paid".into()),
        fulfillment_status: Some("pending".into()),
        fulfilled_at: None,
        created_at: Some(base_time()),
        updated_at: Some(updated),
    }
}

/// A row that fails validation (missing total).
pub fn row_missing_total(id: &str, offset_minutes: i64) -> SourceRow {
    let mut row = valid_row(id, offset_minutes);
    row.total = None;
    row
}
