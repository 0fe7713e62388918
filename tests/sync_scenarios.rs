//! Scenario-level tests for the sync engine, run against the in-memory
//! store from `makerworks_sync::testing`.

use std::sync::Arc;

use chrono::{Duration, Utc};

use makerworks_sync::dead_letter::DeadLetterEntry;
use makerworks_sync::testing::{base_time, row_missing_total, valid_row, MemoryStore};
use makerworks_sync::{SyncConfig, SyncEngine, SyncMode, SyncOutcome, SyncRequest};

fn engine_over(store: &MemoryStore) -> SyncEngine {
    SyncEngine::new(Arc::new(store.clone()), store_config())
}

fn store_config() -> SyncConfig {
    SyncConfig {
        trigger_cooldown: std::time::Duration::from_secs(10),
        ..SyncConfig::default()
    }
}

// ── Scenario A: fresh source, forced full sync ──────────────────

#[tokio::test]
async fn full_sync_inserts_all_new_rows() {
    let store = MemoryStore::new(store_config());
    for i in 0..101 {
        store.add_source_row(valid_row(&format!("mw-{i:03}"), i));
    }
    let engine = engine_over(&store);

    let report = engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("sync should succeed");

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(report.processed, 101);
    assert_eq!(report.inserted, 101);
    assert_eq!(report.updated, 0);
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(report.watermark, Some(base_time() + Duration::minutes(100)));

    // Queue positions are strictly increasing in modification order.
    let mut jobs = store.jobs();
    jobs.sort_by_key(|job| job.source_updated_at);
    let positions: Vec<i64> = jobs.iter().map(|job| job.queue_position).collect();
    assert_eq!(positions, (1..=101).collect::<Vec<i64>>());

    let state = store.state();
    assert_eq!(state.watermark, report.watermark);
    assert_eq!(state.last_run_rows, 101);
    assert_eq!(state.last_run_mode, Some(SyncMode::Full));
    assert!(state.last_full_sync_at.is_some());
    assert_eq!(state.last_error, None);
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(state.synced_rows_total, 101);
}

// ── Scenario B: mixed inserts and updates ───────────────────────

#[tokio::test]
async fn full_sync_updates_existing_and_inserts_new() {
    let store = MemoryStore::new(store_config());
    for i in 0..50 {
        store.add_source_row(valid_row(&format!("mw-{i:03}"), i));
    }
    let engine = engine_over(&store);
    engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("seed sync should succeed");
    assert_eq!(store.jobs().len(), 50);

    for i in 50..101 {
        store.add_source_row(valid_row(&format!("mw-{i:03}"), i));
    }
    let report = engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("second sync should succeed");

    assert_eq!(report.updated, 50);
    assert_eq!(report.inserted, 51);
    assert_eq!(report.processed, 101);
    assert!(store.dead_letters().is_empty());
}

// ── Scenario C: source table absent ─────────────────────────────

#[tokio::test]
async fn missing_source_table_is_a_healthy_empty_run() {
    let store = MemoryStore::new(store_config());
    store.set_source_present(false);
    let engine = engine_over(&store);

    let report = engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("sync should not error");

    assert_eq!(report.outcome, SyncOutcome::SourceMissing);
    assert_eq!(report.processed, 0);
    assert_eq!(report.watermark, None);

    let state = store.state();
    assert_eq!(state.watermark, None);
    assert!(state.last_success_at.is_some());
    assert!(state.last_full_sync_at.is_some());
    assert_eq!(state.consecutive_failures, 0);
}

// ── Scenario D: retry row deleted upstream ──────────────────────

#[tokio::test]
async fn deleted_retry_row_is_recorded_permanently() {
    let store = MemoryStore::new(store_config());
    let config = store_config();
    store.insert_dead_letter(DeadLetterEntry {
        source_id: "mw-gone".into(),
        payment_intent_id: Some("pi_mw-gone".into()),
        payload: serde_json::json!({"id": "mw-gone"}),
        error: "total is missing".into(),
        retry_count: 1,
        next_retry_at: Utc::now() - Duration::minutes(1),
        last_failed_at: Utc::now() - Duration::hours(1),
        resolved_at: None,
    });
    let engine = SyncEngine::new(Arc::new(store.clone()), config);

    let report = engine
        .sync(SyncRequest::background())
        .await
        .expect("sync should not error");

    assert_eq!(report.processed, 0);
    assert_eq!(report.inserted, 0);
    assert_eq!(report.updated, 0);
    assert_eq!(report.dead_lettered, 1);

    let entry = store.dead_letter_entry("mw-gone").expect("entry kept");
    assert_eq!(entry.retry_count, 2);
    assert_eq!(entry.error, "source row no longer exists");
    assert!(entry.resolved_at.is_none());
    assert!(store.job("mw-gone").is_none());
}

// ── Scenario E: staleness detection ─────────────────────────────

#[tokio::test]
async fn staleness_follows_last_successful_sync() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(valid_row("mw-001", 0));
    let engine = engine_over(&store);

    // No successful sync has ever completed.
    assert!(engine.is_stale(Duration::hours(24)));

    engine
        .sync(SyncRequest::background())
        .await
        .expect("sync should succeed");
    assert!(!engine.is_stale(Duration::minutes(5)));

    // Simulate time passing since the last success.
    store.mutate_state(|state| {
        state.last_success_at = Some(Utc::now() - Duration::minutes(10));
    });
    engine.refresh_telemetry().await.expect("refresh");
    assert!(engine.is_stale(Duration::minutes(5)));
    assert!(!engine.is_stale(Duration::minutes(30)));
}

// ── Idempotence ─────────────────────────────────────────────────

#[tokio::test]
async fn rerun_without_source_changes_is_a_no_op() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(valid_row("mw-001", 0));
    store.add_source_row(valid_row("mw-002", 5));
    let engine = engine_over(&store);

    let first = engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("first sync");
    assert_eq!(first.processed, 2);

    let second = engine
        .sync(SyncRequest::background())
        .await
        .expect("second sync");
    assert_eq!(second.outcome, SyncOutcome::NoChanges);
    assert_eq!(second.processed, 0);
    assert_eq!(second.watermark, first.watermark);
    assert_eq!(store.state().watermark, first.watermark);

    // The empty run still refreshes the staleness signal.
    assert!(store.state().last_success_at.is_some());
}

// ── Delta exclusion ─────────────────────────────────────────────

#[tokio::test]
async fn delta_runs_skip_rows_at_or_below_the_watermark() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(valid_row("mw-001", 10));
    store.add_source_row(valid_row("mw-002", 20));
    let engine = engine_over(&store);
    engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("seed sync");

    // Rewrite mw-001 in place without bumping its modification time, and add
    // a genuinely new row.
    store.remove_source_row("mw-001");
    let mut unbumped = valid_row("mw-001", 10);
    unbumped.total = Some(9999.0);
    store.add_source_row(unbumped);
    store.add_source_row(valid_row("mw-003", 30));

    let report = engine
        .sync(SyncRequest::background())
        .await
        .expect("delta sync");

    assert_eq!(report.mode, SyncMode::Delta);
    assert_eq!(report.processed, 1);
    assert_eq!(report.inserted, 1);
    // The unbumped rewrite was not picked up.
    assert_eq!(store.job("mw-001").unwrap().total, 2500);
}

// ── At-most-one-writer ──────────────────────────────────────────

#[tokio::test]
async fn concurrent_background_callers_share_one_run() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(valid_row("mw-001", 0));
    store.set_source_read_delay(std::time::Duration::from_millis(50));
    let engine = engine_over(&store);
    let other = engine.clone();

    let (first, second) = tokio::join!(
        engine.sync(SyncRequest::background()),
        other.sync(SyncRequest::background()),
    );
    let first = first.expect("first caller");
    let second = second.expect("second caller");

    // Both callers observed the same run; only one transaction was opened.
    assert_eq!(store.begin_count(), 1);
    assert_eq!(first.processed, 1);
    assert_eq!(second.processed, 1);
    assert_eq!(first.started_at, second.started_at);
}

#[tokio::test]
async fn second_instance_no_ops_on_lock_contention() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(valid_row("mw-001", 0));
    store.set_source_read_delay(std::time::Duration::from_millis(100));

    // Two engines over the same database model two application instances.
    let instance_a = engine_over(&store);
    let instance_b = engine_over(&store);

    let (a, b) = tokio::join!(
        instance_a.sync(SyncRequest::manual(false)),
        instance_b.sync(SyncRequest::manual(false)),
    );
    let a = a.expect("instance a");
    let b = b.expect("instance b");

    let outcomes = [a.outcome, b.outcome];
    assert!(outcomes.contains(&SyncOutcome::Completed));
    assert!(outcomes.contains(&SyncOutcome::LockBusy));

    let busy = if a.outcome == SyncOutcome::LockBusy { &a } else { &b };
    assert_eq!(busy.processed, 0);
    assert_eq!(store.jobs().len(), 1);
}

// ── Per-row failure isolation ───────────────────────────────────

#[tokio::test]
async fn one_bad_row_never_aborts_the_batch() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(valid_row("mw-001", 1));
    store.add_source_row(row_missing_total("mw-002", 2));
    store.add_source_row(valid_row("mw-003", 3));
    let engine = engine_over(&store);

    let report = engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("partial failure is still a successful run");

    assert_eq!(report.processed, 2);
    assert_eq!(report.dead_lettered, 1);

    let entry = store.dead_letter_entry("mw-002").expect("dead letter");
    assert_eq!(entry.retry_count, 1);
    assert!(entry.error.contains("total"));
    assert!(entry.resolved_at.is_none());

    // Partial row failure is not a run failure.
    let state = store.state();
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(state.last_error.as_deref(), Some("1 rows moved to dead letter"));

    // The watermark still covers the failed row, so it will come back via
    // the retry path rather than a rescan.
    assert_eq!(store.state().watermark, Some(base_time() + Duration::minutes(3)));
}

#[tokio::test]
async fn persistence_errors_take_the_dead_letter_path() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(valid_row("mw-001", 1));
    store.add_source_row(valid_row("mw-002", 2));
    store.add_source_row(valid_row("mw-003", 3));
    store.fail_insert_of("mw-002");
    let engine = engine_over(&store);

    let report = engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("run should complete");

    assert_eq!(report.inserted, 2);
    assert_eq!(report.dead_lettered, 1);
    let entry = store.dead_letter_entry("mw-002").expect("dead letter");
    assert!(entry.error.contains("simulated insert failure"));

    // Queue positions stay dense across the failed insert.
    let mut positions: Vec<i64> = store.jobs().iter().map(|j| j.queue_position).collect();
    positions.sort_unstable();
    assert_eq!(positions, vec![1, 2]);
}

#[tokio::test]
async fn recovered_rows_resolve_their_dead_letters() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(row_missing_total("mw-001", 1));
    let engine = engine_over(&store);
    engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("first run");
    assert!(store.dead_letter_entry("mw-001").is_some());
    assert!(store.job("mw-001").is_none());

    // The source row is fixed upstream; make the retry eligible now.
    store.remove_source_row("mw-001");
    store.add_source_row(valid_row("mw-001", 1));
    let past = Utc::now() - Duration::seconds(1);
    let mut entry = store.dead_letter_entry("mw-001").unwrap();
    entry.next_retry_at = past;
    store.insert_dead_letter(entry);

    let report = engine
        .sync(SyncRequest::background())
        .await
        .expect("retry run");

    assert_eq!(report.processed, 1);
    assert!(store.job("mw-001").is_some());
    let entry = store.dead_letter_entry("mw-001").expect("kept for audit");
    assert!(entry.resolved_at.is_some());
}

// ── Locally-owned fields ────────────────────────────────────────

#[tokio::test]
async fn sync_updates_never_touch_dashboard_owned_fields() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(valid_row("mw-001", 1));
    let engine = engine_over(&store);
    engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("seed sync");

    let viewed = Utc::now();
    store.mutate_job("mw-001", |job| {
        job.viewed_at = Some(viewed);
        job.invoiced_at = Some(viewed);
        job.queue_position = 42;
    });

    // The source row changes and gets re-synced.
    store.remove_source_row("mw-001");
    let mut bumped = valid_row("mw-001", 60);
    bumped.total = Some(7000.0);
    bumped.status = Some("in_production".into());
    store.add_source_row(bumped);

    let report = engine
        .sync(SyncRequest::background())
        .await
        .expect("update sync");
    assert_eq!(report.updated, 1);

    let job = store.job("mw-001").unwrap();
    assert_eq!(job.total, 7000);
    assert_eq!(job.viewed_at, Some(viewed));
    assert_eq!(job.invoiced_at, Some(viewed));
    assert_eq!(job.queue_position, 42);
}

#[tokio::test]
async fn queue_positions_continue_from_the_existing_maximum() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(valid_row("mw-001", 1));
    store.add_source_row(valid_row("mw-002", 2));
    let engine = engine_over(&store);
    engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("seed sync");

    store.add_source_row(valid_row("mw-003", 10));
    engine
        .sync(SyncRequest::background())
        .await
        .expect("delta sync");

    assert_eq!(store.job("mw-003").unwrap().queue_position, 3);
}

// ── Whole-run failure ───────────────────────────────────────────

#[tokio::test]
async fn run_level_errors_increment_the_failure_streak() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(valid_row("mw-001", 1));
    let engine = engine_over(&store);
    engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("seed sync");
    let watermark = store.state().watermark;

    store.set_fail_source_reads(true);
    let error = engine
        .sync(SyncRequest::manual(false))
        .await
        .expect_err("run should fail");
    assert!(error.to_string().contains("simulated source read failure"));

    let state = store.state();
    assert_eq!(state.consecutive_failures, 1);
    assert!(state
        .last_error
        .as_deref()
        .unwrap()
        .contains("simulated source read failure"));
    // Watermark and processed counters are untouched by a failed run.
    assert_eq!(state.watermark, watermark);

    // The next successful run clears the streak.
    store.set_fail_source_reads(false);
    engine
        .sync(SyncRequest::manual(false))
        .await
        .expect("recovery run");
    let state = store.state();
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(state.last_error, None);
}

// ── Staleness trigger ───────────────────────────────────────────

#[tokio::test]
async fn trigger_fires_once_per_cooldown_window() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(valid_row("mw-001", 0));
    let engine = engine_over(&store);

    assert!(engine.trigger_if_stale(Duration::minutes(5)));
    // Concurrent observers inside the cooldown window do not re-fire.
    assert!(!engine.trigger_if_stale(Duration::minutes(5)));

    // Wait for the background run to land.
    for _ in 0..100 {
        if store.state().last_success_at.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(store.state().last_success_at.is_some());

    engine.refresh_telemetry().await.expect("refresh");
    assert!(!engine.trigger_if_stale(Duration::minutes(5)));
}

// ── Open question: retry rows older than the destination ────────

// A dead-lettered row can reappear at the source with an older modification
// time than data already applied; the engine accepts last-write-wins by
// modification-time ordering rather than special-casing it.
#[tokio::test]
async fn older_retry_rows_overwrite_by_design() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(valid_row("mw-001", 100));
    let engine = engine_over(&store);
    engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("seed sync");
    assert_eq!(store.job("mw-001").unwrap().total, 2500);

    // The row reappears older than what the destination already holds, via
    // the retry path.
    store.remove_source_row("mw-001");
    let mut older = valid_row("mw-001", 50);
    older.total = Some(1111.0);
    store.add_source_row(older);
    store.insert_dead_letter(DeadLetterEntry {
        source_id: "mw-001".into(),
        payment_intent_id: Some("pi_mw-001".into()),
        payload: serde_json::Value::Null,
        error: "earlier failure".into(),
        retry_count: 1,
        next_retry_at: Utc::now() - Duration::seconds(1),
        last_failed_at: Utc::now() - Duration::hours(1),
        resolved_at: None,
    });

    let report = engine
        .sync(SyncRequest::background())
        .await
        .expect("retry run");
    assert_eq!(report.updated, 1);
    assert_eq!(store.job("mw-001").unwrap().total, 1111);
}

// ── Telemetry counters ──────────────────────────────────────────

#[tokio::test]
async fn cumulative_counters_accumulate_across_writers() {
    use makerworks_sync::SyncStore;

    let store = MemoryStore::new(store_config());
    store.record_login_failure().await.expect("counter");
    store.record_login_failure().await.expect("counter");
    store.record_queue_mutation_latency(40).await.expect("counter");
    store.record_queue_mutation_latency(15).await.expect("counter");

    let state = store.state();
    assert_eq!(state.login_failures, 2);
    assert_eq!(state.queue_mutations, 2);
    assert_eq!(state.queue_latency_sum_ms, 55);
    assert_eq!(state.queue_latency_max_ms, 40);
}

#[tokio::test]
async fn slow_query_counters_overwrite_per_run_and_accumulate() {
    let store = MemoryStore::new(store_config());
    store.add_source_row(valid_row("mw-001", 1));
    store.set_simulated_slow_queries(3);
    let engine = engine_over(&store);
    engine
        .sync(SyncRequest::manual(true))
        .await
        .expect("first run");

    let state = store.state();
    assert_eq!(state.slow_queries_last_run, 3);
    assert_eq!(state.slow_queries_total, 3);

    store.set_simulated_slow_queries(1);
    store.add_source_row(valid_row("mw-002", 2));
    engine
        .sync(SyncRequest::background())
        .await
        .expect("second run");

    let state = store.state();
    assert_eq!(state.slow_queries_last_run, 1);
    assert_eq!(state.slow_queries_total, 4);
}
