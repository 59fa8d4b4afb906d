//! Leader tick behavior: materialization, intake, assignment, dispatch,
//! and orphan reconciliation against a scriptable control plane.


use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use taskherd::coord::{CoordinationStore, MemoryStore, Role};
use taskherd::leader::{Leader, TickContext};
use taskherd::model::{ConcurrencyPolicy, ContinuationState, JobKind, RunState};
use taskherd::proto::start_job_response::Result as StartResult;
use taskherd::schedule::Schedule;
use taskherd::store::RunStore;

use test_harness::{
    definition, insert_event_definition, insert_manual_definition, insert_time_definition,
    register, test_coord, test_settings, test_store, worker_entry, FakeControlPlane,
};

struct Fixture {
    store: RunStore,
    coord: Arc<MemoryStore>,
    control: Arc<FakeControlPlane>,
    leader: Leader,
}

async fn fixture() -> Fixture {
    let store = test_store().await;
    let coord = test_coord();
    let control = FakeControlPlane::new();
    let dyn_coord: Arc<dyn CoordinationStore> = coord.clone();
    let leader = Leader::new(store.clone(), dyn_coord, control.clone());
    Fixture {
        store,
        coord,
        control,
        leader,
    }
}

fn ctx_at(now: DateTime<Utc>) -> TickContext {
    TickContext {
        worker_id: "w-leader".to_string(),
        epoch: 5,
        settings: test_settings(),
        now,
    }
}

fn minute(hh: u32, mm: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hh, mm, 0).unwrap()
}

#[tokio::test]
async fn materialization_is_idempotent_across_ticks() {
    let f = fixture().await;
    insert_time_definition(&f.store, "every-minute", 1, ConcurrencyPolicy::Allow).await;

    let now = minute(10, 0);
    let first = f.leader.tick(&ctx_at(now)).await.unwrap();
    // Window: backlog cutoff 09:55 through lookahead 10:01.
    assert_eq!(first.created_runs, 7);

    let second = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(second.created_runs, 0, "same slots must not materialize twice");
}

#[tokio::test]
async fn backlog_cutoff_bounds_recovery_after_outage() {
    let f = fixture().await;
    insert_time_definition(&f.store, "every-minute", 1, ConcurrencyPolicy::Allow).await;

    // The leader was dead for 30 minutes; on recovery only the backlog
    // window survives: 5 late slots, the current slot, and the lookahead.
    let now = minute(10, 30);
    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(snapshot.created_runs, 7);

    let cutoff = now - Duration::seconds(300);
    for run in f.store.runs_in_state(RunState::Pending, 100).await.unwrap() {
        assert!(run.scheduled_for.unwrap() >= cutoff);
    }
}

#[tokio::test]
async fn forbid_policy_blocks_new_materialization() {
    let f = fixture().await;
    let def = insert_time_definition(&f.store, "serial", 1, ConcurrencyPolicy::Forbid).await;

    let now = minute(10, 0);
    let first = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert!(first.created_runs > 0);

    // Live runs exist, so the next minute creates nothing new.
    let second = f.leader.tick(&ctx_at(minute(10, 1))).await.unwrap();
    assert_eq!(second.created_runs, 0);

    // Once everything is terminal the definition schedules again.
    for run in f.store.runs_in_state(RunState::Pending, 100).await.unwrap() {
        assert!(f
            .store
            .skip_run(run.id, "drained by test", minute(10, 1))
            .await
            .unwrap());
        assert_eq!(run.job_definition_id, def.id);
    }
    let third = f.leader.tick(&ctx_at(minute(10, 2))).await.unwrap();
    assert!(third.created_runs > 0);
}

#[tokio::test]
async fn events_deduplicate_into_one_run() {
    let f = fixture().await;
    let def = insert_event_definition(&f.store, "on-deploy", "deploy.finished").await;

    let now = minute(9, 0);
    // Two ingestions with the same dedupe key, 10ms apart.
    f.store
        .insert_event("deploy.finished", serde_json::json!({}), Some("k-1"), now)
        .await
        .unwrap();
    f.store
        .insert_event("deploy.finished", serde_json::json!({}), Some("k-1"), now)
        .await
        .unwrap();

    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(snapshot.event_runs, 1);

    let runs = f.store.recent_runs(10).await.unwrap();
    let event_runs: Vec<_> = runs
        .iter()
        .filter(|r| r.job_definition_id == def.id)
        .collect();
    assert_eq!(event_runs.len(), 1);

    // Both event rows are consumed; a second tick creates nothing.
    assert!(f.store.unprocessed_events(10).await.unwrap().is_empty());
    let second = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(second.event_runs, 0);
}

#[tokio::test]
async fn event_fans_out_to_each_subscribed_definition() {
    let f = fixture().await;
    insert_event_definition(&f.store, "notify", "deploy.finished").await;
    insert_event_definition(&f.store, "audit", "deploy.finished").await;
    insert_event_definition(&f.store, "unrelated", "backup.finished").await;

    let now = minute(9, 0);
    f.store
        .insert_event("deploy.finished", serde_json::json!({}), None, now)
        .await
        .unwrap();

    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(snapshot.event_runs, 2);
}

#[tokio::test]
async fn assignment_prefers_least_loaded_non_leader() {
    let f = fixture().await;
    let def = insert_manual_definition(&f.store, "manual").await;
    let now = minute(10, 0);

    register(&f.coord, &worker_entry("w-leader", Role::Leader, now)).await;
    register(&f.coord, &worker_entry("w-2", Role::Worker, now)).await;
    register(&f.coord, &worker_entry("w-3", Role::Worker, now)).await;

    // w-2 already has an assigned run, so w-3 must win the next one.
    let (busy, _) = f
        .store
        .create_run_if_absent(def.id, Some(now - Duration::minutes(1)), "busy", now)
        .await
        .unwrap();
    f.store
        .assign_run(busy.id, busy.version, "w-2", 5, now)
        .await
        .unwrap();

    let (run, _) = f
        .store
        .create_run_if_absent(def.id, Some(now), "next", now)
        .await
        .unwrap();

    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert!(snapshot.assigned_runs >= 1);
    let row = f.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(row.state, RunState::Assigned);
    assert_eq!(row.assigned_worker_id.as_deref(), Some("w-3"));
    assert_eq!(row.leader_epoch, Some(5));
}

#[tokio::test]
async fn leader_is_assigned_only_as_last_resort() {
    let f = fixture().await;
    let def = insert_manual_definition(&f.store, "manual").await;
    let now = minute(10, 0);
    register(&f.coord, &worker_entry("w-leader", Role::Leader, now)).await;

    let (run, _) = f
        .store
        .create_run_if_absent(def.id, Some(now), "only-leader", now)
        .await
        .unwrap();
    f.leader.tick(&ctx_at(now)).await.unwrap();

    let row = f.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(row.assigned_worker_id.as_deref(), Some("w-leader"));
}

#[tokio::test]
async fn detached_draining_and_overloaded_workers_are_not_candidates() {
    let f = fixture().await;
    let def = insert_manual_definition(&f.store, "manual").await;
    let now = minute(10, 0);

    let mut detached = worker_entry("w-detached", Role::Worker, now);
    detached.detached = true;
    register(&f.coord, &detached).await;
    let mut draining = worker_entry("w-draining", Role::Worker, now);
    draining.draining = true;
    register(&f.coord, &draining).await;

    let (run, _) = f
        .store
        .create_run_if_absent(def.id, Some(now), "nobody", now)
        .await
        .unwrap();
    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(snapshot.assigned_runs, 0);
    let row = f.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(row.state, RunState::Pending);
}

#[tokio::test]
async fn dispatch_sends_start_job_with_definition_payload() {
    let f = fixture().await;
    let mut def = definition(
        "payload",
        JobKind::Time,
        Schedule::EveryNMinutes { n: 1 },
        false,
    );
    def.command_name = "run-report".to_string();
    def.default_args = serde_json::json!({"scope": "daily"});
    def.timeout_seconds = 120;
    f.store.insert_definition(&def).await.unwrap();

    let now = minute(10, 0);
    register(&f.coord, &worker_entry("w-2", Role::Worker, now)).await;

    let (run, _) = f
        .store
        .create_run_if_absent(def.id, Some(now - Duration::minutes(1)), "dispatch", now)
        .await
        .unwrap();

    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(snapshot.dispatched_runs, 1);

    let calls = f.control.start_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let (target, request) = &calls[0];
    assert_eq!(target, "127.0.0.1:50051");
    assert_eq!(request.job_run_id, run.id.to_string());
    assert_eq!(request.command_name, "run-report");
    assert_eq!(request.timeout_seconds, 120);
    assert_eq!(request.leader_epoch, 5);
    let args: serde_json::Value = serde_json::from_str(&request.args_json).unwrap();
    assert_eq!(args["scope"], "daily");
}

#[tokio::test]
async fn old_epoch_rejection_makes_leader_step_down() {
    let f = fixture().await;
    let def = insert_manual_definition(&f.store, "manual").await;
    let now = minute(10, 0);
    register(&f.coord, &worker_entry("w-2", Role::Worker, now)).await;
    f.control
        .script_start("127.0.0.1:50051", StartResult::RejectedOldEpoch);

    let (run, _) = f
        .store
        .create_run_if_absent(def.id, Some(now - Duration::minutes(1)), "stale", now)
        .await
        .unwrap();

    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert!(snapshot.saw_newer_epoch);
    // The run itself was not mutated by the rejected dispatch.
    let row = f.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(row.state, RunState::Assigned);
}

#[tokio::test]
async fn refused_dispatch_reassigns_to_another_worker() {
    let f = fixture().await;
    let def = insert_manual_definition(&f.store, "manual").await;
    let now = minute(10, 0);

    let mut w2 = worker_entry("w-2", Role::Worker, now);
    w2.rpc_port = 50052;
    register(&f.coord, &w2).await;
    f.control
        .script_start("127.0.0.1:50052", StartResult::RejectedDraining);

    let (run, _) = f
        .store
        .create_run_if_absent(def.id, Some(now - Duration::minutes(1)), "refused", now)
        .await
        .unwrap();
    f.store
        .assign_run(run.id, run.version, "w-2", 5, now)
        .await
        .unwrap();

    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(snapshot.orphaned_runs, 1);

    // The draining worker now also reports so in the directory; the next
    // tick lands the run on the healthy worker with the attempt bumped.
    let mut w2_draining = worker_entry("w-2", Role::Worker, now);
    w2_draining.rpc_port = 50052;
    w2_draining.draining = true;
    register(&f.coord, &w2_draining).await;
    let mut w3 = worker_entry("w-3", Role::Worker, now);
    w3.rpc_port = 50053;
    register(&f.coord, &w3).await;
    let second = f.leader.tick(&ctx_at(now + Duration::seconds(2))).await.unwrap();
    assert_eq!(second.reassigned_runs, 1);

    let row = f.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(row.state, RunState::Assigned);
    assert_eq!(row.assigned_worker_id.as_deref(), Some("w-3"));
    assert_eq!(row.attempt, 2);
}

#[tokio::test]
async fn crashed_worker_orphans_assigned_run_after_grace() {
    let f = fixture().await;
    let def = insert_manual_definition(&f.store, "manual").await;
    let now = minute(10, 0);

    // w-3 held the run but never heartbeats again; w-4 is healthy.
    register(&f.coord, &worker_entry("w-4", Role::Worker, now)).await;
    let (run, _) = f
        .store
        .create_run_if_absent(def.id, Some(now - Duration::minutes(2)), "crash", now)
        .await
        .unwrap();
    f.store
        .assign_run(
            run.id,
            run.version,
            "w-3",
            5,
            now - Duration::seconds(60),
        )
        .await
        .unwrap();

    // assigned_at is 60s old against a 10s reassign window, so this tick
    // orphans the run.
    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(snapshot.orphaned_runs, 1);

    let second = f.leader.tick(&ctx_at(now + Duration::seconds(2))).await.unwrap();
    assert_eq!(second.reassigned_runs, 1);
    let row = f.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(row.assigned_worker_id.as_deref(), Some("w-4"));
    assert_eq!(row.attempt, 2);
}

#[tokio::test]
async fn fresh_assignment_survives_reassign_window() {
    let f = fixture().await;
    let def = insert_manual_definition(&f.store, "manual").await;
    let now = minute(10, 0);
    register(&f.coord, &worker_entry("w-4", Role::Worker, now)).await;

    let (run, _) = f
        .store
        .create_run_if_absent(def.id, Some(now + Duration::minutes(5)), "fresh", now)
        .await
        .unwrap();
    // Assigned moments ago to a worker that has since vanished.
    f.store
        .assign_run(run.id, run.version, "w-gone", 5, now - Duration::seconds(2))
        .await
        .unwrap();

    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(snapshot.orphaned_runs, 0, "grace window must hold");
}

#[tokio::test]
async fn lost_running_worker_gets_confirming_grace_before_orphan() {
    let f = fixture().await;
    let def = insert_manual_definition(&f.store, "manual").await;
    let now = minute(10, 0);
    register(&f.coord, &worker_entry("w-4", Role::Worker, now)).await;

    let (run, _) = f
        .store
        .create_run_if_absent(def.id, Some(now - Duration::minutes(1)), "lost", now)
        .await
        .unwrap();
    f.store
        .assign_run(run.id, run.version, "w-gone", 5, now - Duration::seconds(60))
        .await
        .unwrap();
    f.store
        .mark_running(run.id, "w-gone", 5, "log", now - Duration::seconds(50))
        .await
        .unwrap();

    // First pass: the vanished worker gets the continuation window, not an
    // immediate orphan, even though reassign_after has long passed.
    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(snapshot.confirming_runs, 1);
    assert_eq!(snapshot.orphaned_runs, 0);
    let row = f.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(row.state, RunState::Running);
    assert_eq!(row.continuation_state, ContinuationState::Confirming);

    // Still confirming: later ticks inside the window leave it alone.
    let mid = f.leader.tick(&ctx_at(now + Duration::seconds(10))).await.unwrap();
    assert_eq!(mid.orphaned_runs, 0);

    // Deadline (30s) lapses without a verdict: now it orphans and is
    // reassigned with the attempt bumped. Keep w-4's heartbeat fresh so it
    // is still a candidate.
    register(
        &f.coord,
        &worker_entry("w-4", Role::Worker, now + Duration::seconds(31)),
    )
    .await;
    let late = f
        .leader
        .tick(&ctx_at(now + Duration::seconds(31)))
        .await
        .unwrap();
    assert_eq!(late.orphaned_runs, 1);
    let second = f
        .leader
        .tick(&ctx_at(now + Duration::seconds(33)))
        .await
        .unwrap();
    assert_eq!(second.reassigned_runs, 1);
    let row = f.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(row.state, RunState::Assigned);
    assert_eq!(row.assigned_worker_id.as_deref(), Some("w-4"));
    assert_eq!(row.attempt, 2);
}

#[tokio::test]
async fn late_assigned_run_is_skipped_not_dispatched() {
    let f = fixture().await;
    let def = insert_manual_definition(&f.store, "manual").await;
    let now = minute(10, 0);
    register(&f.coord, &worker_entry("w-2", Role::Worker, now)).await;

    let (run, _) = f
        .store
        .create_run_if_absent(def.id, Some(now - Duration::minutes(30)), "late", now)
        .await
        .unwrap();
    f.store
        .assign_run(run.id, run.version, "w-2", 5, now - Duration::minutes(29))
        .await
        .unwrap();

    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(snapshot.skipped_runs, 1);
    assert!(f.control.start_calls.lock().unwrap().is_empty());
    let row = f.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(row.state, RunState::Skipped);
}

#[tokio::test]
async fn replace_policy_cancels_older_live_runs() {
    let f = fixture().await;
    let mut def = definition(
        "rolling",
        JobKind::Time,
        Schedule::EveryNMinutes { n: 1 },
        false,
    );
    def.concurrency_policy = ConcurrencyPolicy::Replace;
    f.store.insert_definition(&def).await.unwrap();

    let now = minute(10, 0);
    register(&f.coord, &worker_entry("w-2", Role::Worker, now)).await;
    let mut w3 = worker_entry("w-3", Role::Worker, now);
    w3.rpc_port = 50053;
    register(&f.coord, &w3).await;

    // An older run still executing on w-3.
    let (old, _) = f
        .store
        .create_run_if_absent(def.id, Some(now - Duration::minutes(2)), "old", now)
        .await
        .unwrap();
    f.store
        .assign_run(old.id, old.version, "w-3", 5, now - Duration::minutes(2))
        .await
        .unwrap();
    f.store
        .mark_running(old.id, "w-3", 5, "log", now - Duration::minutes(1))
        .await
        .unwrap();

    // The newer run, already assigned to w-2 and due now.
    let (new, _) = f
        .store
        .create_run_if_absent(def.id, Some(now - Duration::seconds(30)), "new", now)
        .await
        .unwrap();
    f.store
        .assign_run(new.id, new.version, "w-2", 5, now)
        .await
        .unwrap();

    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(snapshot.canceled_runs, 1);
    assert_eq!(snapshot.dispatched_runs, 1);

    let old_row = f.store.get_run(old.id).await.unwrap().unwrap();
    assert_eq!(old_row.state, RunState::Canceled);
    let cancels = f.control.cancel_calls.lock().unwrap();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].0, "127.0.0.1:50053");
}

#[tokio::test]
async fn reload_request_fans_out_to_workers() {
    let f = fixture().await;
    let now = minute(10, 0);
    register(&f.coord, &worker_entry("w-leader", Role::Leader, now)).await;
    let mut w2 = worker_entry("w-2", Role::Worker, now);
    w2.rpc_port = 50052;
    register(&f.coord, &w2).await;

    f.coord
        .set_flag(&taskherd::coord::keys::settings_reload())
        .await
        .unwrap();

    let resolver = taskherd::settings::SettingsResolver::new(f.store.clone());
    let applied = f
        .leader
        .apply_reload_request(&ctx_at(now), &resolver)
        .await
        .unwrap();
    assert!(applied);
    assert_eq!(resolver.generation(), 1);
    assert_eq!(f.control.reload_calls.lock().unwrap().as_slice(), ["127.0.0.1:50052"]);

    // Flag is consumed; the next pass is a no-op.
    assert!(!f
        .leader
        .apply_reload_request(&ctx_at(now), &resolver)
        .await
        .unwrap());
}

#[tokio::test]
async fn continuation_gate_blocks_reassignment_while_confirming() {
    let f = fixture().await;
    let def = insert_manual_definition(&f.store, "manual").await;
    let now = minute(10, 0);
    register(&f.coord, &worker_entry("w-4", Role::Worker, now)).await;

    let (run, _) = f
        .store
        .create_run_if_absent(def.id, Some(now - Duration::minutes(1)), "gate", now)
        .await
        .unwrap();
    f.store
        .assign_run(run.id, run.version, "w-gone", 5, now - Duration::minutes(1))
        .await
        .unwrap();
    f.store
        .mark_running(run.id, "w-gone", 5, "log", now - Duration::minutes(1))
        .await
        .unwrap();
    // The detached worker asked to continue; the deadline is still ahead.
    f.store
        .begin_confirming(run.id, now + Duration::seconds(60), "worker detached", now)
        .await
        .unwrap();

    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(snapshot.orphaned_runs, 0);
    assert_eq!(snapshot.reassigned_runs, 0);
    let row = f.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(row.state, RunState::Running);
    assert_eq!(row.assigned_worker_id.as_deref(), Some("w-gone"));
}

#[tokio::test]
async fn worker_reporting_wrong_run_enters_confirming() {
    let f = fixture().await;
    let def = insert_manual_definition(&f.store, "manual").await;
    let now = minute(10, 0);

    let mut w2 = worker_entry("w-2", Role::Worker, now);
    w2.rpc_port = 50052;
    register(&f.coord, &w2).await;
    // The worker answers status probes but claims a different run (it
    // restarted and lost the child).
    f.control.statuses.lock().unwrap().insert(
        "127.0.0.1:50052".to_string(),
        taskherd::proto::GetStatusResponse {
            worker_id: "w-2".to_string(),
            node_id: "node-w-2".to_string(),
            role: "worker".to_string(),
            detached: false,
            draining: false,
            load: 0,
            current_job_run_id: String::new(),
            observed_epoch: 5,
            last_heartbeat_unix_ms: now.timestamp_millis(),
        },
    );

    let (run, _) = f
        .store
        .create_run_if_absent(def.id, Some(now - Duration::minutes(1)), "ghost", now)
        .await
        .unwrap();
    f.store
        .assign_run(run.id, run.version, "w-2", 5, now - Duration::minutes(1))
        .await
        .unwrap();
    f.store
        .mark_running(run.id, "w-2", 5, "log", now - Duration::minutes(1))
        .await
        .unwrap();

    let snapshot = f.leader.tick(&ctx_at(now)).await.unwrap();
    assert_eq!(snapshot.confirming_runs, 1);
    let row = f.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(row.continuation_state, ContinuationState::Confirming);
}

#[tokio::test]
async fn unreachable_worker_is_declared_detached_after_grace() {
    let f = fixture().await;
    let now = minute(10, 0);
    let mut w2 = worker_entry("w-2", Role::Worker, now);
    w2.rpc_port = 50052;
    register(&f.coord, &w2).await;
    f.control.mark_unreachable("127.0.0.1:50052");

    // First failure starts the clock; the grace window (10s) has not
    // passed, so no flag yet.
    f.leader.ping_sweep(&ctx_at(now), 0).await.unwrap();
    assert!(!f
        .coord
        .get_flag(&taskherd::coord::keys::detach("w-2"))
        .await
        .unwrap());

    // Second failure past the grace window declares the detach.
    register(&f.coord, &worker_entry_fresh("w-2", now + Duration::seconds(11))).await;
    f.leader
        .ping_sweep(&ctx_at(now + Duration::seconds(11)), 0)
        .await
        .unwrap();
    assert!(f
        .coord
        .get_flag(&taskherd::coord::keys::detach("w-2"))
        .await
        .unwrap());
}

fn worker_entry_fresh(worker_id: &str, last_seen: DateTime<Utc>) -> taskherd::coord::WorkerEntry {
    let mut entry = worker_entry(worker_id, Role::Worker, last_seen);
    entry.rpc_port = 50052;
    entry
}

#[tokio::test]
async fn subleader_monitor_degrades_unreachable_stale_leader() {
    let f = fixture().await;
    let now = minute(10, 0);

    // Leader lock held by w-1, but its last_seen marker is ancient and the
    // worker does not answer pings.
    f.coord
        .try_acquire(
            &taskherd::coord::keys::leader_lock(),
            "w-1",
            std::time::Duration::from_secs(3600),
        )
        .await
        .unwrap();
    f.coord
        .set(
            &taskherd::coord::keys::leader_last_seen(),
            &(now - Duration::seconds(120)).timestamp_millis().to_string(),
        )
        .await
        .unwrap();
    register(&f.coord, &worker_entry("w-1", Role::Leader, now - Duration::seconds(120))).await;
    f.control.mark_unreachable("127.0.0.1:50051");

    let dyn_coord: Arc<dyn CoordinationStore> = f.coord.clone();
    let mut monitor =
        taskherd::leader::monitor::SubLeaderMonitor::new(dyn_coord, f.control.clone());
    let settings = test_settings();

    use taskherd::leader::monitor::MonitorOutcome;
    let first = monitor
        .check(&settings, 1, now.timestamp_millis())
        .await
        .unwrap();
    assert_eq!(first, MonitorOutcome::ProbeFailed(1));
    let second = monitor
        .check(&settings, 1, now.timestamp_millis())
        .await
        .unwrap();
    assert_eq!(second, MonitorOutcome::LeaderDegraded);
    assert!(f
        .coord
        .get_flag(&taskherd::coord::keys::degrade("w-1"))
        .await
        .unwrap());
}

#[tokio::test]
async fn subleader_monitor_spares_responsive_leader() {
    let f = fixture().await;
    let now = minute(10, 0);

    f.coord
        .try_acquire(
            &taskherd::coord::keys::leader_lock(),
            "w-1",
            std::time::Duration::from_secs(3600),
        )
        .await
        .unwrap();
    f.coord
        .set(
            &taskherd::coord::keys::leader_last_seen(),
            &(now - Duration::seconds(120)).timestamp_millis().to_string(),
        )
        .await
        .unwrap();
    register(&f.coord, &worker_entry("w-1", Role::Leader, now)).await;

    let dyn_coord: Arc<dyn CoordinationStore> = f.coord.clone();
    let mut monitor =
        taskherd::leader::monitor::SubLeaderMonitor::new(dyn_coord, f.control.clone());
    let outcome = monitor
        .check(&test_settings(), 1, now.timestamp_millis())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        taskherd::leader::monitor::MonitorOutcome::LeaderStaleButResponsive
    );
    assert!(!f
        .coord
        .get_flag(&taskherd::coord::keys::degrade("w-1"))
        .await
        .unwrap());
    assert_eq!(f.control.ping_calls.lock().unwrap().len(), 1);
}
