//! Worker-side continuation protocol: target selection, verdict handling,
//! and exhaustion behavior.


use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use taskherd::coord::{keys, CoordinationStore, MemoryStore, Role};
use taskherd::model::{ContinuationState, RunState};
use taskherd::proto::confirm_continuation_response::Decision;
use taskherd::rpc::ControlPlane;
use taskherd::store::RunStore;
use taskherd::worker::continuation::{
    confirm_or_abort, coordinator_targets, ContinuationConfig, ContinuationVerdict,
};

use test_harness::{
    insert_manual_definition, register, test_coord, test_store, worker_entry, FakeControlPlane,
};

fn config() -> ContinuationConfig {
    ContinuationConfig {
        retry_count: 2,
        retry_interval: Duration::from_millis(10),
        confirm_seconds: 30,
    }
}

async fn running_run(store: &RunStore, worker: &str, epoch: i64) -> Uuid {
    let def = insert_manual_definition(store, "cont").await;
    let now = Utc::now();
    let key = format!("cont-{}", Uuid::new_v4());
    let (run, _) = store
        .create_run_if_absent(def.id, Some(now), &key, now)
        .await
        .unwrap();
    assert!(store.assign_run(run.id, run.version, worker, epoch, now).await.unwrap());
    assert!(store.mark_running(run.id, worker, epoch, "log", now).await.unwrap());
    run.id
}

async fn setup_leader(coord: &Arc<MemoryStore>, worker_id: &str, port: u16) {
    coord
        .try_acquire(&keys::leader_lock(), worker_id, Duration::from_secs(3600))
        .await
        .unwrap();
    let mut entry = worker_entry(worker_id, Role::Leader, Utc::now());
    entry.rpc_port = port;
    register(coord, &entry).await;
}

#[tokio::test]
async fn targets_list_leader_first_then_subleaders() {
    let coord = test_coord();
    setup_leader(&coord, "w-1", 50051).await;
    let mut sub = worker_entry("w-2", Role::SubLeader, Utc::now());
    sub.rpc_port = 50052;
    register(&coord, &sub).await;
    register(&coord, &worker_entry("w-3", Role::Worker, Utc::now())).await;

    let dyn_coord: Arc<dyn CoordinationStore> = coord.clone();
    let targets = coordinator_targets(&dyn_coord).await.unwrap();
    assert_eq!(targets, vec!["127.0.0.1:50051", "127.0.0.1:50052"]);
}

#[tokio::test]
async fn allow_continue_clears_confirming_and_keeps_running() {
    let store = test_store().await;
    let coord = test_coord();
    let control = FakeControlPlane::new();
    setup_leader(&coord, "w-1", 50051).await;
    control.script_confirm("127.0.0.1:50051", Decision::AllowContinue);

    let run_id = running_run(&store, "w-2", 4).await;
    let dyn_coord: Arc<dyn CoordinationStore> = coord.clone();
    let dyn_control: Arc<dyn ControlPlane> = control.clone();

    let verdict = confirm_or_abort(&store, &dyn_coord, &dyn_control, "w-2", run_id, 4, config())
        .await
        .unwrap();
    assert_eq!(verdict, ContinuationVerdict::Continue);

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Running);
    assert_eq!(run.continuation_state, ContinuationState::None);

    // The request carried the caller's identity and dispatch epoch.
    let calls = control.confirm_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.worker_id, "w-2");
    assert_eq!(calls[0].1.leader_epoch, 4);
}

#[tokio::test]
async fn must_abort_verdict_is_final() {
    let store = test_store().await;
    let coord = test_coord();
    let control = FakeControlPlane::new();
    setup_leader(&coord, "w-1", 50051).await;
    control.script_confirm("127.0.0.1:50051", Decision::MustAbort);

    let run_id = running_run(&store, "w-2", 4).await;
    let dyn_coord: Arc<dyn CoordinationStore> = coord.clone();
    let dyn_control: Arc<dyn ControlPlane> = control.clone();

    let verdict = confirm_or_abort(&store, &dyn_coord, &dyn_control, "w-2", run_id, 4, config())
        .await
        .unwrap();
    assert_eq!(verdict, ContinuationVerdict::Abort);

    // The run stays CONFIRMING; the executor's abort path writes the
    // terminal state.
    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.continuation_state, ContinuationState::Confirming);
}

#[tokio::test]
async fn unreachable_leader_falls_back_to_subleader() {
    let store = test_store().await;
    let coord = test_coord();
    let control = FakeControlPlane::new();
    setup_leader(&coord, "w-1", 50051).await;
    let mut sub = worker_entry("w-3", Role::SubLeader, Utc::now());
    sub.rpc_port = 50053;
    register(&coord, &sub).await;

    control.mark_unreachable("127.0.0.1:50051");
    control.script_confirm("127.0.0.1:50053", Decision::AllowContinue);

    let run_id = running_run(&store, "w-2", 4).await;
    let dyn_coord: Arc<dyn CoordinationStore> = coord.clone();
    let dyn_control: Arc<dyn ControlPlane> = control.clone();

    let verdict = confirm_or_abort(&store, &dyn_coord, &dyn_control, "w-2", run_id, 4, config())
        .await
        .unwrap();
    assert_eq!(verdict, ContinuationVerdict::Continue);
}

#[tokio::test]
async fn exhausted_attempts_abort() {
    let store = test_store().await;
    let coord = test_coord();
    let control = FakeControlPlane::new();
    setup_leader(&coord, "w-1", 50051).await;
    control.mark_unreachable("127.0.0.1:50051");

    let run_id = running_run(&store, "w-2", 4).await;
    let dyn_coord: Arc<dyn CoordinationStore> = coord.clone();
    let dyn_control: Arc<dyn ControlPlane> = control.clone();

    let verdict = confirm_or_abort(&store, &dyn_coord, &dyn_control, "w-2", run_id, 4, config())
        .await
        .unwrap();
    assert_eq!(verdict, ContinuationVerdict::Abort);

    // Silence is denial: the run is still CONFIRMING and will be orphaned
    // by the leader's deadline scan if the abort itself is lost too.
    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Running);
    assert_eq!(run.continuation_state, ContinuationState::Confirming);
}

#[tokio::test]
async fn confirming_deadline_is_written_for_leader_scan() {
    let store = test_store().await;
    let coord = test_coord();
    let control = FakeControlPlane::new();
    setup_leader(&coord, "w-1", 50051).await;
    control.script_confirm("127.0.0.1:50051", Decision::MustAbort);

    let before = Utc::now();
    let run_id = running_run(&store, "w-2", 4).await;
    let dyn_coord: Arc<dyn CoordinationStore> = coord.clone();
    let dyn_control: Arc<dyn ControlPlane> = control.clone();
    confirm_or_abort(&store, &dyn_coord, &dyn_control, "w-2", run_id, 4, config())
        .await
        .unwrap();

    let run = store.get_run(run_id).await.unwrap().unwrap();
    let deadline = run.continuation_check_deadline_at.unwrap();
    assert!(deadline >= before + chrono::Duration::seconds(29));
    assert!(deadline <= Utc::now() + chrono::Duration::seconds(31));
}
