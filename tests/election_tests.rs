//! Lease-based election: single leader per epoch, renewal, degradation,
//! detach, and failover promotion.


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use taskherd::coord::{
    keys, CoordinationSettings, CoordinationStore, Coordinator, DirectorySnapshot, MemoryStore,
    Role,
};

fn coordinator(store: &Arc<MemoryStore>, worker_id: &str, node_id: &str) -> Coordinator {
    let dyn_store: Arc<dyn CoordinationStore> = store.clone();
    Coordinator::new(
        dyn_store,
        worker_id.to_string(),
        node_id.to_string(),
        "127.0.0.1".to_string(),
        50051,
        CoordinationSettings {
            heartbeat_ttl: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(5),
            leader_lock_ttl: Duration::from_secs(10),
            subleader_lock_ttl: Duration::from_secs(10),
        },
    )
}

fn snap() -> DirectorySnapshot {
    DirectorySnapshot::default()
}

#[tokio::test]
async fn single_worker_becomes_leader_with_epoch_one() {
    let store = test_harness::test_coord();
    let mut w1 = coordinator(&store, "w-1", "node-a");

    let status = w1.tick(1_000, &snap()).await.unwrap();
    assert_eq!(status.role, Role::Leader);
    assert_eq!(status.leader_epoch, Some(1));
    assert_eq!(status.observed_epoch, 1);
    assert_eq!(status.leader_worker_id.as_deref(), Some("w-1"));
}

#[tokio::test]
async fn at_most_one_leader_per_epoch() {
    let store = test_harness::test_coord();
    let mut coordinators: Vec<Coordinator> = (1..=5)
        .map(|i| coordinator(&store, &format!("w-{i}"), &format!("node-{i}")))
        .collect();

    // Many interleaved rounds; every (epoch, holder) pair observed must be
    // a function of the epoch.
    let mut seen: HashSet<(i64, String)> = HashSet::new();
    for round in 0..20 {
        let mut leaders = 0;
        for (i, coordinator) in coordinators.iter_mut().enumerate() {
            let status = coordinator.tick(1_000 * round, &snap()).await.unwrap();
            if status.role == Role::Leader {
                leaders += 1;
                seen.insert((status.leader_epoch.unwrap(), format!("w-{}", i + 1)));
            }
        }
        assert!(leaders <= 1, "round {round} had {leaders} leaders");
    }

    let epochs: HashSet<i64> = seen.iter().map(|(epoch, _)| *epoch).collect();
    assert_eq!(
        epochs.len(),
        seen.len(),
        "an epoch was observed with two different holders: {seen:?}"
    );
}

#[tokio::test]
async fn second_worker_takes_subleader_role() {
    let store = test_harness::test_coord();
    let mut w1 = coordinator(&store, "w-1", "node-a");
    let mut w2 = coordinator(&store, "w-2", "node-b");

    let s1 = w1.tick(1_000, &snap()).await.unwrap();
    let s2 = w2.tick(1_000, &snap()).await.unwrap();
    assert_eq!(s1.role, Role::Leader);
    assert_eq!(s2.role, Role::SubLeader);
    assert_eq!(s2.observed_epoch, 1);
    assert_eq!(s2.leader_epoch, None);
}

#[tokio::test(start_paused = true)]
async fn expired_lease_moves_leadership_with_higher_epoch() {
    let store = test_harness::test_coord();
    let mut w1 = coordinator(&store, "w-1", "node-a");
    let mut w2 = coordinator(&store, "w-2", "node-b");

    let s1 = w1.tick(1_000, &snap()).await.unwrap();
    assert_eq!(s1.leader_epoch, Some(1));
    w2.tick(1_000, &snap()).await.unwrap();

    // w-1 dies: no more renewals; its lock and the sub-leader lock expire.
    tokio::time::advance(Duration::from_secs(11)).await;

    let s2 = w2.tick(20_000, &snap()).await.unwrap();
    assert_eq!(s2.role, Role::Leader);
    assert_eq!(s2.leader_epoch, Some(2), "promotion must bump the epoch");
}

#[tokio::test]
async fn degrade_flag_forces_step_down() {
    let store = test_harness::test_coord();
    let mut w1 = coordinator(&store, "w-1", "node-a");
    w1.tick(1_000, &snap()).await.unwrap();

    store.set_flag(&keys::degrade("w-1")).await.unwrap();
    let status = w1.tick(2_000, &snap()).await.unwrap();
    assert_eq!(status.role, Role::Worker);
    assert_eq!(status.leader_epoch, None);

    // Lease was released, flag consumed; a peer can take over immediately.
    assert!(!store.get_flag(&keys::degrade("w-1")).await.unwrap());
    let mut w2 = coordinator(&store, "w-2", "node-b");
    let s2 = w2.tick(3_000, &snap()).await.unwrap();
    assert_eq!(s2.role, Role::Leader);
    assert_eq!(s2.leader_epoch, Some(2));
}

#[tokio::test]
async fn detached_worker_holds_no_role() {
    let store = test_harness::test_coord();
    store.set_flag(&keys::detach("w-1")).await.unwrap();

    let mut w1 = coordinator(&store, "w-1", "node-a");
    let status = w1.tick(1_000, &snap()).await.unwrap();
    assert_eq!(status.role, Role::Worker);
    assert!(status.detached);
    assert_eq!(status.leader_worker_id, None);
}

#[tokio::test]
async fn draining_worker_does_not_campaign() {
    let store = test_harness::test_coord();
    let mut w1 = coordinator(&store, "w-1", "node-a");
    let draining = DirectorySnapshot {
        draining: true,
        ..Default::default()
    };
    let status = w1.tick(1_000, &draining).await.unwrap();
    assert_eq!(status.role, Role::Worker);
    assert_eq!(status.leader_worker_id, None);
}

#[tokio::test]
async fn shutdown_releases_lease_for_successor() {
    let store = test_harness::test_coord();
    let mut w1 = coordinator(&store, "w-1", "node-a");
    w1.tick(1_000, &snap()).await.unwrap();
    w1.shutdown().await.unwrap();

    assert!(store.get(&keys::leader_lock()).await.unwrap().is_none());
    let mut w2 = coordinator(&store, "w-2", "node-b");
    let status = w2.tick(2_000, &snap()).await.unwrap();
    assert_eq!(status.role, Role::Leader);
    assert_eq!(status.leader_epoch, Some(2));
}

#[tokio::test]
async fn directory_reflects_roles_and_snapshot() {
    let store = test_harness::test_coord();
    let mut w1 = coordinator(&store, "w-1", "node-a");
    let busy = DirectorySnapshot {
        load: 1,
        current_job_run_id: "run-1".to_string(),
        draining: false,
    };
    w1.tick(1_000, &busy).await.unwrap();

    let workers = store.scan_workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].worker_id, "w-1");
    assert_eq!(workers[0].role, Role::Leader);
    assert_eq!(workers[0].load, 1);
    assert_eq!(workers[0].current_job_run_id, "run-1");
}

#[tokio::test]
async fn restarted_leader_readopts_its_lease() {
    let store = test_harness::test_coord();
    let mut w1 = coordinator(&store, "w-1", "node-a");
    let s1 = w1.tick(1_000, &snap()).await.unwrap();
    assert_eq!(s1.leader_epoch, Some(1));

    // Same worker id, fresh process: it finds the lock it still holds and
    // resumes under the same epoch instead of incrementing.
    let mut restarted = coordinator(&store, "w-1", "node-a");
    let s2 = restarted.tick(2_000, &snap()).await.unwrap();
    assert_eq!(s2.role, Role::Leader);
    assert_eq!(s2.leader_epoch, Some(1));
}
