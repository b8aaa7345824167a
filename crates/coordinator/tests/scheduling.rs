//! End-to-end scheduling scenarios: team formation, phase synchronization,
//! completion, failure and ban propagation, driven through the real
//! scheduler loop with a map storage backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use mixnet_common::crypto;
use mixnet_common::id::ID_DATA_LEN;
use mixnet_common::{Activity, IdType, NodeId, NodeStatus, RoundId, RoundPhase};
use mixnet_storage::{Database, MapImpl, Storage};

use mixnet_coordinator::node_state::UpdateNotification;
use mixnet_coordinator::scheduler::{self, Params};
use mixnet_coordinator::{NetworkState, RoundTracker, StateError};

struct Harness {
    state: Arc<NetworkState>,
    map: Arc<MapImpl>,
    tracker: RoundTracker,
    kill_tx: mpsc::Sender<oneshot::Sender<()>>,
    scheduler: JoinHandle<Result<(), StateError>>,
    _dir: tempfile::TempDir,
}

fn nid(seed: u8) -> NodeId {
    NodeId::new([seed; ID_DATA_LEN], IdType::Node)
}

fn params(team_size: u32) -> Params {
    Params {
        team_size,
        batch_size: 32,
        minimum_delay_ms: 0,
        realtime_delay_ms: 0,
        random_ordering: false,
    }
}

async fn start_scheduler(team_size: u32) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let map = Arc::new(MapImpl::new());
    let storage = Storage::new(Arc::clone(&map) as Arc<dyn Database>);
    let key = crypto::generate_rsa_key(crypto::RSA_KEY_BITS).expect("rsa key");

    let state = NetworkState::new(
        key,
        16,
        dir.path().join("ndf.json"),
        dir.path().join("partial.b64"),
        HashMap::new(),
        storage,
    )
    .await
    .expect("network state");

    let tracker = RoundTracker::new();
    let (kill_tx, kill_rx) = mpsc::channel(1);
    let scheduler = tokio::spawn(scheduler::run(
        params(team_size),
        Arc::clone(&state),
        tracker.clone(),
        kill_rx,
        Duration::from_secs(5),
    ));

    Harness { state, map, tracker, kill_tx, scheduler, _dir: dir }
}

fn add_nodes(state: &NetworkState, count: u8) -> Vec<NodeId> {
    (1..=count)
        .map(|seed| {
            let id = nid(seed);
            state
                .node_map()
                .add_node(id, &seed.to_string(), "", "")
                .expect("add node");
            id
        })
        .collect()
}

/// Report an activity the way the polling endpoint does: take the polling
/// lock, drive the state machine, enqueue the notification with the guard
/// inside.
async fn report(state: &NetworkState, id: NodeId, to: Activity) {
    let node = state.node_map().get_node(id).expect("node in map");
    let guard = node.polling_lock().lock_owned().await;
    let (updated, notification) = node.update(to).expect("activity transition");
    assert!(updated, "expected an effective update to {to}");
    let mut notification = notification.expect("notification");
    notification.polling_guard = Some(guard);
    state.send_update_notification(notification).expect("enqueue");
}

async fn wait_for_update(state: &NetworkState, id: u64) {
    for _ in 0..500 {
        if state.last_update_id() >= id {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "update {id} never observed, last is {}",
        state.last_update_id()
    );
}

/// Give in-flight notifications time to drain, then assert the log did not
/// grow past `expected`.
async fn assert_no_update_past(state: &NetworkState, expected: u64) {
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state.last_update_id(), expected);
}

#[tokio::test]
async fn test_single_team_happy_path() {
    let h = start_scheduler(3).await;
    let nodes = add_nodes(&h.state, 3);

    for id in &nodes {
        report(&h.state, *id, Activity::Waiting).await;
    }

    // update 1 is the startup dummy, update 2 the first real round update
    wait_for_update(&h.state, 2).await;
    let updates = h.state.get_updates(1);
    assert_eq!(updates.len(), 1);
    let info = &updates[0];
    assert_eq!(info.update_id, 2);
    assert_eq!(info.id, RoundId(1));
    assert_eq!(info.state, RoundPhase::Precomputing);
    assert_eq!(info.batch_size, 32);
    assert_eq!(info.topology, nodes, "topology equals insertion order");
    assert!(h.tracker.contains(RoundId(1)));

    // both signatures verify against the server keys
    let digest = info.signing_digest();
    assert!(crypto::rsa_verify_sha256(
        h.state.rsa_public_key(),
        &digest,
        &info.rsa_signature
    ));
    let elliptic_pub = h.state.elliptic_public_key().to_bytes();
    assert!(crypto::eddsa_verify(&elliptic_pub, &digest, &info.eddsa_signature).expect("verify"));

    // clean shutdown through the kill channel
    let (reply_tx, reply_rx) = oneshot::channel();
    h.kill_tx.send(reply_tx).await.expect("send kill");
    tokio::time::timeout(Duration::from_secs(5), reply_rx)
        .await
        .expect("kill acknowledged in time")
        .expect("reply");
    let result = tokio::time::timeout(Duration::from_secs(5), h.scheduler)
        .await
        .expect("scheduler joined")
        .expect("no panic");
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_standby_synchronization_and_realtime_tiebreak() {
    let h = start_scheduler(3).await;
    let nodes = add_nodes(&h.state, 3);

    for id in &nodes {
        report(&h.state, *id, Activity::Waiting).await;
    }
    wait_for_update(&h.state, 2).await;

    for id in &nodes {
        report(&h.state, *id, Activity::Precomputing).await;
    }

    // two of three standby reports do not transition the round
    report(&h.state, nodes[0], Activity::Standby).await;
    report(&h.state, nodes[1], Activity::Standby).await;
    assert_no_update_past(&h.state, 2).await;

    // the third closes the barrier: standby then queued
    report(&h.state, nodes[2], Activity::Standby).await;
    wait_for_update(&h.state, 4).await;
    let updates = h.state.get_updates(2);
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].state, RoundPhase::Standby);
    assert_eq!(updates[1].state, RoundPhase::Queued);
    // the queued stamp carries the scheduled realtime start
    assert!(
        updates[1].timestamp(RoundPhase::Queued) >= updates[0].timestamp(RoundPhase::Standby)
    );

    // realtime moves on the first reporter only
    report(&h.state, nodes[0], Activity::Realtime).await;
    wait_for_update(&h.state, 5).await;
    assert_eq!(h.state.get_updates(4)[0].state, RoundPhase::Realtime);

    report(&h.state, nodes[1], Activity::Realtime).await;
    report(&h.state, nodes[2], Activity::Realtime).await;
    assert_no_update_past(&h.state, 5).await;
}

#[tokio::test]
async fn test_completion_commits_metrics_and_untracks() {
    let h = start_scheduler(3).await;
    let nodes = add_nodes(&h.state, 3);

    for id in &nodes {
        report(&h.state, *id, Activity::Waiting).await;
    }
    wait_for_update(&h.state, 2).await;
    for id in &nodes {
        report(&h.state, *id, Activity::Precomputing).await;
    }
    for id in &nodes {
        report(&h.state, *id, Activity::Standby).await;
    }
    wait_for_update(&h.state, 4).await;
    for id in &nodes {
        report(&h.state, *id, Activity::Realtime).await;
    }
    wait_for_update(&h.state, 5).await;

    // two completions keep the round open, the third retires it
    report(&h.state, nodes[0], Activity::Completed).await;
    report(&h.state, nodes[1], Activity::Completed).await;
    assert_no_update_past(&h.state, 5).await;
    report(&h.state, nodes[2], Activity::Completed).await;
    wait_for_update(&h.state, 6).await;

    let updates = h.state.get_updates(5);
    assert_eq!(updates.len(), 1);
    let info = &updates[0];
    assert_eq!(info.state, RoundPhase::Completed);
    assert!(!h.tracker.contains(RoundId(1)));

    // the metric row mirrors the stamped timestamps
    let metric = h.map.get_round_metric(RoundId(1)).expect("round metric");
    assert_eq!(metric.precomp_start, info.timestamp(RoundPhase::Precomputing));
    assert_eq!(metric.precomp_end, info.timestamp(RoundPhase::Standby));
    assert_eq!(metric.realtime_start, info.timestamp(RoundPhase::Realtime));
    assert_eq!(metric.realtime_end, info.timestamp(RoundPhase::Completed));
    assert_eq!(metric.batch_size, 32);

    let rows = h.map.topology_rows(RoundId(1));
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].order, 0);
    assert_eq!(rows[0].node_id, nodes[0]);

    // completed nodes loop back into the pool on their next waiting report
    for id in &nodes {
        report(&h.state, *id, Activity::Waiting).await;
    }
    wait_for_update(&h.state, 7).await;
    assert_eq!(h.state.get_updates(6)[0].id, RoundId(2));
}

#[tokio::test]
async fn test_ban_mid_round_kills_round() {
    let h = start_scheduler(3).await;
    let nodes = add_nodes(&h.state, 3);

    for id in &nodes {
        report(&h.state, *id, Activity::Waiting).await;
    }
    wait_for_update(&h.state, 2).await;

    // ban the first team member
    {
        let node = h.state.node_map().get_node(nodes[0]).expect("node");
        let guard = node.polling_lock().lock_owned().await;
        let from_status = node.status();
        node.set_status(NodeStatus::Banned);
        let mut notification = UpdateNotification::new(
            nodes[0],
            node.activity(),
            node.activity(),
            from_status,
            NodeStatus::Banned,
        );
        notification.polling_guard = Some(guard);
        h.state.send_update_notification(notification).expect("enqueue ban");
    }

    wait_for_update(&h.state, 3).await;
    let updates = h.state.get_updates(2);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].state, RoundPhase::Failed);
    assert!(!h.tracker.contains(RoundId(1)));

    // the banned node no longer holds the round
    let banned = h.state.node_map().get_node(nodes[0]).expect("node");
    assert!(banned.current_round().is_none());

    // the synthesized error names the round and is signed by the server
    let round = h.state.round_map().get_round(RoundId(1)).expect("round");
    let errors = round.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].id, 1);
    assert!(errors[0].error.contains(&nodes[0].to_string()));
    assert!(crypto::rsa_verify_sha256(
        h.state.rsa_public_key(),
        &errors[0].signing_digest(),
        &errors[0].signature
    ));

    // a failed-round error row landed in storage
    let rows = h.map.round_errors();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].round_id, RoundId(1));

    // remaining members cannot drive the dead round: the state machine
    // rejects the report at the edge
    let survivor = h.state.node_map().get_node(nodes[1]).expect("node");
    let err = survivor.update(Activity::Precomputing).expect_err("round failed");
    assert!(matches!(err, StateError::WrongRoundPhase { .. }));

    // and a stale notification that slipped past the edge is ignored
    {
        let guard = survivor.polling_lock().lock_owned().await;
        let mut notification = UpdateNotification::new(
            nodes[1],
            Activity::Precomputing,
            Activity::Standby,
            NodeStatus::Active,
            NodeStatus::Active,
        );
        notification.polling_guard = Some(guard);
        h.state.send_update_notification(notification).expect("enqueue");
    }
    assert_no_update_past(&h.state, 3).await;
}

#[tokio::test]
async fn test_illegal_transition_rejected_without_mutation() {
    let h = start_scheduler(3).await;
    let nodes = add_nodes(&h.state, 3);

    report(&h.state, nodes[0], Activity::Waiting).await;
    // let the scheduler drain the notification so the lock is free
    tokio::time::sleep(Duration::from_millis(100)).await;

    let node = h.state.node_map().get_node(nodes[0]).expect("node");
    let err = node.update(Activity::Completed).expect_err("waiting to completed");
    assert!(matches!(err, StateError::InvalidTransition { .. }));
    assert_eq!(node.activity(), Activity::Waiting);

    // nothing was emitted beyond the startup dummy
    assert_no_update_past(&h.state, 1).await;
    assert_eq!(h.map.round_metric_count(), 0);
}

#[tokio::test]
async fn test_error_report_kills_round_and_team_repools() {
    let h = start_scheduler(3).await;
    let nodes = add_nodes(&h.state, 3);

    for id in &nodes {
        report(&h.state, *id, Activity::Waiting).await;
    }
    wait_for_update(&h.state, 2).await;
    for id in &nodes {
        report(&h.state, *id, Activity::Precomputing).await;
    }

    // one member errors out, referencing its current round
    {
        let node = h.state.node_map().get_node(nodes[0]).expect("node");
        let guard = node.polling_lock().lock_owned().await;
        let (_, notification) = node.update(Activity::Error).expect("error transition");
        let mut notification = notification.expect("notification");
        notification.error = Some(mixnet_coordinator::wire::RoundError {
            id: 1,
            node_id: Some(nodes[0]),
            error: "precomputation blew up".to_string(),
            signature: Vec::new(),
        });
        notification.polling_guard = Some(guard);
        h.state.send_update_notification(notification).expect("enqueue");
    }

    wait_for_update(&h.state, 3).await;
    assert_eq!(h.state.get_updates(2)[0].state, RoundPhase::Failed);
    assert!(!h.tracker.contains(RoundId(1)));

    // the two survivors error out on the dead round; each re-kill publishes
    // the failed state again
    for id in &nodes[1..] {
        report(&h.state, *id, Activity::Error).await;
    }
    wait_for_update(&h.state, 5).await;
    assert!(h.state.get_updates(3).iter().all(|u| u.state == RoundPhase::Failed));

    // the whole team re-pools and forms a fresh round
    for id in &nodes {
        report(&h.state, *id, Activity::Waiting).await;
    }
    wait_for_update(&h.state, 6).await;
    let info = &h.state.get_updates(5)[0];
    assert_eq!(info.id, RoundId(2));
    assert_eq!(info.state, RoundPhase::Precomputing);
}
