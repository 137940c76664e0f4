//! # Sweep Engine Integration Tests
//!
//! Runs the full engine task against `SimulatedFabric` with tokio's paused
//! clock, so retries, polls and periodic sweeps happen in virtual time.
//!
//! Fabric used by most tests:
//!
//! ```text
//!                 spine 0x100
//!                 1 /      \ 2
//!                1 /        \ 1
//!        leaf 0x200          leaf 0x300
//!        2 |    | 3          2 |    | 3
//!     0x1000  0x1010       0x2000  0x2010
//! ```

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use fabric_types::{Guid, JoinState, Lid, SmRole, NO_PATH};
use sm_02_sweep::{
    completion_channel, spawn, PeerInfo, RequestKind, SimulatedFabric, SmConfig, SmHandle,
    SmStatus, SubnetManagerApi, SweepError, SweepKind, SweepOutcome,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const SPINE: u64 = 0x100;
const LEAVES: [u64; 2] = [0x200, 0x300];
const ENDPOINTS: [(u64, u64, u8); 4] = [
    (0x1000, 0x200, 2),
    (0x1010, 0x200, 3),
    (0x2000, 0x300, 2),
    (0x2010, 0x300, 3),
];

fn two_tier(sim: &SimulatedFabric) {
    sim.add_switch(SPINE, 4);
    for (i, leaf) in LEAVES.iter().enumerate() {
        sim.add_switch(*leaf, 4);
        sim.connect(*leaf, 1, SPINE, i as u8 + 1);
    }
    for (ep, leaf, port) in ENDPOINTS {
        sim.add_endpoint(ep, 1);
        sim.connect(ep, 1, leaf, port);
    }
}

fn start(
    config: SmConfig,
    build: impl FnOnce(&SimulatedFabric),
) -> (SmHandle, JoinHandle<()>, Arc<SimulatedFabric>) {
    let (sink, completions) = completion_channel();
    let sim = Arc::new(SimulatedFabric::new(sink));
    build(&sim);
    let (sm, task) = spawn(
        config,
        Arc::clone(&sim),
        Arc::clone(&sim),
        Arc::clone(&sim),
        completions,
    )
    .expect("valid config");
    (sm, task, sim)
}

async fn wait_until(sm: &SmHandle, pred: impl FnMut(&SmStatus) -> bool) -> SmStatus {
    let mut rx = sm.subscribe();
    let status = timeout(Duration::from_secs(120), rx.wait_for(pred))
        .await
        .expect("condition reached in time")
        .expect("engine still running")
        .clone();
    status
}

async fn converged(sm: &SmHandle, heavy_sweeps: u64) -> SmStatus {
    wait_until(sm, |s| {
        s.heavy_sweeps >= heavy_sweeps
            && s.state.is_idle()
            && s.last_outcome == Some(SweepOutcome::Completed(SweepKind::Heavy))
    })
    .await
}

fn lid_of(sim: &SimulatedFabric, node: u64) -> Lid {
    sim.port(node, 1).expect("endpoint port").base_lid
}

fn assert_fully_routed(sim: &SimulatedFabric) {
    for (ep, _, _) in ENDPOINTS {
        let lid = lid_of(sim, ep);
        for sw in [SPINE, LEAVES[0], LEAVES[1]] {
            assert!(
                sim.trace_route(sw, lid).is_some(),
                "no loop-free route from {:#x} to {}",
                sw,
                lid
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_fabric_converges_with_distinct_lids_and_min_hop_routes() {
    // Arrange
    let (sm, _task, sim) = start(SmConfig::for_testing(), two_tier);

    // Act
    let status = converged(&sm, 1).await;

    // Assert
    assert_eq!(status.role, SmRole::Master);
    assert_eq!(status.outstanding, 0);

    let lids: HashSet<Lid> = ENDPOINTS.iter().map(|(ep, _, _)| lid_of(&sim, *ep)).collect();
    assert_eq!(lids.len(), ENDPOINTS.len());
    assert!(lids.iter().all(|l| l.is_unicast()));
    assert_fully_routed(&sim);

    let near = lid_of(&sim, 0x1000);
    let far = lid_of(&sim, 0x2000);
    assert_eq!(sm.hop_count(Guid(0x200), near), Some(1));
    assert_eq!(sm.hop_count(Guid(0x200), far), Some(3));
    assert_eq!(sm.forwarding_entry(Guid(0x200), near), Some(2));
    assert_eq!(sm.forwarding_entry(Guid(0x200), far), Some(1));
    assert_eq!(sm.hop_count(Guid(0xdead), near), None);

    let dump = sm.dump_forwarding_tables();
    assert!(dump.contains("switch 0x0000000000000200"));
    assert_eq!(dump.lines().filter(|l| l.starts_with("switch")).count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_second_sweep_reprograms_nothing() {
    let (sm, _task, sim) = start(SmConfig::for_testing(), two_tier);
    converged(&sm, 1).await;
    sim.clear_requests();

    sm.trigger_sweep(SweepKind::Heavy).await.unwrap();
    converged(&sm, 2).await;

    assert!(sim.requests().is_empty(), "unexpected: {:?}", sim.requests());
}

#[tokio::test(start_paused = true)]
async fn test_failed_blocks_are_retried_after_backoff() {
    let (sm, _task, sim) = start(SmConfig::for_testing(), |sim| {
        two_tier(sim);
        sim.fail_next(RequestKind::UnicastBlock, 2);
    });

    let status = converged(&sm, 2).await;

    assert_eq!(status.incomplete_sweeps, 1);
    assert_fully_routed(&sim);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_failures_back_off_then_recover() {
    let (sm, _task, sim) = start(SmConfig::for_testing(), |sim| {
        two_tier(sim);
        sim.fail_discovery(3);
    });

    let status = converged(&sm, 1).await;

    assert_eq!(status.aborted_sweeps, 3);
    assert_eq!(sim.discoveries(), 4);
    assert_fully_routed(&sim);
}

#[tokio::test(start_paused = true)]
async fn test_lossy_transport_converges_through_timeouts() {
    let (sm, _task, sim) = start(SmConfig::for_testing(), |sim| {
        two_tier(sim);
        sim.set_loss_rate(0.3);
    });

    let status = converged(&sm, 1).await;

    assert!(status.incomplete_sweeps >= 1);
    assert_fully_routed(&sim);
}

#[tokio::test(start_paused = true)]
async fn test_removed_endpoint_found_by_light_sweep() {
    let config = SmConfig {
        sweep_interval_secs: 5,
        ..SmConfig::for_testing()
    };
    let (sm, _task, sim) = start(config, two_tier);
    converged(&sm, 1).await;
    let gone = lid_of(&sim, 0x2010);

    sim.remove_node(0x2010);
    let status = wait_until(&sm, |s| s.light_sweeps >= 1 && s.heavy_sweeps >= 2 && s.state.is_idle())
        .await;

    assert_eq!(status.last_outcome, Some(SweepOutcome::Completed(SweepKind::Heavy)));
    assert_eq!(sm.forwarding_entry(Guid(0x300), gone), Some(NO_PATH));
    assert!(sim.trace_route(0x200, gone).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_group_membership_programs_multicast_tree() {
    let mlid = Lid(0xC001);
    let (sm, _task, sim) = start(SmConfig::for_testing(), two_tier);
    converged(&sm, 1).await;

    // Join two members on different leaves
    for node in [0x1000, 0x2000] {
        assert!(sm
            .join_group(mlid, [1; 16], Guid(node), 1, JoinState::FullMember)
            .await
            .unwrap());
    }
    assert!(!sm
        .join_group(mlid, [1; 16], Guid(0x2000), 1, JoinState::FullMember)
        .await
        .unwrap());
    wait_until(&sm, |s| {
        s.state.is_idle()
            && sim.programmed_multicast(0x200, mlid) == BTreeSet::from([1, 2])
            && sim.programmed_multicast(0x300, mlid) == BTreeSet::from([1, 2])
    })
    .await;

    let group = sm.multicast_group(mlid).expect("group published");
    assert_eq!(group.members.len(), 2);
    assert_eq!(group.tree.root, Some(Guid(SPINE)));
    assert_eq!(sim.programmed_multicast(SPINE, mlid), BTreeSet::from([1, 2]));

    // Last member leaving deletes the group and clears the tables
    assert!(sm.leave_group(mlid, Guid(0x1000), 1).await.unwrap());
    assert!(sm.leave_group(mlid, Guid(0x2000), 1).await.unwrap());
    assert!(!sm.leave_group(mlid, Guid(0x2000), 1).await.unwrap());
    wait_until(&sm, |s| {
        s.state.is_idle()
            && [SPINE, LEAVES[0], LEAVES[1]]
                .iter()
                .all(|sw| sim.programmed_multicast(*sw, mlid).is_empty())
    })
    .await;

    assert!(sm.multicast_group(mlid).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unicast_mlid_join_is_rejected() {
    let (sm, _task, _sim) = start(SmConfig::for_testing(), two_tier);
    converged(&sm, 1).await;

    let result = sm
        .join_group(Lid(5), [0; 16], Guid(0x1000), 1, JoinState::FullMember)
        .await;
    assert!(matches!(result, Err(SweepError::Routing(_))));
}

#[tokio::test(start_paused = true)]
async fn test_equal_priority_smaller_guid_wins() {
    // (5, 0x10) against a peer (5, 0x3): the peer wins
    let (sm, _task, sim) = start(SmConfig::for_testing(), |sim| {
        two_tier(sim);
        sim.add_peer(PeerInfo::new(Guid(0x3), 5, SmRole::Master));
    });
    wait_until(&sm, |s| s.role == SmRole::Standby).await;
    assert!(sim.requests().is_empty());

    // (5, 0x3) against a peer (5, 0x10): this instance wins
    let config = SmConfig {
        guid: Guid(0x3),
        ..SmConfig::for_testing()
    };
    let (sm, _task, _sim) = start(config, |sim| {
        two_tier(sim);
        sim.add_peer(PeerInfo::new(Guid(0x10), 5, SmRole::Discovering));
    });
    let status = converged(&sm, 1).await;
    assert_eq!(status.role, SmRole::Master);
}

#[tokio::test(start_paused = true)]
async fn test_standby_takes_over_when_master_stops_answering() {
    let (sm, _task, sim) = start(SmConfig::for_testing(), |sim| {
        two_tier(sim);
        sim.add_peer(PeerInfo::new(Guid(0x3), 9, SmRole::Master));
    });
    wait_until(&sm, |s| s.role == SmRole::Standby).await;

    sim.remove_peer(0x3);
    let status = converged(&sm, 1).await;

    assert_eq!(status.role, SmRole::Master);
    assert_eq!(sm.role(), SmRole::Master);
    assert_fully_routed(&sim);
}

#[tokio::test(start_paused = true)]
async fn test_master_hands_over_to_preferred_standby() {
    let (sm, _task, sim) = start(SmConfig::for_testing(), two_tier);
    converged(&sm, 1).await;

    sim.add_peer(PeerInfo::new(Guid(0x3), 12, SmRole::Standby));
    sm.trigger_sweep(SweepKind::Light).await.unwrap();
    let status = wait_until(&sm, |s| s.role == SmRole::Standby && s.state.is_idle()).await;

    assert_eq!(sim.handovers(), vec![Guid(0x3)]);
    assert_eq!(status.last_outcome, Some(SweepOutcome::Cancelled(SweepKind::Light)));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_engine() {
    let (sm, task, _sim) = start(SmConfig::for_testing(), two_tier);
    converged(&sm, 1).await;

    sm.shutdown().await.unwrap();
    timeout(Duration::from_secs(5), task)
        .await
        .expect("engine stops")
        .expect("engine task did not panic");

    assert!(matches!(
        sm.trigger_sweep(SweepKind::Heavy).await,
        Err(SweepError::Stopped)
    ));
    // Queries keep answering from the last snapshot
    assert!(sm.dump_forwarding_tables().contains("switch"));
}

#[test]
fn test_invalid_config_is_rejected_before_spawn() {
    let (sink, completions) = completion_channel();
    let sim = Arc::new(SimulatedFabric::new(sink));
    let config = SmConfig {
        lmc: 9,
        ..SmConfig::for_testing()
    };
    let result = spawn(
        config,
        Arc::clone(&sim),
        Arc::clone(&sim),
        Arc::clone(&sim),
        completions,
    );
    assert!(matches!(result, Err(SweepError::Config(_))));
}
