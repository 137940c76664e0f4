//! Step-by-step tests of the engine, driven without the event loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fabric_types::{Completion, Guid, LinkState, MadRequest, SmRole, TransactionId};

use super::{Command, SweepService};
use crate::adapters::simulated::{RequestKind, SimulatedFabric};
use crate::config::SmConfig;
use crate::domain::{IdleWork, SweepKind, SweepOutcome, SweepPhase, SweepState};
use crate::ports::outbound::{completion_channel, PeerInfo};

type Service = SweepService<SimulatedFabric, SimulatedFabric, SimulatedFabric>;

/// Five switches in a line, no endpoints: one unicast block per switch.
fn line_of_switches() -> (Service, Arc<SimulatedFabric>) {
    let (sink, completions) = completion_channel();
    let sim = Arc::new(SimulatedFabric::new(sink));
    for i in 1..=5u64 {
        sim.add_switch(i * 0x100, 4);
    }
    for i in 1..5u64 {
        sim.connect(i * 0x100, 2, (i + 1) * 0x100, 1);
    }
    let (service, _handle) = SweepService::new(
        SmConfig::for_testing(),
        Arc::clone(&sim),
        Arc::clone(&sim),
        Arc::clone(&sim),
        completions,
    )
    .unwrap();
    (service, sim)
}

fn waiting(phase: SweepPhase) -> SweepState {
    SweepState::Waiting {
        kind: SweepKind::Heavy,
        phase,
    }
}

fn drain(service: &mut Service) -> usize {
    let mut n = 0;
    while let Some(c) = service.try_next_completion() {
        service.on_completion(c);
        n += 1;
    }
    n
}

#[tokio::test]
async fn test_barrier_advances_only_after_every_block_completes() {
    let (mut svc, sim) = line_of_switches();

    svc.request(SweepKind::Heavy);
    svc.drive().await;
    assert_eq!(svc.machine().state(), waiting(SweepPhase::Address));
    assert_eq!(svc.context().outstanding(), 5);

    sim.hold_completions(true).fail_next(RequestKind::UnicastBlock, 1);
    assert_eq!(drain(&mut svc), 5);
    assert_eq!(
        svc.machine().state(),
        SweepState::Running {
            kind: SweepKind::Heavy,
            phase: SweepPhase::Unicast
        }
    );

    svc.drive().await;
    assert_eq!(svc.machine().state(), waiting(SweepPhase::Unicast));
    assert_eq!(svc.context().outstanding(), 5);

    assert_eq!(sim.release(), 5);
    let mut completions = Vec::new();
    while let Some(c) = svc.try_next_completion() {
        completions.push(c);
    }
    assert_eq!(completions.len(), 5);
    assert_eq!(completions.iter().filter(|c| c.result.is_err()).count(), 1);

    for c in &completions[..4] {
        svc.on_completion(c.clone());
    }
    assert_eq!(svc.context().outstanding(), 1);
    assert_eq!(svc.machine().state(), waiting(SweepPhase::Unicast));

    // A repeated completion must not count twice.
    svc.on_completion(completions[0].clone());
    assert_eq!(svc.context().outstanding(), 1);
    assert_eq!(svc.machine().state(), waiting(SweepPhase::Unicast));

    svc.on_completion(completions[4].clone());
    assert_eq!(
        svc.machine().state(),
        SweepState::Running {
            kind: SweepKind::Heavy,
            phase: SweepPhase::Multicast
        }
    );
    assert!(svc.machine().is_incomplete());

    svc.drive().await;
    assert!(svc.machine().state().is_idle());
    assert_eq!(
        svc.machine().last_outcome(),
        Some(SweepOutcome::Incomplete(SweepKind::Heavy))
    );
    assert!(svc.retry_at().is_some());
    assert_eq!(svc.status_snapshot().incomplete_sweeps, 1);
}

#[tokio::test]
async fn test_failed_block_is_requeued_by_next_sweep() {
    let (mut svc, sim) = line_of_switches();
    sim.fail_next(RequestKind::UnicastBlock, 1);

    svc.request(SweepKind::Heavy);
    svc.drive().await;
    while !svc.machine().state().is_idle() {
        drain(&mut svc);
        svc.drive().await;
    }
    assert_eq!(
        svc.machine().last_outcome(),
        Some(SweepOutcome::Incomplete(SweepKind::Heavy))
    );

    sim.clear_requests();
    svc.request(SweepKind::Heavy);
    svc.drive().await;
    while !svc.machine().state().is_idle() {
        drain(&mut svc);
        svc.drive().await;
    }

    let blocks = sim
        .requests()
        .into_iter()
        .filter(|r| matches!(r, MadRequest::SetUnicastBlock { .. }))
        .count();
    assert_eq!(blocks, 1);
    assert_eq!(
        svc.machine().last_outcome(),
        Some(SweepOutcome::Completed(SweepKind::Heavy))
    );
    assert!(svc.retry_at().is_none());
}

#[tokio::test]
async fn test_discovery_failure_aborts_and_schedules_retry() {
    let (mut svc, sim) = line_of_switches();
    sim.fail_discovery(1);

    svc.request(SweepKind::Heavy);
    svc.drive().await;

    assert!(svc.machine().state().is_idle());
    assert_eq!(
        svc.machine().last_outcome(),
        Some(SweepOutcome::Aborted(SweepKind::Heavy))
    );
    assert_eq!(svc.machine().consecutive_failures(), 1);
    assert!(svc.retry_at().is_some());
    assert!(sim.requests().is_empty());
}

#[tokio::test]
async fn test_idle_work_waits_for_phase_boundary() {
    let (mut svc, _sim) = line_of_switches();
    let ran = Arc::new(AtomicUsize::new(0));

    svc.request(SweepKind::Heavy);
    svc.drive().await;
    assert_eq!(svc.machine().state(), waiting(SweepPhase::Address));

    let counter = Arc::clone(&ran);
    let done = Arc::clone(&ran);
    svc.on_command(Command::Idle(
        IdleWork::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .then(move || {
            done.fetch_add(10, Ordering::SeqCst);
        }),
    ));
    svc.drive().await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    drain(&mut svc);
    assert_eq!(ran.load(Ordering::SeqCst), 11);
}

#[tokio::test]
async fn test_preferred_master_cancels_sweep() {
    let (mut svc, sim) = line_of_switches();
    sim.add_peer(PeerInfo::new(Guid(3), 5, SmRole::Master));

    svc.request(SweepKind::Heavy);
    svc.drive().await;

    assert_eq!(svc.role().role(), SmRole::Standby);
    assert_eq!(svc.role().master().map(|m| m.guid), Some(Guid(3)));
    assert_eq!(
        svc.machine().last_outcome(),
        Some(SweepOutcome::Cancelled(SweepKind::Heavy))
    );
    assert!(sim.requests().is_empty());

    // Standby does not sweep.
    svc.request(SweepKind::Heavy);
    svc.drive().await;
    assert_eq!(sim.discoveries(), 1);
}

#[tokio::test]
async fn test_unknown_completion_is_ignored() {
    let (mut svc, _sim) = line_of_switches();
    svc.on_completion(Completion::success(TransactionId(999)));
    assert_eq!(svc.context().outstanding(), 0);
    assert!(svc.machine().state().is_idle());
}

async fn settle(service: &mut Service) {
    service.drive().await;
    while !service.machine().state().is_idle() {
        drain(service);
        service.drive().await;
    }
}

#[tokio::test]
async fn test_light_sweep_escalates_when_port_resets() {
    let (mut svc, sim) = line_of_switches();
    sim.add_endpoint(0x1000, 1).connect(0x1000, 1, 0x100, 3);

    svc.request(SweepKind::Heavy);
    settle(&mut svc).await;
    let lid = sim.port(0x1000, 1).unwrap().base_lid;
    assert!(lid.is_unicast());
    assert!(sim.trace_route(0x500, lid).is_some());

    // Rebooted endpoint: Init, no LID, cable unchanged.
    sim.reset_port(0x1000, 1);
    assert_eq!(sim.port(0x1000, 1).unwrap().link_state, LinkState::Init);

    sim.clear_requests();
    svc.request(SweepKind::Light);
    settle(&mut svc).await;

    let status = svc.status_snapshot();
    assert_eq!(status.light_sweeps, 1);
    assert_eq!(status.heavy_sweeps, 2);
    assert_eq!(
        svc.machine().last_outcome(),
        Some(SweepOutcome::Completed(SweepKind::Heavy))
    );
    let port = sim.port(0x1000, 1).unwrap();
    assert_eq!(port.link_state, LinkState::Active);
    assert_eq!(port.base_lid, lid);
    assert!(sim.trace_route(0x500, lid).is_some());
    assert!(sim
        .requests()
        .iter()
        .any(|r| matches!(r, MadRequest::SetPortLid { node, .. } if *node == Guid(0x1000))));
}

#[tokio::test]
async fn test_light_sweep_without_changes_stays_light() {
    let (mut svc, sim) = line_of_switches();
    sim.add_endpoint(0x1000, 1).connect(0x1000, 1, 0x100, 3);
    svc.request(SweepKind::Heavy);
    settle(&mut svc).await;

    svc.request(SweepKind::Light);
    settle(&mut svc).await;

    assert_eq!(svc.status_snapshot().heavy_sweeps, 1);
    assert_eq!(
        svc.machine().last_outcome(),
        Some(SweepOutcome::Completed(SweepKind::Light))
    );
}

#[tokio::test]
async fn test_hop_change_flag_tracks_reroutes() {
    let (mut svc, sim) = line_of_switches();
    svc.request(SweepKind::Heavy);
    settle(&mut svc).await;
    assert!(svc.context().hop_counts_changed);
    assert!(svc.context().any_change);

    svc.request(SweepKind::Heavy);
    settle(&mut svc).await;
    assert!(!svc.context().hop_counts_changed);
    assert!(!svc.context().any_change);

    sim.add_switch(0x600, 4).connect(0x500, 2, 0x600, 1);
    svc.request(SweepKind::Heavy);
    settle(&mut svc).await;
    assert!(svc.context().hop_counts_changed);
    assert_eq!(svc.status_snapshot().heavy_sweeps, 3);
}
