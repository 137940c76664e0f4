//! # LINK phase
//!
//! Folds the discovery report into the topology store.
//!
//! - Nodes are created on first sight and updated in place afterwards; a node
//!   whose type or port count changed is replaced.
//! - A link is recorded only when both ends claim each other. One-sided
//!   claims are logged and discarded.
//! - Linked ports still in `Init` or `Armed` are driven to `Active`. The new
//!   state is applied when the request completes.
//!
//! A light sweep runs the same comparison without touching the store and only
//! reports whether anything changed.

use std::collections::HashMap;

use fabric_types::{
    DiscoveredNode, DiscoveredPort, DiscoveryReport, Guid, LinkState, MadRequest, PortNum,
};
use sm_01_routing::{Node, Port, PortRef, Switch, TopologyStore};
use tracing::{debug, info, warn};

use crate::domain::phase::{PhaseEnv, PhaseManager, PhaseOutcome};
use crate::domain::state_machine::{SweepKind, SweepPhase};
use crate::error::SweepResult;

type End = (Guid, PortNum);

/// Link claims split into corroborated pairs and one-sided claims.
#[derive(Debug, Default)]
pub struct LinkClaims {
    /// Each corroborated end mapped to its partner (both directions present).
    pub confirmed: HashMap<End, End>,
    pub one_sided: Vec<(End, End)>,
}

impl LinkClaims {
    pub fn from_report(report: &DiscoveryReport) -> Self {
        let claims: HashMap<End, End> = report
            .nodes
            .iter()
            .flat_map(|n| {
                n.ports
                    .iter()
                    .filter(|p| p.link_state.is_up())
                    .filter_map(move |p| {
                        p.remote.map(|r| ((n.guid, p.num), (r.node_guid, r.port)))
                    })
            })
            .collect();

        let mut out = Self::default();
        for (local, remote) in &claims {
            if local != remote && claims.get(remote) == Some(local) {
                out.confirmed.insert(*local, *remote);
            } else {
                out.one_sided.push((*local, *remote));
            }
        }
        out.one_sided.sort();
        out
    }

    pub fn partner(&self, node: Guid, port: PortNum) -> Option<End> {
        self.confirmed.get(&(node, port)).copied()
    }
}

fn highest_port(node: &DiscoveredNode) -> PortNum {
    node.ports.iter().map(|p| p.num).max().unwrap_or(0)
}

fn compatible(node: &Node, discovered: &DiscoveredNode) -> bool {
    node.node_type == discovered.node_type
        && node.num_ports() == highest_port(discovered)
        && node.is_switch() == discovered.switch.is_some()
}

/// A reset port comes back in `Init` with LID 0, so the exact state and
/// addressing count, not just whether a link is up.
fn port_differs(port: &Port, reported: &DiscoveredPort) -> bool {
    port.link_state != reported.link_state
        || port.healthy != reported.healthy
        || port.base_lid != reported.base_lid
        || port.lmc != reported.lmc
}

/// Remote end currently recorded for `at`, as GUID and port.
fn recorded_partner(topology: &TopologyStore, at: PortRef) -> Option<End> {
    let remote = topology.remote(at)?;
    let node = topology.node(remote.node)?;
    Some((node.guid, remote.port))
}

#[derive(Debug, Default)]
pub struct LinkManager;

impl LinkManager {
    pub fn new() -> Self {
        Self
    }

    /// Create or refresh one node. Returns true if routing inputs changed.
    fn upsert(
        topology: &mut TopologyStore,
        discovered: &DiscoveredNode,
        sweep_id: u64,
    ) -> SweepResult<bool> {
        let mut changed = false;

        let handle = match topology.handle_of(discovered.guid) {
            Some(h) if topology.node(h).is_some_and(|n| compatible(n, discovered)) => h,
            existing => {
                if let Some(h) = existing {
                    info!(node = %discovered.guid, "node changed shape, replacing");
                    topology.remove(h);
                } else {
                    info!(node = %discovered.guid, kind = %discovered.node_type, "new node discovered");
                }
                let ports = highest_port(discovered);
                let mut node = Node::new(
                    discovered.guid,
                    discovered.system_guid,
                    discovered.node_type,
                    ports,
                );
                node.switch = discovered.switch.map(|cap| Switch::new(cap, ports));
                changed = true;
                topology.insert(node)?
            }
        };

        let Some(node) = topology.node_mut(handle) else {
            return Ok(changed);
        };
        node.system_guid = discovered.system_guid;
        node.description.clone_from(&discovered.description);
        node.seen_in = sweep_id;

        for dp in &discovered.ports {
            let Some(port) = node.port_mut(dp.num) else {
                continue;
            };
            if port_differs(port, dp) {
                changed = true;
            }
            port.guid = dp.guid;
            port.link_state = dp.link_state;
            port.healthy = dp.healthy;
            port.base_lid = dp.base_lid;
            port.lmc = dp.lmc;
        }
        Ok(changed)
    }

    /// Make the store's links match the confirmed claims of reported ports.
    fn reconcile_links(
        topology: &mut TopologyStore,
        report: &DiscoveryReport,
        claims: &LinkClaims,
    ) -> bool {
        let mut changed = false;
        for node in &report.nodes {
            let Some(handle) = topology.handle_of(node.guid) else {
                continue;
            };
            for dp in &node.ports {
                let at = PortRef::new(handle, dp.num);
                let want = claims.partner(node.guid, dp.num);
                if recorded_partner(topology, at) == want {
                    continue;
                }
                changed = true;
                match want.and_then(|(g, p)| topology.handle_of(g).map(|h| PortRef::new(h, p))) {
                    Some(remote) => {
                        if let Err(e) = topology.link(at, remote) {
                            warn!(node = %node.guid, port = dp.num, error = %e, "cannot record link");
                            topology.unlink(at);
                        }
                    }
                    None => {
                        debug!(node = %node.guid, port = dp.num, "link gone");
                        topology.unlink(at);
                    }
                }
            }
        }
        changed
    }

    /// Whether the report differs from the store in anything routing uses.
    pub fn detect_changes(
        topology: &TopologyStore,
        report: &DiscoveryReport,
        claims: &LinkClaims,
    ) -> bool {
        if report.nodes.len() != topology.len() {
            return true;
        }
        for node in &report.nodes {
            let Some(handle) = topology.handle_of(node.guid) else {
                return true;
            };
            let Some(known) = topology.node(handle) else {
                return true;
            };
            if !compatible(known, node) {
                return true;
            }
            for dp in &node.ports {
                let Some(port) = known.port(dp.num) else {
                    return true;
                };
                if port_differs(port, dp) {
                    debug!(
                        node = %node.guid,
                        port = dp.num,
                        state = ?dp.link_state,
                        lid = %dp.base_lid,
                        "port changed"
                    );
                    return true;
                }
                if recorded_partner(topology, PortRef::new(handle, dp.num))
                    != claims.partner(node.guid, dp.num)
                {
                    return true;
                }
            }
        }
        false
    }
}

impl PhaseManager for LinkManager {
    fn phase(&self) -> SweepPhase {
        SweepPhase::Link
    }

    fn run(&mut self, env: &mut PhaseEnv<'_>) -> SweepResult<PhaseOutcome> {
        let claims = LinkClaims::from_report(env.report);
        for (local, remote) in &claims.one_sided {
            warn!(
                node = %local.0,
                port = local.1,
                claimed = %remote.0,
                claimed_port = remote.1,
                "discarding one-sided link claim"
            );
        }

        if env.kind == SweepKind::Light {
            if Self::detect_changes(&env.fabric.topology, env.report, &claims) {
                info!("light sweep detected a topology change");
                env.ctx.topology_changed = true;
            }
            return Ok(PhaseOutcome::Done);
        }

        let sweep_id = env.ctx.sweep_id;
        let mut changed = false;
        for node in &env.report.nodes {
            changed |= Self::upsert(&mut env.fabric.topology, node, sweep_id)?;
        }
        changed |= Self::reconcile_links(&mut env.fabric.topology, env.report, &claims);
        if changed {
            env.ctx.topology_changed = true;
            env.fabric.generation += 1;
        }

        let mut issued = 0;
        for node in &env.report.nodes {
            for dp in &node.ports {
                let waiting = matches!(dp.link_state, LinkState::Init | LinkState::Armed);
                if waiting && claims.partner(node.guid, dp.num).is_some() {
                    let request = MadRequest::SetPortState {
                        node: node.guid,
                        port: dp.num,
                        state: LinkState::Active,
                    };
                    if env.issue(request) {
                        issued += 1;
                    }
                }
            }
        }

        debug!(
            nodes = env.report.nodes.len(),
            links = claims.confirmed.len() / 2,
            bring_up = issued,
            changed,
            "link phase done"
        );
        Ok(PhaseOutcome::from_issued(issued))
    }
}
