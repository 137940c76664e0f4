//! # Hop-Matrix Construction
//!
//! Fabric-wide min-hop relaxation over switches:
//!
//! 1. Every switch matrix is resized and reset.
//! 2. Seeds: a switch's own LIDs at 0 hops through port 0, and LIDs of
//!    directly attached endpoints at 1 hop through the attaching port.
//! 3. Each pass snapshots every switch's row minima and sets
//!    `hop[lid][p] = neighbor.least_hops(lid) + 1` for every port `p` linked to
//!    a neighbor switch, whenever that lowers the entry.
//! 4. Passes repeat while some hop count was set. A connected fabric settles
//!    within `switches + 1` passes; exceeding that is an internal error.
//!
//! Unreachable LIDs simply keep `HOP_NO_PATH`.

use std::collections::HashMap;

use fabric_types::{Lid, PortNum};
use tracing::{debug, error};

use crate::domain::{
    HopMatrix, NodeHandle, RoutingError, RoutingResult, TopologyStore, HOP_NO_PATH,
};

/// Outcome of one hop-matrix build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HopStats {
    pub switches: usize,
    /// Relaxation passes, the final no-change pass included.
    pub passes: usize,
    pub max_lid: u16,
    /// Switches whose row minima differ from the previous build.
    pub changed_switches: usize,
}

/// Rebuild every switch's hop matrix from the current topology.
pub fn build_hop_matrices(topology: &mut TopologyStore) -> RoutingResult<HopStats> {
    let max_lid = topology.max_lid();
    let switches = topology.switch_handles();

    let previous: HashMap<NodeHandle, Vec<u8>> = switches
        .iter()
        .filter_map(|h| {
            let sw = topology.switch(*h).ok()?;
            Some((*h, minima(sw.hops(), sw.hops().max_lid())))
        })
        .collect();

    for handle in &switches {
        topology.switch_mut(*handle)?.prepare_rebuild(max_lid)?;
    }
    topology.reset_traffic();

    let mut stats = HopStats {
        switches: switches.len(),
        max_lid,
        ..HopStats::default()
    };
    if max_lid == 0 {
        return Ok(stats);
    }

    seed(topology, &switches, max_lid)?;

    let neighbors = switch_neighbors(topology, &switches);
    let limit = switches.len() + 1;

    loop {
        stats.passes += 1;
        if stats.passes > limit {
            error!(passes = limit, switches = switches.len(), "hop relaxation did not converge");
            return Err(RoutingError::NonConvergent { passes: limit });
        }

        let columns: HashMap<NodeHandle, Vec<u8>> = switches
            .iter()
            .filter_map(|h| {
                let sw = topology.switch(*h).ok()?;
                Some((*h, minima(sw.hops(), max_lid)))
            })
            .collect();

        let mut some_hop_count_set = false;
        for (handle, links) in &neighbors {
            let sw = topology.switch_mut(*handle)?;
            for (port, neighbor) in links {
                let Some(column) = columns.get(neighbor) else {
                    continue;
                };
                for (i, remote) in column.iter().enumerate() {
                    if *remote == HOP_NO_PATH {
                        continue;
                    }
                    let lid = Lid(i as u16 + 1);
                    let candidate = remote.saturating_add(1);
                    if candidate < sw.hops().hops(lid, *port) {
                        sw.hops_mut().set_hop(lid, *port, candidate)?;
                        some_hop_count_set = true;
                    }
                }
            }
        }

        if !some_hop_count_set {
            break;
        }
    }

    stats.changed_switches = switches
        .iter()
        .filter(|h| {
            let now = topology
                .switch(**h)
                .map(|sw| minima(sw.hops(), max_lid))
                .unwrap_or_default();
            previous.get(*h).map(|before| before != &now).unwrap_or(true)
        })
        .count();

    debug!(
        switches = stats.switches,
        passes = stats.passes,
        max_lid = stats.max_lid,
        changed = stats.changed_switches,
        "hop matrices built"
    );
    Ok(stats)
}

/// Row minima for LIDs `1..=max_lid`.
fn minima(hops: &HopMatrix, max_lid: u16) -> Vec<u8> {
    (1..=max_lid).map(|raw| hops.least_hops(Lid(raw))).collect()
}

fn seed(topology: &mut TopologyStore, switches: &[NodeHandle], max_lid: u16) -> RoutingResult<()> {
    for handle in switches {
        let mut seeds: Vec<(u16, PortNum, u8)> = Vec::new();
        {
            let node = topology.try_node(*handle)?;
            if let Some(mgmt) = node.port(0) {
                seeds.extend(mgmt.lid_range().map(|raw| (raw, 0, 0)));
            }
            for port in node.ports.iter().skip(1) {
                let Some(remote) = port.remote.filter(|_| port.is_linked()) else {
                    continue;
                };
                let Some(peer) = topology.node(remote.node) else {
                    continue;
                };
                if peer.is_switch() {
                    continue;
                }
                if let Some(peer_port) = peer.port(remote.port) {
                    seeds.extend(peer_port.lid_range().map(|raw| (raw, port.num, 1)));
                }
            }
        }

        let sw = topology.switch_mut(*handle)?;
        for (raw, port, hops) in seeds {
            if raw <= max_lid {
                sw.hops_mut().set_hop(Lid(raw), port, hops)?;
            }
        }
    }
    Ok(())
}

/// For each switch, its (port, neighbor switch) pairs over live links.
fn switch_neighbors(
    topology: &TopologyStore,
    switches: &[NodeHandle],
) -> Vec<(NodeHandle, Vec<(PortNum, NodeHandle)>)> {
    switches
        .iter()
        .filter_map(|h| {
            let node = topology.node(*h)?;
            let links = node
                .ports
                .iter()
                .skip(1)
                .filter(|p| p.is_linked())
                .filter_map(|p| {
                    let remote = p.remote?;
                    topology
                        .node(remote.node)
                        .filter(|n| n.is_switch() && remote.node != *h)
                        .map(|_| (p.num, remote.node))
                })
                .collect();
            Some((*h, links))
        })
        .collect()
}
