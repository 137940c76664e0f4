//! # Unicast Port Recommendation
//!
//! Picks the output port a switch uses toward one destination LID.
//!
//! ## Selection Order
//!
//! 1. Destination on this switch → port 0.
//! 2. No hop count → `NO_PATH`.
//! 3. Existing live entry still on a minimum-hop routable port → keep it.
//! 4. Otherwise, among routable ports at minimum hops:
//!    - dimension order: restrict to ports leading to the same neighbor
//!      node as the first such port;
//!    - LMC tracking: prefer an unused remote system, then an unused remote
//!      node;
//!    - then fewest routed paths, then lowest port number.
//!
//! A port above the minimum hop count is never returned. That alone keeps
//! unicast forwarding loop-free, whatever the load-balancing choice.

use std::collections::HashSet;

use fabric_types::{Guid, Lid, PortNum, NO_PATH};

use crate::domain::{
    ForwardingTable, NodeHandle, PortRef, RoutingError, RoutingResult, TopologyStore, HOP_NO_PATH,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathOptions {
    /// Ignore the live table when choosing.
    pub ignore_existing: bool,
    /// Dimension-ordered selection for mesh/torus fabrics.
    pub dimension_order: bool,
}

/// Remote systems and nodes already used by other LIDs of one
/// multi-LID destination.
#[derive(Debug, Clone, Default)]
pub struct PathTracking {
    used_systems: HashSet<Guid>,
    used_nodes: HashSet<Guid>,
}

impl PathTracking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, system: Guid, node: Guid) {
        self.used_systems.insert(system);
        self.used_nodes.insert(node);
    }

    pub fn system_used(&self, system: &Guid) -> bool {
        self.used_systems.contains(system)
    }

    pub fn node_used(&self, node: &Guid) -> bool {
        self.used_nodes.contains(node)
    }

    pub fn clear(&mut self) {
        self.used_systems.clear();
        self.used_nodes.clear();
    }
}

struct Candidate {
    port: PortNum,
    traffic: u32,
    remote_node: Guid,
    remote_system: Guid,
}

/// Recommend the output port on `switch` toward `lid`, owned by `dest`.
///
/// Returns `NO_PATH` when the LID is unreachable from `switch`.
pub fn recommend_path(
    topology: &TopologyStore,
    switch: NodeHandle,
    dest: PortRef,
    lid: Lid,
    options: PathOptions,
    tracking: Option<&mut PathTracking>,
) -> RoutingResult<PortNum> {
    if !lid.is_unicast() {
        return Err(RoutingError::InvalidParameter(format!(
            "{} is not a unicast lid",
            lid
        )));
    }
    if options.dimension_order && tracking.is_some() {
        return Err(RoutingError::InvalidParameter(
            "dimension-order routing cannot be combined with lmc tracking".into(),
        ));
    }

    let node = topology.try_node(switch)?;
    let sw = topology.switch(switch)?;

    if dest.node == switch {
        return Ok(0);
    }

    let least = sw.hops().least_hops(lid);
    if least == HOP_NO_PATH {
        return Ok(NO_PATH);
    }
    if least == 0 {
        return Ok(0);
    }

    let remote_identity = |port: PortNum| -> Option<(Guid, Guid)> {
        let remote = node.port(port)?.remote?;
        let peer = topology.node(remote.node)?;
        Some((peer.guid, peer.system_guid))
    };

    if !options.ignore_existing {
        let existing = sw.live().get(lid);
        let usable = existing != 0
            && existing != NO_PATH
            && node.port(existing).is_some_and(|p| p.is_routable())
            && sw.hops().hops(lid, existing) == least;
        if usable {
            if let (Some(track), Some((peer, system))) = (tracking, remote_identity(existing)) {
                track.record(system, peer);
            }
            return Ok(existing);
        }
    }

    let mut candidates: Vec<Candidate> = node
        .ports
        .iter()
        .skip(1)
        .filter(|p| p.is_routable() && sw.hops().hops(lid, p.num) == least)
        .filter_map(|p| {
            let (remote_node, remote_system) = remote_identity(p.num)?;
            Some(Candidate {
                port: p.num,
                traffic: p.traffic,
                remote_node,
                remote_system,
            })
        })
        .collect();

    if options.dimension_order {
        if let Some(first) = candidates.first().map(|c| c.remote_node) {
            candidates.retain(|c| c.remote_node == first);
        }
    }

    let chosen = match tracking {
        Some(track) => {
            let best = candidates.iter().min_by_key(|c| {
                (
                    track.system_used(&c.remote_system),
                    track.node_used(&c.remote_node),
                    c.traffic,
                    c.port,
                )
            });
            if let Some(c) = best {
                track.record(c.remote_system, c.remote_node);
            }
            best
        }
        None => candidates.iter().min_by_key(|c| (c.traffic, c.port)),
    };

    Ok(chosen.map(|c| c.port).unwrap_or(NO_PATH))
}
