//! # Multicast Tree Construction
//!
//! One spanning tree per group, rooted at the switch with the smallest
//! worst-case hop distance to the members (ties: smaller hop sum, then
//! smaller GUID). Branching walks down from the root; at every switch each
//! member is sent out the port from `recommend_multicast_path`.
//!
//! Port choice never load-balances. The first routable minimum-hop port wins,
//! unless a minimum-hop port already carries the group, in which case that
//! port wins. Revisiting a switch during branching is reported as
//! `MulticastLoop` and the group is left unrouted.

use std::collections::{BTreeMap, BTreeSet};

use fabric_types::{Lid, PortNum, NO_PATH};
use tracing::{debug, warn};

use crate::domain::{
    MulticastGroup, MulticastTree, NodeHandle, PortRef, RoutingError, RoutingResult,
    TopologyStore, TreeNode, HOP_NO_PATH,
};

/// Member resolved against the topology.
#[derive(Debug, Clone, Copy)]
struct Member {
    port: PortRef,
    lid: Lid,
}

/// Recommend the output port on `switch` toward `dest` for group `mlid`.
pub fn recommend_multicast_path(
    topology: &TopologyStore,
    switch: NodeHandle,
    dest: PortRef,
    mlid: Lid,
    ignore_existing: bool,
) -> RoutingResult<PortNum> {
    if !mlid.is_multicast() {
        return Err(RoutingError::InvalidParameter(format!(
            "{} is not a multicast lid",
            mlid
        )));
    }
    let sw = topology.switch(switch)?;
    let carriers = sw.staged_mcast().ports(mlid);
    select_port(topology, switch, dest, mlid, ignore_existing, &carriers)
}

fn select_port(
    topology: &TopologyStore,
    switch: NodeHandle,
    dest: PortRef,
    mlid: Lid,
    ignore_existing: bool,
    chosen: &BTreeSet<PortNum>,
) -> RoutingResult<PortNum> {
    if dest.node == switch {
        return Ok(0);
    }
    let node = topology.try_node(switch)?;
    let sw = topology.switch(switch)?;

    let Some(lid) = topology
        .port(dest)
        .map(|p| p.base_lid)
        .filter(Lid::is_unicast)
    else {
        return Ok(NO_PATH);
    };

    let least = sw.hops().least_hops(lid);
    if least == HOP_NO_PATH {
        return Ok(NO_PATH);
    }
    if least == 0 {
        return Ok(0);
    }

    let mut eligible = node
        .ports
        .iter()
        .skip(1)
        .filter(|p| p.is_routable() && sw.hops().hops(lid, p.num) == least)
        .map(|p| p.num)
        .peekable();

    let Some(first) = eligible.peek().copied() else {
        return Ok(NO_PATH);
    };
    if ignore_existing {
        return Ok(first);
    }

    let live = sw.live_mcast();
    let carrier = eligible.find(|p| chosen.contains(p) || live.carries(mlid, *p));
    Ok(carrier.unwrap_or(first))
}

/// Build the spanning tree for `group` over the current hop matrices.
pub fn build_multicast_tree(
    topology: &TopologyStore,
    group: &MulticastGroup,
    ignore_existing: bool,
) -> RoutingResult<MulticastTree> {
    let members: Vec<Member> = group
        .members
        .keys()
        .filter_map(|(guid, num)| {
            let handle = topology.handle_of(*guid)?;
            let port = PortRef::new(handle, *num);
            let lid = topology.port(port)?.base_lid;
            lid.is_unicast().then_some(Member { port, lid })
        })
        .collect();

    if members.is_empty() {
        return Ok(MulticastTree::default());
    }

    let Some(root) = select_root(topology, &members)? else {
        warn!(mlid = %group.mlid, members = members.len(), "no switch reaches every member");
        return Ok(MulticastTree::default());
    };

    let mut tree = MulticastTree {
        root: Some(topology.try_node(root)?.guid),
        switches: BTreeMap::new(),
    };
    let mut visited: BTreeSet<NodeHandle> = BTreeSet::new();
    let mut stack: Vec<(NodeHandle, Option<PortNum>, Vec<Member>)> = vec![(root, None, members)];

    while let Some((handle, upstream, members)) = stack.pop() {
        let guid = topology.try_node(handle)?.guid;
        if !visited.insert(handle) {
            return Err(RoutingError::MulticastLoop {
                mlid: group.mlid,
                switch: guid,
            });
        }

        let mut ports: BTreeSet<PortNum> = upstream.into_iter().collect();
        let mut downstream: BTreeMap<PortNum, Vec<Member>> = BTreeMap::new();

        for member in members {
            let port = select_port(
                topology,
                handle,
                member.port,
                group.mlid,
                ignore_existing,
                &ports,
            )?;
            if port == NO_PATH {
                debug!(mlid = %group.mlid, member = %member.lid, switch = %guid, "member unreachable");
                continue;
            }
            ports.insert(port);
            if port != 0 {
                downstream.entry(port).or_default().push(member);
            }
        }

        for (port, members) in downstream.into_iter().rev() {
            let Some(remote) = topology.remote(PortRef::new(handle, port)) else {
                continue;
            };
            let leads_to_switch = topology
                .node(remote.node)
                .is_some_and(|n| n.is_switch());
            if leads_to_switch {
                stack.push((remote.node, Some(remote.port), members));
            }
        }

        tree.switches.insert(guid, TreeNode { upstream, ports });
    }

    Ok(tree)
}

/// Switch minimizing (max hops, hop sum, GUID) to all members.
fn select_root(topology: &TopologyStore, members: &[Member]) -> RoutingResult<Option<NodeHandle>> {
    let mut best: Option<((u32, u32, u64), NodeHandle)> = None;

    for handle in topology.switch_handles() {
        let node = topology.try_node(handle)?;
        let sw = topology.switch(handle)?;
        let mut max = 0u32;
        let mut sum = 0u32;
        let mut reachable = true;

        for member in members {
            let hops = if member.port.node == handle {
                0
            } else {
                sw.hops().least_hops(member.lid)
            };
            if hops == HOP_NO_PATH {
                reachable = false;
                break;
            }
            max = max.max(hops as u32);
            sum += hops as u32;
        }

        if !reachable {
            continue;
        }
        let key = (max, sum, node.guid.raw());
        if best.as_ref().map_or(true, |(k, _)| key < *k) {
            best = Some((key, handle));
        }
    }

    Ok(best.map(|(_, h)| h))
}
