//! # Forwarding-Table Synthesizer
//!
//! Turns port recommendations into staged tables and diffs the staged blocks
//! against what each switch was last successfully programmed with. Only
//! blocks with at least one changed entry become updates.

use std::collections::BTreeMap;

use fabric_types::{Guid, Lid, MadRequest, TableBlock, MAX_UNICAST_LID, NO_PATH};
use tracing::{debug, error, warn};

use super::hops::HopStats;
use super::multicast::build_multicast_tree;
use super::unicast::{recommend_path, PathOptions, PathTracking};
use crate::domain::{
    FabricState, ForwardingTable, MulticastTree, PortRef, RoutingError, RoutingResult,
    TopologyStore,
};

/// Per-sweep synthesis flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SynthesisFlags {
    /// At least one block was queued on some switch.
    pub any_change: bool,
    /// Hop counts moved since the previous build.
    pub some_hop_count_set: bool,
}

impl SynthesisFlags {
    pub fn merge(&mut self, other: SynthesisFlags) {
        self.any_change |= other.any_change;
        self.some_hop_count_set |= other.some_hop_count_set;
    }
}

impl From<&HopStats> for SynthesisFlags {
    fn from(stats: &HopStats) -> Self {
        Self {
            any_change: false,
            some_hop_count_set: stats.changed_switches > 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnicastBlockUpdate {
    pub switch: Guid,
    pub block: u16,
    pub contents: TableBlock,
}

impl UnicastBlockUpdate {
    pub fn to_request(&self) -> MadRequest {
        MadRequest::SetUnicastBlock {
            switch: self.switch,
            block: self.block,
            contents: self.contents.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastBlockUpdate {
    pub switch: Guid,
    pub block: u16,
    pub position: u8,
    pub masks: Vec<u16>,
}

impl MulticastBlockUpdate {
    pub fn to_request(&self) -> MadRequest {
        MadRequest::SetMulticastBlock {
            switch: self.switch,
            block: self.block,
            position: self.position,
            masks: self.masks.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnicastPlan {
    pub updates: Vec<UnicastBlockUpdate>,
    pub flags: SynthesisFlags,
    /// (switch, LID) pairs with no route.
    pub unreachable: usize,
    /// LIDs left out because a table was full.
    pub overflowed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MulticastPlan {
    pub updates: Vec<MulticastBlockUpdate>,
    pub flags: SynthesisFlags,
    /// Groups left unrouted because tree construction failed.
    pub failed_groups: Vec<Lid>,
}

/// Stage unicast tables for every switch and collect the changed blocks.
pub fn synthesize_unicast(
    topology: &mut TopologyStore,
    options: PathOptions,
    lmc_tracking: bool,
) -> RoutingResult<UnicastPlan> {
    let mut plan = UnicastPlan::default();
    let destinations = topology.destinations();
    topology.reset_traffic();

    for handle in topology.switch_handles() {
        let guid = topology.try_node(handle)?.guid;
        topology.switch_mut(handle)?.begin_unicast_staging();

        for dest in &destinations {
            let mut tracking = (lmc_tracking && dest.lmc > 0).then(PathTracking::new);

            for raw in dest.base_lid.range(dest.lmc) {
                if raw > MAX_UNICAST_LID {
                    break;
                }
                let lid = Lid(raw);
                if topology.owner_of(lid) != Some(dest.port) {
                    continue;
                }

                let port = recommend_path(topology, handle, dest.port, lid, options, tracking.as_mut())?;
                match topology.switch_mut(handle)?.staged_mut().set(lid, port) {
                    Ok(()) => {}
                    Err(RoutingError::TableFull { capacity }) => {
                        warn!(switch = %guid, lid = %lid, capacity, "forwarding table full");
                        plan.overflowed += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }

                match port {
                    NO_PATH => plan.unreachable += 1,
                    0 => {}
                    out => topology.count_path(PortRef::new(handle, out)),
                }
            }
        }

        let stale: Vec<Lid> = topology
            .switch(handle)?
            .staged()
            .routed_lids()
            .into_iter()
            .filter(|lid| topology.owner_of(*lid).is_none())
            .collect();
        let sw = topology.switch_mut(handle)?;
        for lid in stale {
            sw.staged_mut().set(lid, NO_PATH)?;
        }

        let changed = sw.changed_unicast_blocks();
        if !changed.is_empty() {
            debug!(switch = %guid, blocks = changed.len(), "unicast blocks changed");
        }
        plan.updates
            .extend(changed.into_iter().map(|(block, contents)| UnicastBlockUpdate {
                switch: guid,
                block,
                contents,
            }));
    }

    plan.flags.any_change = !plan.updates.is_empty();
    Ok(plan)
}

/// Build trees for every group, stage multicast tables and collect the
/// changed block positions.
pub fn synthesize_multicast(
    fabric: &mut FabricState,
    ignore_existing: bool,
) -> RoutingResult<MulticastPlan> {
    let mut plan = MulticastPlan::default();
    let switches = fabric.topology.switch_handles();

    // Trees are computed against the previous staging, then staging restarts.
    let mut trees: BTreeMap<Lid, MulticastTree> = BTreeMap::new();
    for (mlid, group) in &fabric.groups {
        match build_multicast_tree(&fabric.topology, group, ignore_existing) {
            Ok(tree) => {
                trees.insert(*mlid, tree);
            }
            Err(e @ RoutingError::MulticastLoop { .. }) => {
                error!(mlid = %mlid, error = %e, "multicast group left unrouted");
                plan.failed_groups.push(*mlid);
                trees.insert(*mlid, MulticastTree::default());
            }
            Err(e) => return Err(e),
        }
    }

    for handle in &switches {
        fabric.topology.switch_mut(*handle)?.begin_multicast_staging();
    }

    for (mlid, tree) in &trees {
        for (guid, node) in &tree.switches {
            let Some(handle) = fabric.topology.handle_of(*guid) else {
                continue;
            };
            fabric
                .topology
                .switch_mut(handle)?
                .staged_mcast_mut()
                .set_ports(*mlid, &node.ports)?;
        }
    }

    for (mlid, tree) in trees {
        if let Some(group) = fabric.groups.get_mut(&mlid) {
            group.staged_tree = Some(tree);
        }
    }

    for handle in switches {
        let guid = fabric.topology.try_node(handle)?.guid;
        let changed = fabric.topology.switch(handle)?.changed_multicast_blocks();
        plan.updates
            .extend(changed.into_iter().map(|(block, position, masks)| MulticastBlockUpdate {
                switch: guid,
                block,
                position,
                masks,
            }));
    }

    plan.flags.any_change = !plan.updates.is_empty();
    fabric.settle_multicast_trees();
    Ok(plan)
}
