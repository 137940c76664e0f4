//! Fabric-wide state owned by the sweep engine.

use std::collections::BTreeMap;

use fabric_types::{Guid, JoinState, Lid, PortNum, TableBlock};

use super::errors::{RoutingError, RoutingResult};
use super::multicast::MulticastGroup;
use super::topology::TopologyStore;

/// Topology plus multicast groups. One value per process, passed by
/// exclusive borrow to whichever phase is mutating it.
#[derive(Debug, Default, Clone)]
pub struct FabricState {
    pub topology: TopologyStore,
    pub groups: BTreeMap<Lid, MulticastGroup>,
    /// Bumped whenever routing inputs change; published with snapshots.
    pub generation: u64,
}

impl FabricState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the group if needed and add a member.
    /// Returns true when membership changed.
    pub fn join_group(
        &mut self,
        mlid: Lid,
        mgid: [u8; 16],
        node: Guid,
        port: PortNum,
        state: JoinState,
    ) -> RoutingResult<bool> {
        let group = match self.groups.entry(mlid) {
            std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(MulticastGroup::new(mlid, mgid)?)
            }
        };
        Ok(group.join(node, port, state))
    }

    /// Remove a member; empty groups are deleted.
    /// Returns true when membership changed.
    pub fn leave_group(&mut self, mlid: Lid, node: Guid, port: PortNum) -> bool {
        let Some(group) = self.groups.get_mut(&mlid) else {
            return false;
        };
        let changed = group.leave(node, port);
        if group.is_empty() {
            self.groups.remove(&mlid);
        }
        changed
    }

    /// Drop memberships of ports that no longer exist.
    pub fn prune_group_members(&mut self) -> usize {
        let topology = &self.topology;
        let mut pruned = 0;
        for group in self.groups.values_mut() {
            let before = group.members.len();
            group.members.retain(|(node, port), _| {
                topology
                    .handle_of(*node)
                    .and_then(|h| topology.node(h))
                    .is_some_and(|n| n.port(*port).is_some())
            });
            pruned += before - group.members.len();
        }
        self.groups.retain(|_, g| !g.is_empty());
        pruned
    }

    /// Apply a successful unicast block download.
    pub fn commit_unicast_block(
        &mut self,
        switch: Guid,
        index: u16,
        block: &TableBlock,
    ) -> RoutingResult<()> {
        let handle = self
            .topology
            .handle_of(switch)
            .ok_or(RoutingError::NotASwitch(switch))?;
        self.topology.switch_mut(handle)?.commit_unicast_block(index, block)
    }

    /// Apply a successful multicast block download.
    pub fn commit_multicast_block(
        &mut self,
        switch: Guid,
        block: u16,
        position: u8,
        masks: &[u16],
    ) -> RoutingResult<()> {
        let handle = self
            .topology
            .handle_of(switch)
            .ok_or(RoutingError::NotASwitch(switch))?;
        self.topology
            .switch_mut(handle)?
            .commit_multicast_block(block, position, masks);
        self.settle_multicast_trees();
        Ok(())
    }

    /// Promote staged trees whose switches all carry the staged masks.
    /// Returns how many groups were promoted.
    pub fn settle_multicast_trees(&mut self) -> usize {
        let topology = &self.topology;
        let mut promoted = 0;
        for (mlid, group) in self.groups.iter_mut() {
            let Some(staged) = &group.staged_tree else {
                continue;
            };
            let programmed = staged
                .switches
                .keys()
                .chain(group.tree.switches.keys())
                .filter_map(|guid| topology.handle_of(*guid))
                .filter_map(|h| topology.switch(h).ok())
                .all(|sw| sw.live_mcast().ports(*mlid) == sw.staged_mcast().ports(*mlid));
            if programmed {
                if let Some(tree) = group.staged_tree.take() {
                    group.tree = tree;
                    promoted += 1;
                }
            }
        }
        promoted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_lifecycle() {
        let mut fabric = FabricState::new();
        let mlid = Lid(0xC010);
        assert!(fabric
            .join_group(mlid, [0; 16], Guid(1), 1, JoinState::FullMember)
            .unwrap());
        assert!(fabric.groups.contains_key(&mlid));
        assert!(fabric.leave_group(mlid, Guid(1), 1));
        assert!(!fabric.groups.contains_key(&mlid));
    }

    #[test]
    fn test_join_rejects_unicast_mlid() {
        let mut fabric = FabricState::new();
        assert!(fabric
            .join_group(Lid(3), [0; 16], Guid(1), 1, JoinState::FullMember)
            .is_err());
    }

    #[test]
    fn test_prune_removes_vanished_members() {
        let mut fabric = FabricState::new();
        fabric
            .join_group(Lid(0xC000), [0; 16], Guid(42), 1, JoinState::FullMember)
            .unwrap();
        assert_eq!(fabric.prune_group_members(), 1);
        assert!(fabric.groups.is_empty());
    }
}
