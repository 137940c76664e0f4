//! # Topology Store
//!
//! Arena of discovered nodes addressed by integer handles. Links are stored
//! as handle pairs on both ends, so removing a node can sever every link
//! without chasing references.
//!
//! ## Invariants
//!
//! - A handle stays valid while its node lives. Removing a node severs its
//!   links and LIDs before the slot goes back on the free list, so a reused
//!   handle never inherits references.
//! - `a.remote == Some(b)` iff `b.remote == Some(a)`.
//! - The LID table is rebuilt explicitly (`rebuild_lid_table`) after the
//!   address phase; it is never patched field by field.

use std::collections::HashMap;
use std::fmt;

use fabric_types::{Guid, LinkState, Lid, NodeType, PortNum, MAX_UNICAST_LID};

use super::errors::{RoutingError, RoutingResult};
use super::switch::Switch;

// =============================================================================
// HANDLES
// =============================================================================

/// Stable index of a node inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeHandle(pub u32);

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One port of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRef {
    pub node: NodeHandle,
    pub port: PortNum,
}

impl PortRef {
    pub const fn new(node: NodeHandle, port: PortNum) -> Self {
        Self { node, port }
    }
}

// =============================================================================
// NODES AND PORTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub num: PortNum,
    pub guid: Guid,
    pub base_lid: Lid,
    pub lmc: u8,
    pub link_state: LinkState,
    /// Link partner; only set when both sides corroborate the link.
    pub remote: Option<PortRef>,
    /// False when error counters disqualify the port from routing.
    pub healthy: bool,
    /// Unicast paths routed out of this port during the current rebuild.
    pub traffic: u32,
}

impl Port {
    pub fn new(num: PortNum, guid: Guid) -> Self {
        Self {
            num,
            guid,
            base_lid: Lid(0),
            lmc: 0,
            link_state: LinkState::Down,
            remote: None,
            healthy: true,
            traffic: 0,
        }
    }

    /// Has a corroborated partner and a physically up link.
    pub fn is_linked(&self) -> bool {
        self.remote.is_some() && self.link_state.is_up()
    }

    /// Eligible as an output port for routing. Hops are still counted over
    /// links in `Init` or `Armed`; forwarding waits until they are `Active`.
    pub fn is_routable(&self) -> bool {
        self.is_linked() && self.link_state.is_active() && self.healthy
    }

    /// LIDs answered by this port, empty when unaddressed.
    pub fn lid_range(&self) -> std::ops::RangeInclusive<u16> {
        if self.base_lid.is_unicast() {
            self.base_lid.range(self.lmc)
        } else {
            // empty range
            1..=0
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub guid: Guid,
    pub system_guid: Guid,
    pub node_type: NodeType,
    pub description: String,
    /// Indexed by port number. Endpoints carry an unused port 0.
    pub ports: Vec<Port>,
    /// Routing state, present for switches only.
    pub switch: Option<Switch>,
    /// Discovery generation that last reported this node.
    pub seen_in: u64,
}

impl Node {
    /// Node with ports `0..=num_ports`, all down.
    pub fn new(guid: Guid, system_guid: Guid, node_type: NodeType, num_ports: PortNum) -> Self {
        let ports = (0..=num_ports)
            .map(|num| Port::new(num, Guid(guid.raw().wrapping_add(num as u64))))
            .collect();
        Self {
            guid,
            system_guid,
            node_type,
            description: String::new(),
            ports,
            switch: None,
            seen_in: 0,
        }
    }

    pub fn is_switch(&self) -> bool {
        self.switch.is_some()
    }

    /// Highest port number.
    pub fn num_ports(&self) -> PortNum {
        self.ports.len().saturating_sub(1) as PortNum
    }

    pub fn port(&self, num: PortNum) -> Option<&Port> {
        self.ports.get(num as usize)
    }

    pub fn port_mut(&mut self, num: PortNum) -> Option<&mut Port> {
        self.ports.get_mut(num as usize)
    }

    /// Ports that carry addresses: port 0 on switches, data ports elsewhere.
    pub fn addressable_ports(&self) -> impl Iterator<Item = &Port> {
        let switch = self.is_switch();
        self.ports
            .iter()
            .filter(move |p| if switch { p.num == 0 } else { p.num != 0 })
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Address destination: a port plus its base LID and LMC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub port: PortRef,
    pub base_lid: Lid,
    pub lmc: u8,
}

#[derive(Debug, Default, Clone)]
pub struct TopologyStore {
    nodes: Vec<Option<Node>>,
    by_guid: HashMap<Guid, NodeHandle>,
    lid_owners: Vec<Option<PortRef>>,
    /// Vacated slots, reused by `insert`.
    free: Vec<NodeHandle>,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.by_guid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_guid.is_empty()
    }

    /// Add a node. Fails if its GUID is already present.
    pub fn insert(&mut self, node: Node) -> RoutingResult<NodeHandle> {
        if self.by_guid.contains_key(&node.guid) {
            return Err(RoutingError::InvalidParameter(format!(
                "node {} already present",
                node.guid
            )));
        }
        let guid = node.guid;
        let handle = match self.free.pop() {
            Some(handle) => {
                self.nodes[handle.0 as usize] = Some(node);
                handle
            }
            None => {
                self.nodes.push(Some(node));
                NodeHandle(self.nodes.len() as u32 - 1)
            }
        };
        self.by_guid.insert(guid, handle);
        Ok(handle)
    }

    /// Remove a node, severing its links and releasing its LIDs.
    pub fn remove(&mut self, handle: NodeHandle) -> Option<Node> {
        let mut node = self.nodes.get_mut(handle.0 as usize)?.take()?;
        self.by_guid.remove(&node.guid);

        for port in &mut node.ports {
            if let Some(remote) = port.remote.take() {
                if let Some(peer) = self.port_mut(remote) {
                    peer.remote = None;
                }
            }
        }
        for owner in self.lid_owners.iter_mut() {
            if owner.map(|o| o.node) == Some(handle) {
                *owner = None;
            }
        }
        self.free.push(handle);
        Some(node)
    }

    pub fn node(&self, handle: NodeHandle) -> Option<&Node> {
        self.nodes.get(handle.0 as usize)?.as_ref()
    }

    pub fn node_mut(&mut self, handle: NodeHandle) -> Option<&mut Node> {
        self.nodes.get_mut(handle.0 as usize)?.as_mut()
    }

    /// Like `node`, but reports unknown handles as an error.
    pub fn try_node(&self, handle: NodeHandle) -> RoutingResult<&Node> {
        self.node(handle).ok_or(RoutingError::UnknownNode(handle.0))
    }

    /// Switch routing state of `handle`.
    pub fn switch(&self, handle: NodeHandle) -> RoutingResult<&Switch> {
        let node = self.try_node(handle)?;
        node.switch.as_ref().ok_or(RoutingError::NotASwitch(node.guid))
    }

    pub fn switch_mut(&mut self, handle: NodeHandle) -> RoutingResult<&mut Switch> {
        let node = self
            .nodes
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(RoutingError::UnknownNode(handle.0))?;
        let guid = node.guid;
        node.switch.as_mut().ok_or(RoutingError::NotASwitch(guid))
    }

    pub fn handle_of(&self, guid: Guid) -> Option<NodeHandle> {
        self.by_guid.get(&guid).copied()
    }

    /// Live nodes in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeHandle, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeHandle(i as u32), n)))
    }

    /// Switch handles in handle order.
    pub fn switch_handles(&self) -> Vec<NodeHandle> {
        self.iter()
            .filter(|(_, n)| n.is_switch())
            .map(|(h, _)| h)
            .collect()
    }

    pub fn switch_count(&self) -> usize {
        self.iter().filter(|(_, n)| n.is_switch()).count()
    }

    pub fn port(&self, at: PortRef) -> Option<&Port> {
        self.node(at.node)?.port(at.port)
    }

    pub fn port_mut(&mut self, at: PortRef) -> Option<&mut Port> {
        self.node_mut(at.node)?.port_mut(at.port)
    }

    pub fn remote(&self, at: PortRef) -> Option<PortRef> {
        self.port(at)?.remote
    }

    /// Join two ports, detaching any previous partners first.
    pub fn link(&mut self, a: PortRef, b: PortRef) -> RoutingResult<()> {
        if self.port(a).is_none() || self.port(b).is_none() {
            return Err(RoutingError::InvalidParameter(format!(
                "cannot link missing port {:?} <-> {:?}",
                a, b
            )));
        }
        if a == b {
            return Err(RoutingError::InvalidParameter(format!(
                "port {:?} linked to itself",
                a
            )));
        }
        self.unlink(a);
        self.unlink(b);
        if let Some(p) = self.port_mut(a) {
            p.remote = Some(b);
        }
        if let Some(p) = self.port_mut(b) {
            p.remote = Some(a);
        }
        Ok(())
    }

    /// Detach a port from its partner, if any.
    pub fn unlink(&mut self, at: PortRef) {
        let Some(remote) = self.port_mut(at).and_then(|p| p.remote.take()) else {
            return;
        };
        if let Some(peer) = self.port_mut(remote) {
            if peer.remote == Some(at) {
                peer.remote = None;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Addressing
    // -------------------------------------------------------------------------

    /// Recompute LID ownership from the ports' base LIDs.
    ///
    /// Returns the LIDs claimed by more than one port; the first claimant in
    /// handle order keeps ownership.
    pub fn rebuild_lid_table(&mut self) -> Vec<Lid> {
        let mut owners: Vec<Option<PortRef>> = Vec::new();
        let mut conflicts = Vec::new();

        for (handle, node) in self.iter() {
            for port in node.addressable_ports() {
                for raw in port.lid_range() {
                    if raw > MAX_UNICAST_LID {
                        break;
                    }
                    let idx = raw as usize;
                    if owners.len() <= idx {
                        owners.resize(idx + 1, None);
                    }
                    if owners[idx].is_some() {
                        conflicts.push(Lid(raw));
                    } else {
                        owners[idx] = Some(PortRef::new(handle, port.num));
                    }
                }
            }
        }

        self.lid_owners = owners;
        conflicts
    }

    pub fn owner_of(&self, lid: Lid) -> Option<PortRef> {
        self.lid_owners.get(lid.raw() as usize).copied().flatten()
    }

    /// Highest owned LID, 0 when none.
    pub fn max_lid(&self) -> u16 {
        self.lid_owners
            .iter()
            .rposition(Option::is_some)
            .map(|i| i as u16)
            .unwrap_or(0)
    }

    /// Addressed ports sorted by base LID.
    pub fn destinations(&self) -> Vec<Destination> {
        let mut out: Vec<Destination> = self
            .iter()
            .flat_map(|(handle, node)| {
                node.addressable_ports()
                    .filter(|p| p.base_lid.is_unicast())
                    .map(move |p| Destination {
                        port: PortRef::new(handle, p.num),
                        base_lid: p.base_lid,
                        lmc: p.lmc,
                    })
            })
            .collect();
        out.sort_by_key(|d| d.base_lid);
        out
    }

    // -------------------------------------------------------------------------
    // Traffic profile
    // -------------------------------------------------------------------------

    pub fn reset_traffic(&mut self) {
        for node in self.nodes.iter_mut().flatten() {
            for port in &mut node.ports {
                port.traffic = 0;
            }
        }
    }

    /// Account one more unicast path through `at`.
    pub fn count_path(&mut self, at: PortRef) {
        if let Some(port) = self.port_mut(at) {
            port.traffic = port.traffic.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(guid: u64) -> Node {
        Node::new(Guid(guid), Guid(guid), NodeType::Endpoint, 1)
    }

    #[test]
    fn test_removed_slot_is_reused() {
        let mut store = TopologyStore::new();
        let a = store.insert(endpoint(1)).unwrap();
        let b = store.insert(endpoint(2)).unwrap();
        store.remove(a);
        assert!(store.node(a).is_none());
        assert!(store.remove(a).is_none());
        assert_eq!(store.len(), 1);

        let c = store.insert(endpoint(3)).unwrap();
        assert_eq!(c, a);
        assert_eq!(store.handle_of(Guid(1)), None);
        assert_eq!(store.handle_of(Guid(3)), Some(c));
        assert_eq!(store.node(c).unwrap().guid, Guid(3));
        assert_eq!(store.iter().count(), 2);

        let d = store.insert(endpoint(4)).unwrap();
        assert_ne!(d, b);
        assert_ne!(d, c);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_churn_keeps_arena_bounded() {
        let mut store = TopologyStore::new();
        store.insert(endpoint(1)).unwrap();
        for guid in 2..50 {
            let h = store.insert(endpoint(guid)).unwrap();
            store.remove(h);
        }
        assert_eq!(store.len(), 1);
        assert_eq!(store.nodes.len(), 2);
    }

    #[test]
    fn test_duplicate_guid_rejected() {
        let mut store = TopologyStore::new();
        store.insert(endpoint(1)).unwrap();
        assert!(matches!(
            store.insert(endpoint(1)),
            Err(RoutingError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_link_is_symmetric_and_remove_severs() {
        let mut store = TopologyStore::new();
        let a = store.insert(endpoint(1)).unwrap();
        let b = store.insert(endpoint(2)).unwrap();
        store.link(PortRef::new(a, 1), PortRef::new(b, 1)).unwrap();
        assert_eq!(store.remote(PortRef::new(b, 1)), Some(PortRef::new(a, 1)));

        store.remove(a);
        assert_eq!(store.remote(PortRef::new(b, 1)), None);
    }

    #[test]
    fn test_relink_detaches_previous_partner() {
        let mut store = TopologyStore::new();
        let a = store.insert(endpoint(1)).unwrap();
        let b = store.insert(endpoint(2)).unwrap();
        let c = store.insert(endpoint(3)).unwrap();
        store.link(PortRef::new(a, 1), PortRef::new(b, 1)).unwrap();
        store.link(PortRef::new(a, 1), PortRef::new(c, 1)).unwrap();
        assert_eq!(store.remote(PortRef::new(b, 1)), None);
        assert_eq!(store.remote(PortRef::new(c, 1)), Some(PortRef::new(a, 1)));
    }

    #[test]
    fn test_lid_table_with_lmc_and_conflicts() {
        let mut store = TopologyStore::new();
        let a = store.insert(endpoint(1)).unwrap();
        let b = store.insert(endpoint(2)).unwrap();
        {
            let p = store.port_mut(PortRef::new(a, 1)).unwrap();
            p.base_lid = Lid(4);
            p.lmc = 2;
        }
        store.port_mut(PortRef::new(b, 1)).unwrap().base_lid = Lid(6);

        let conflicts = store.rebuild_lid_table();
        assert_eq!(conflicts, vec![Lid(6)]);
        assert_eq!(store.owner_of(Lid(7)), Some(PortRef::new(a, 1)));
        assert_eq!(store.max_lid(), 7);
        assert_eq!(store.owner_of(Lid(8)), None);
    }

    #[test]
    fn test_traffic_profile() {
        let mut store = TopologyStore::new();
        let a = store.insert(endpoint(1)).unwrap();
        let at = PortRef::new(a, 1);
        store.count_path(at);
        store.count_path(at);
        assert_eq!(store.port(at).unwrap().traffic, 2);
        store.reset_traffic();
        assert_eq!(store.port(at).unwrap().traffic, 0);
    }
}
