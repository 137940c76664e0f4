//! # Published Routing Snapshot
//!
//! Readers never touch `FabricState`. At phase boundaries the sweep engine
//! captures an immutable `RoutingSnapshot` and swaps it into a `FabricView`;
//! queries then run against whichever snapshot was current when they started.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

use fabric_types::{Guid, Lid, PortNum, NO_PATH};
use parking_lot::RwLock;

use crate::domain::{
    FabricState, ForwardingTable, HopMatrix, MulticastGroup, MulticastTable, UnicastTable,
    HOP_NO_PATH,
};

/// Routing state of one switch as last published.
#[derive(Debug, Clone)]
pub struct SwitchSnapshot {
    pub guid: Guid,
    pub description: String,
    pub hops: HopMatrix,
    pub unicast: UnicastTable,
    pub multicast: MulticastTable,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    pub generation: u64,
    switches: BTreeMap<Guid, SwitchSnapshot>,
    groups: BTreeMap<Lid, MulticastGroup>,
}

impl RoutingSnapshot {
    /// Copy the readable parts of `fabric`.
    pub fn capture(fabric: &FabricState) -> Self {
        let switches = fabric
            .topology
            .iter()
            .filter_map(|(_, node)| {
                let sw = node.switch.as_ref()?;
                Some((
                    node.guid,
                    SwitchSnapshot {
                        guid: node.guid,
                        description: node.description.clone(),
                        hops: sw.hops().clone(),
                        unicast: sw.live().clone(),
                        multicast: sw.live_mcast().clone(),
                    },
                ))
            })
            .collect();

        Self {
            generation: fabric.generation,
            switches,
            groups: fabric.groups.clone(),
        }
    }

    pub fn switch_count(&self) -> usize {
        self.switches.len()
    }

    pub fn switch(&self, guid: Guid) -> Option<&SwitchSnapshot> {
        self.switches.get(&guid)
    }

    /// Minimum hops from `switch` to `lid`; `None` for an unknown switch.
    pub fn hop_count(&self, switch: Guid, lid: Lid) -> Option<u8> {
        self.switches.get(&switch).map(|s| s.hops.least_hops(lid))
    }

    /// Programmed output port for `lid`; `None` for an unknown switch.
    pub fn forwarding_entry(&self, switch: Guid, lid: Lid) -> Option<PortNum> {
        self.switches.get(&switch).map(|s| s.unicast.get(lid))
    }

    /// Programmed multicast ports for `mlid` on `switch`.
    pub fn multicast_ports(&self, switch: Guid, mlid: Lid) -> BTreeSet<PortNum> {
        self.switches
            .get(&switch)
            .map(|s| s.multicast.ports(mlid))
            .unwrap_or_default()
    }

    /// Membership and tree of a group.
    pub fn multicast_group(&self, mlid: Lid) -> Option<&MulticastGroup> {
        self.groups.get(&mlid)
    }

    /// Text dump of every programmed unicast and multicast entry.
    ///
    /// ```text
    /// switch 0x0000000000000010 "leaf-0"
    ///   lid 0x0001 port 0 hops 0
    ///   lid 0x0002 port 3 hops 1
    ///   mlid 0xc000 ports 1,3
    /// ```
    pub fn dump_forwarding_tables(&self) -> String {
        let mut out = String::new();
        for sw in self.switches.values() {
            let _ = writeln!(out, "switch {} \"{}\"", sw.guid, sw.description);
            for lid in sw.unicast.routed_lids() {
                let port = sw.unicast.get(lid);
                if port == NO_PATH {
                    continue;
                }
                let hops = sw.hops.least_hops(lid);
                if hops == HOP_NO_PATH {
                    let _ = writeln!(out, "  lid {} port {} hops -", lid, port);
                } else {
                    let _ = writeln!(out, "  lid {} port {} hops {}", lid, port, hops);
                }
            }
            for mlid in sw.multicast.mlids() {
                let ports: Vec<String> = sw
                    .multicast
                    .ports(mlid)
                    .into_iter()
                    .map(|p| p.to_string())
                    .collect();
                let _ = writeln!(out, "  mlid {} ports {}", mlid, ports.join(","));
            }
        }
        out
    }
}

/// Shared, swap-on-publish handle to the current snapshot.
#[derive(Debug, Default)]
pub struct FabricView {
    current: RwLock<Arc<RoutingSnapshot>>,
}

impl FabricView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current snapshot.
    pub fn publish(&self, snapshot: RoutingSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    /// The snapshot current at the time of the call.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        Arc::clone(&self.current.read())
    }
}
