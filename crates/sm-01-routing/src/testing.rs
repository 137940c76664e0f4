//! Topology builders for tests.

use fabric_types::{Guid, LinkState, Lid, NodeType, PortNum, SwitchCapability};

use crate::domain::{FabricState, Node, NodeHandle, PortRef, Switch, TopologyStore};

/// Incremental fabric builder. Links are created `Active`.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    store: TopologyStore,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn switch(&mut self, guid: u64, num_ports: PortNum) -> NodeHandle {
        self.switch_with(guid, num_ports, SwitchCapability::default())
    }

    pub fn switch_in_system(&mut self, guid: u64, system: u64, num_ports: PortNum) -> NodeHandle {
        let h = self.switch(guid, num_ports);
        if let Some(node) = self.store.node_mut(h) {
            node.system_guid = Guid(system);
        }
        h
    }

    pub fn switch_with(
        &mut self,
        guid: u64,
        num_ports: PortNum,
        capability: SwitchCapability,
    ) -> NodeHandle {
        let mut node = Node::new(Guid(guid), Guid(guid), NodeType::Switch, num_ports);
        node.description = format!("switch-{:x}", guid);
        node.switch = Some(Switch::new(capability, num_ports));
        node.ports[0].link_state = LinkState::Active;
        self.insert(node)
    }

    pub fn endpoint(&mut self, guid: u64, num_ports: PortNum) -> NodeHandle {
        let mut node = Node::new(Guid(guid), Guid(guid), NodeType::Endpoint, num_ports);
        node.description = format!("endpoint-{:x}", guid);
        self.insert(node)
    }

    fn insert(&mut self, node: Node) -> NodeHandle {
        match self.store.insert(node) {
            Ok(h) => h,
            Err(e) => panic!("builder: {}", e),
        }
    }

    pub fn link(&mut self, a: NodeHandle, pa: PortNum, b: NodeHandle, pb: PortNum) -> &mut Self {
        let (ra, rb) = (PortRef::new(a, pa), PortRef::new(b, pb));
        if let Err(e) = self.store.link(ra, rb) {
            panic!("builder: {}", e);
        }
        for at in [ra, rb] {
            if let Some(port) = self.store.port_mut(at) {
                port.link_state = LinkState::Active;
            }
        }
        self
    }

    /// Set a port's base LID and LMC.
    pub fn lid(&mut self, node: NodeHandle, port: PortNum, base: u16, lmc: u8) -> &mut Self {
        if let Some(p) = self.store.port_mut(PortRef::new(node, port)) {
            p.base_lid = Lid(base);
            p.lmc = lmc;
        }
        self
    }

    /// Number every addressable port in handle order. Switches get a single
    /// LID; endpoint ports get `2^lmc` aligned LIDs.
    pub fn auto_lids(&mut self, lmc: u8) -> &mut Self {
        let mut next: u16 = 1;
        let targets: Vec<(PortRef, u8)> = self
            .store
            .iter()
            .flat_map(|(h, n)| {
                let port_lmc = if n.is_switch() { 0 } else { lmc };
                n.addressable_ports()
                    .map(move |p| (PortRef::new(h, p.num), port_lmc))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (at, port_lmc) in targets {
            let span = 1u16 << port_lmc;
            let base = next.div_ceil(span) * span;
            self.lid(at.node, at.port, base, port_lmc);
            next = base + span;
        }
        self
    }

    pub fn build(self) -> FabricState {
        let mut store = self.store;
        store.rebuild_lid_table();
        FabricState {
            topology: store,
            ..FabricState::default()
        }
    }

    /// Base LID of a node's first addressable port.
    pub fn lid_of(fabric: &FabricState, node: NodeHandle) -> Lid {
        fabric
            .topology
            .node(node)
            .and_then(|n| n.addressable_ports().next().map(|p| p.base_lid))
            .unwrap_or_default()
    }

    /// Ring of `switches` switches with `endpoints` endpoints each.
    ///
    /// Switch `i` has GUID `0x100 + i`, port 1 to the next switch, port 2 to
    /// the previous one and ports `3..` to its endpoints, whose GUIDs are
    /// `0x1000 + i * endpoints + j`.
    pub fn ring(switches: u64, endpoints: u64) -> FabricState {
        let mut b = Self::new();
        let ports = (2 + endpoints) as PortNum;
        let sw: Vec<NodeHandle> = (0..switches).map(|i| b.switch(0x100 + i, ports)).collect();

        for i in 0..switches as usize {
            let next = (i + 1) % sw.len();
            if switches > 2 || (switches == 2 && i == 0) {
                b.link(sw[i], 1, sw[next], 2);
            }
            for j in 0..endpoints {
                let ep = b.endpoint(0x1000 + i as u64 * endpoints + j, 1);
                b.link(ep, 1, sw[i], 3 + j as PortNum);
            }
        }
        b.auto_lids(0);
        b.build()
    }
}
