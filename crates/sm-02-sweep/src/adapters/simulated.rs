//! # Simulated Fabric
//!
//! In-memory fabric implementing every outbound port. Discovery reports the
//! model as it stands; programming requests are applied to it when they
//! succeed, and their completions are delivered through the engine's
//! `CompletionSink` just as a real transport would.
//!
//! ## Failure injection
//!
//! - `fail_next(kind, n)`: the next `n` requests of a kind complete with an
//!   error and leave the model untouched.
//! - `fail_discovery(n)`: the next `n` discovery walks fail.
//! - `set_loss_rate(p)`: each request is silently dropped with probability
//!   `p` (no completion at all).
//! - `hold_completions(true)`: completions queue up until `release()`.
//!
//! Port GUIDs are the node GUID plus the port number, so node GUIDs should be
//! spaced further apart than their port counts.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use fabric_types::{
    Completion, DiscoveredNode, DiscoveredPort, DiscoveryReport, Guid, Lid, LinkState, MadRequest,
    NodeType, PortNum, RemoteEndpoint, SmRole, SwitchCapability, TransactionId, TransportError,
    NO_PATH,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sm_01_routing::{ForwardingTable, MulticastTable, UnicastTable};
use tracing::trace;

use crate::ports::outbound::{CompletionSink, FabricDiscovery, MadTransport, PeerInfo, SmPeers};

/// Request categories for failure injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    UnicastBlock,
    MulticastBlock,
    PortState,
    PortLid,
    Qos,
}

impl RequestKind {
    pub fn of(request: &MadRequest) -> Self {
        match request {
            MadRequest::SetUnicastBlock { .. } => Self::UnicastBlock,
            MadRequest::SetMulticastBlock { .. } => Self::MulticastBlock,
            MadRequest::SetPortState { .. } => Self::PortState,
            MadRequest::SetPortLid { .. } => Self::PortLid,
            MadRequest::SetSl2Vl { .. } | MadRequest::SetVlArbitration { .. } => Self::Qos,
        }
    }
}

#[derive(Debug)]
struct SimNode {
    record: DiscoveredNode,
    unicast: Option<UnicastTable>,
    multicast: Option<MulticastTable>,
}

impl SimNode {
    fn port_mut(&mut self, num: PortNum) -> Option<&mut DiscoveredPort> {
        self.record.ports.iter_mut().find(|p| p.num == num)
    }
}

#[derive(Debug)]
struct SimState {
    nodes: BTreeMap<Guid, SimNode>,
    peers: Vec<PeerInfo>,
    handovers: Vec<Guid>,
    requests: Vec<MadRequest>,
    fail_next: HashMap<RequestKind, usize>,
    discovery_failures: usize,
    discoveries: usize,
    hold: bool,
    held: Vec<Completion>,
    loss_rate: f64,
    rng: StdRng,
}

impl SimState {
    fn apply(&mut self, request: &MadRequest) -> Result<(), TransportError> {
        let target = request.target();
        let node = self
            .nodes
            .get_mut(&target)
            .ok_or(TransportError::Timeout { target })?;
        let rejected = |status| TransportError::Rejected { target, status };

        match request {
            MadRequest::SetUnicastBlock {
                block, contents, ..
            } => node
                .unicast
                .as_mut()
                .ok_or(rejected(0x0004))?
                .apply_block(*block, contents)
                .map_err(|_| rejected(0x001c)),
            MadRequest::SetMulticastBlock {
                block,
                position,
                masks,
                ..
            } => {
                node.multicast
                    .as_mut()
                    .ok_or(rejected(0x0004))?
                    .apply_block(*block, *position, masks);
                Ok(())
            }
            MadRequest::SetPortState { port, state, .. } => {
                let p = node.port_mut(*port).ok_or(rejected(0x001c))?;
                p.link_state = *state;
                Ok(())
            }
            MadRequest::SetPortLid { port, lid, lmc, .. } => {
                let p = node.port_mut(*port).ok_or(rejected(0x001c))?;
                p.base_lid = *lid;
                p.lmc = *lmc;
                Ok(())
            }
            MadRequest::SetSl2Vl { .. } | MadRequest::SetVlArbitration { .. } => Ok(()),
        }
    }

    fn set_remote(
        &mut self,
        node: Guid,
        port: PortNum,
        remote: Option<RemoteEndpoint>,
        state: LinkState,
    ) {
        if let Some(p) = self.nodes.get_mut(&node).and_then(|n| n.port_mut(port)) {
            p.remote = remote;
            p.link_state = state;
        }
    }
}

pub struct SimulatedFabric {
    state: Mutex<SimState>,
    sink: CompletionSink,
}

impl SimulatedFabric {
    pub fn new(sink: CompletionSink) -> Self {
        Self {
            state: Mutex::new(SimState {
                nodes: BTreeMap::new(),
                peers: Vec::new(),
                handovers: Vec::new(),
                requests: Vec::new(),
                fail_next: HashMap::new(),
                discovery_failures: 0,
                discoveries: 0,
                hold: false,
                held: Vec::new(),
                loss_rate: 0.0,
                rng: StdRng::seed_from_u64(0x5eed),
            }),
            sink,
        }
    }

    // =========================================================================
    // MODEL
    // =========================================================================

    /// Add a switch with ports `0..=ports`; port 0 is its management port.
    pub fn add_switch(&self, guid: u64, ports: PortNum) -> &Self {
        self.add_switch_with(guid, ports, SwitchCapability::default())
    }

    pub fn add_switch_with(&self, guid: u64, ports: PortNum, cap: SwitchCapability) -> &Self {
        let guid = Guid(guid);
        let mut record = Self::record(guid, NodeType::Switch, 0..=ports);
        record.switch = Some(cap);
        if let Some(p0) = record.ports.first_mut() {
            p0.link_state = LinkState::Active;
        }
        self.state.lock().nodes.insert(
            guid,
            SimNode {
                record,
                unicast: Some(UnicastTable::for_capability(&cap)),
                multicast: Some(MulticastTable::new(ports)),
            },
        );
        self
    }

    /// Add an endpoint with ports `1..=ports`.
    pub fn add_endpoint(&self, guid: u64, ports: PortNum) -> &Self {
        let guid = Guid(guid);
        let record = Self::record(guid, NodeType::Endpoint, 1..=ports);
        self.state.lock().nodes.insert(
            guid,
            SimNode {
                record,
                unicast: None,
                multicast: None,
            },
        );
        self
    }

    fn record(
        guid: Guid,
        node_type: NodeType,
        ports: std::ops::RangeInclusive<PortNum>,
    ) -> DiscoveredNode {
        DiscoveredNode {
            guid,
            system_guid: guid,
            node_type,
            description: format!("{}-{:x}", node_type, guid.0),
            ports: ports
                .map(|num| DiscoveredPort::new(num, Guid(guid.0 + u64::from(num))))
                .collect(),
            switch: None,
        }
    }

    /// Place a node in a system; nodes default to their own system.
    pub fn set_system(&self, guid: u64, system: u64) -> &Self {
        if let Some(node) = self.state.lock().nodes.get_mut(&Guid(guid)) {
            node.record.system_guid = Guid(system);
        }
        self
    }

    /// Cable two ports together; both ends come up `Active`.
    pub fn connect(&self, a: u64, a_port: PortNum, b: u64, b_port: PortNum) -> &Self {
        self.connect_in_state(a, a_port, b, b_port, LinkState::Active)
    }

    pub fn connect_in_state(
        &self,
        a: u64,
        a_port: PortNum,
        b: u64,
        b_port: PortNum,
        state: LinkState,
    ) -> &Self {
        let mut s = self.state.lock();
        let end = |guid: u64, port| RemoteEndpoint {
            node_guid: Guid(guid),
            port,
        };
        s.set_remote(Guid(a), a_port, Some(end(b, b_port)), state);
        s.set_remote(Guid(b), b_port, Some(end(a, a_port)), state);
        drop(s);
        self
    }

    /// Make one port claim a partner that does not claim it back.
    pub fn claim_one_sided(&self, a: u64, a_port: PortNum, b: u64, b_port: PortNum) -> &Self {
        let remote = RemoteEndpoint {
            node_guid: Guid(b),
            port: b_port,
        };
        self.state
            .lock()
            .set_remote(Guid(a), a_port, Some(remote), LinkState::Active);
        self
    }

    /// Unplug the cable at one port; both ends go `Down`.
    pub fn disconnect(&self, node: u64, port: PortNum) -> &Self {
        let mut s = self.state.lock();
        let partner = s
            .nodes
            .get_mut(&Guid(node))
            .and_then(|n| n.port_mut(port))
            .and_then(|p| p.remote);
        s.set_remote(Guid(node), port, None, LinkState::Down);
        if let Some(r) = partner {
            s.set_remote(r.node_guid, r.port, None, LinkState::Down);
        }
        drop(s);
        self
    }

    /// Remove a node; ports cabled to it go `Down`.
    pub fn remove_node(&self, guid: u64) -> &Self {
        let guid = Guid(guid);
        let mut s = self.state.lock();
        s.nodes.remove(&guid);
        for node in s.nodes.values_mut() {
            for port in &mut node.record.ports {
                if port.remote.is_some_and(|r| r.node_guid == guid) {
                    port.remote = None;
                    port.link_state = LinkState::Down;
                }
            }
        }
        drop(s);
        self
    }

    pub fn set_healthy(&self, node: u64, port: PortNum, healthy: bool) -> &Self {
        if let Some(p) = self
            .state
            .lock()
            .nodes
            .get_mut(&Guid(node))
            .and_then(|n| n.port_mut(port))
        {
            p.healthy = healthy;
        }
        self
    }

    /// Reboot one port: a cabled port comes back in `Init` with no LID.
    pub fn reset_port(&self, node: u64, port: PortNum) -> &Self {
        if let Some(p) = self
            .state
            .lock()
            .nodes
            .get_mut(&Guid(node))
            .and_then(|n| n.port_mut(port))
        {
            if p.remote.is_some() {
                p.link_state = LinkState::Init;
            }
            p.base_lid = Lid(0);
            p.lmc = 0;
        }
        self
    }

    // =========================================================================
    // PEERS
    // =========================================================================

    pub fn add_peer(&self, peer: PeerInfo) -> &Self {
        let mut s = self.state.lock();
        s.peers.retain(|p| p.candidate.guid != peer.candidate.guid);
        s.peers.push(peer);
        drop(s);
        self
    }

    pub fn remove_peer(&self, guid: u64) -> &Self {
        self.state
            .lock()
            .peers
            .retain(|p| p.candidate.guid != Guid(guid));
        self
    }

    /// Peers that were handed mastership, in order.
    pub fn handovers(&self) -> Vec<Guid> {
        self.state.lock().handovers.clone()
    }

    // =========================================================================
    // FAILURE INJECTION
    // =========================================================================

    pub fn fail_next(&self, kind: RequestKind, count: usize) -> &Self {
        *self.state.lock().fail_next.entry(kind).or_insert(0) += count;
        self
    }

    pub fn fail_discovery(&self, count: usize) -> &Self {
        self.state.lock().discovery_failures += count;
        self
    }

    /// Probability in `[0, 1]` that a request is lost without completion.
    pub fn set_loss_rate(&self, rate: f64) -> &Self {
        self.state.lock().loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn hold_completions(&self, hold: bool) -> &Self {
        self.state.lock().hold = hold;
        self
    }

    /// Deliver every held completion; returns how many.
    pub fn release(&self) -> usize {
        let held = std::mem::take(&mut self.state.lock().held);
        let count = held.len();
        for completion in held {
            self.sink.complete(completion);
        }
        count
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// Every request submitted so far, in order.
    pub fn requests(&self) -> Vec<MadRequest> {
        self.state.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    pub fn discoveries(&self) -> usize {
        self.state.lock().discoveries
    }

    pub fn port(&self, node: u64, port: PortNum) -> Option<DiscoveredPort> {
        self.state
            .lock()
            .nodes
            .get(&Guid(node))
            .and_then(|n| n.record.ports.iter().find(|p| p.num == port).cloned())
    }

    /// Output port programmed on `switch` for `lid`.
    pub fn programmed_port(&self, switch: u64, lid: Lid) -> Option<PortNum> {
        let s = self.state.lock();
        let table = s.nodes.get(&Guid(switch))?.unicast.as_ref()?;
        Some(table.get(lid))
    }

    pub fn programmed_multicast(&self, switch: u64, mlid: Lid) -> BTreeSet<PortNum> {
        let s = self.state.lock();
        s.nodes
            .get(&Guid(switch))
            .and_then(|n| n.multicast.as_ref())
            .map(|t| t.ports(mlid))
            .unwrap_or_default()
    }

    /// Follow programmed tables from `switch` toward `lid`.
    ///
    /// Returns the switches visited, ending at the one that delivers `lid`
    /// (through port 0 or to an attached endpoint). `None` when a table has
    /// no entry, a cable is missing, or the walk revisits a switch.
    pub fn trace_route(&self, switch: u64, lid: Lid) -> Option<Vec<Guid>> {
        let s = self.state.lock();
        let mut at = Guid(switch);
        let mut path = vec![at];
        loop {
            let node = s.nodes.get(&at)?;
            let port = node.unicast.as_ref()?.get(lid);
            if port == 0 {
                return Some(path);
            }
            if port == NO_PATH {
                return None;
            }
            let remote = node.record.ports.iter().find(|p| p.num == port)?.remote?;
            let next = s.nodes.get(&remote.node_guid)?;
            if next.record.switch.is_none() {
                let p = next.record.ports.iter().find(|p| p.num == remote.port)?;
                return p.base_lid.range(p.lmc).contains(&lid.0).then_some(path);
            }
            if path.contains(&remote.node_guid) {
                return None;
            }
            at = remote.node_guid;
            path.push(at);
        }
    }
}

#[async_trait]
impl FabricDiscovery for SimulatedFabric {
    async fn discover(&self) -> Result<DiscoveryReport, TransportError> {
        let mut s = self.state.lock();
        s.discoveries += 1;
        if s.discovery_failures > 0 {
            s.discovery_failures -= 1;
            return Err(TransportError::DiscoveryFailed("injected failure".into()));
        }
        Ok(DiscoveryReport {
            nodes: s.nodes.values().map(|n| n.record.clone()).collect(),
        })
    }
}

impl MadTransport for SimulatedFabric {
    fn submit(&self, id: TransactionId, request: MadRequest) -> Result<(), TransportError> {
        let mut s = self.state.lock();
        s.requests.push(request.clone());

        if s.loss_rate > 0.0 {
            let rate = s.loss_rate;
            if s.rng.gen_bool(rate) {
                trace!(id = id.0, "request lost");
                return Ok(());
            }
        }

        let kind = RequestKind::of(&request);
        let injected = match s.fail_next.get_mut(&kind) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        };

        let completion = if injected {
            Completion::failure(
                id,
                TransportError::Timeout {
                    target: request.target(),
                },
            )
        } else {
            match s.apply(&request) {
                Ok(()) => Completion::success(id),
                Err(e) => Completion::failure(id, e),
            }
        };

        if s.hold {
            s.held.push(completion);
            return Ok(());
        }
        drop(s);

        if self.sink.complete(completion) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl SmPeers for SimulatedFabric {
    async fn discover_peers(&self) -> Result<Vec<PeerInfo>, TransportError> {
        Ok(self.state.lock().peers.clone())
    }

    async fn poll_master(&self, master: Guid) -> Result<bool, TransportError> {
        Ok(self
            .state
            .lock()
            .peers
            .iter()
            .any(|p| p.candidate.guid == master && p.role == SmRole::Master))
    }

    async fn send_handover(&self, to: Guid) -> Result<(), TransportError> {
        let mut s = self.state.lock();
        let peer = s
            .peers
            .iter_mut()
            .find(|p| p.candidate.guid == to)
            .ok_or(TransportError::Timeout { target: to })?;
        peer.role = SmRole::Master;
        s.handovers.push(to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::outbound::completion_channel;

    #[tokio::test]
    async fn test_discovery_reflects_cabling() {
        let (sink, _rx) = completion_channel();
        let sim = SimulatedFabric::new(sink);
        sim.add_switch(0x100, 4)
            .add_endpoint(0x1000, 1)
            .connect(0x1000, 1, 0x100, 3);

        let report = sim.discover().await.unwrap();
        assert_eq!(report.nodes.len(), 2);
        let sw = report.nodes.iter().find(|n| n.guid == Guid(0x100)).unwrap();
        assert_eq!(sw.ports.len(), 5);
        assert_eq!(sw.ports[3].remote.unwrap().node_guid, Guid(0x1000));
        assert_eq!(sw.ports[3].guid, Guid(0x103));

        sim.remove_node(0x1000);
        let report = sim.discover().await.unwrap();
        assert_eq!(report.nodes.len(), 1);
        assert!(report.nodes[0].ports[3].remote.is_none());
        assert_eq!(report.nodes[0].ports[3].link_state, LinkState::Down);
    }

    #[tokio::test]
    async fn test_requests_apply_and_complete() {
        let (sink, mut rx) = completion_channel();
        let sim = SimulatedFabric::new(sink);
        sim.add_endpoint(0x1000, 1);

        let request = MadRequest::SetPortLid {
            node: Guid(0x1000),
            port: 1,
            lid: Lid(7),
            lmc: 0,
        };
        sim.submit(TransactionId(1), request.clone()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Completion::success(TransactionId(1)));
        assert_eq!(sim.port(0x1000, 1).unwrap().base_lid, Lid(7));

        sim.fail_next(RequestKind::PortLid, 1);
        sim.submit(TransactionId(2), request).unwrap();
        assert!(rx.recv().await.unwrap().result.is_err());
    }

    #[tokio::test]
    async fn test_held_completions_wait_for_release() {
        let (sink, mut rx) = completion_channel();
        let sim = SimulatedFabric::new(sink);
        sim.add_endpoint(0x1000, 1).hold_completions(true);

        let request = MadRequest::SetPortState {
            node: Guid(0x1000),
            port: 1,
            state: LinkState::Active,
        };
        sim.submit(TransactionId(1), request).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(sim.release(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_handover_promotes_peer() {
        let (sink, _rx) = completion_channel();
        let sim = SimulatedFabric::new(sink);
        sim.add_peer(PeerInfo::new(Guid(3), 5, SmRole::Standby));

        assert!(!sim.poll_master(Guid(3)).await.unwrap());
        sim.send_handover(Guid(3)).await.unwrap();
        assert!(sim.poll_master(Guid(3)).await.unwrap());
        assert_eq!(sim.handovers(), vec![Guid(3)]);
        assert!(sim.send_handover(Guid(9)).await.is_err());
    }
}
