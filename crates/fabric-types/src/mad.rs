//! # Management Records and Requests
//!
//! Records consumed from the transport collaborator (discovery) and requests
//! produced for it (programming). Encoding on the wire is the transport's
//! concern; these types only describe intent.
//!
//! ## Flow
//!
//! ```text
//! Transport ──DiscoveryReport──→ Sweep engine ──MadRequest{id}──→ Transport
//!                                      ↑                              │
//!                                      └────────Completion{id}────────┘
//! ```

use crate::entities::*;
use crate::errors::TransportError;
use serde::{Deserialize, Serialize};

// =============================================================================
// DISCOVERY RECORDS
// =============================================================================

/// Forwarding capabilities reported by a switch.
///
/// A non-zero `linear_fdb_cap` selects a linear (direct-indexed) unicast
/// table; otherwise the capped random table of `random_fdb_cap` entries is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchCapability {
    /// Number of linear forwarding entries supported (0 = none).
    pub linear_fdb_cap: u16,
    /// Number of random forwarding entries supported.
    pub random_fdb_cap: u16,
    /// Number of multicast forwarding entries supported.
    pub mcast_fdb_cap: u16,
}

impl Default for SwitchCapability {
    fn default() -> Self {
        Self {
            linear_fdb_cap: 0xC000,
            random_fdb_cap: 0,
            mcast_fdb_cap: 1024,
        }
    }
}

/// The far end of a link as claimed by the local port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub node_guid: Guid,
    pub port: PortNum,
}

/// One port as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPort {
    pub num: PortNum,
    pub guid: Guid,
    pub link_state: LinkState,
    /// LID currently configured on the port (0 = unassigned).
    pub base_lid: Lid,
    pub lmc: u8,
    /// Link partner claimed by this port. Only trusted when reciprocated.
    pub remote: Option<RemoteEndpoint>,
    /// False when error counters mark the link unusable for routing.
    pub healthy: bool,
}

impl DiscoveredPort {
    pub fn new(num: PortNum, guid: Guid) -> Self {
        Self {
            num,
            guid,
            link_state: LinkState::Down,
            base_lid: Lid(0),
            lmc: 0,
            remote: None,
            healthy: true,
        }
    }
}

/// One node as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredNode {
    pub guid: Guid,
    pub system_guid: Guid,
    pub node_type: NodeType,
    pub description: String,
    /// Ports in ascending port-number order. Switches include port 0.
    pub ports: Vec<DiscoveredPort>,
    /// Present for switches.
    pub switch: Option<SwitchCapability>,
}

/// Result of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub nodes: Vec<DiscoveredNode>,
}

// =============================================================================
// PROGRAMMING REQUESTS
// =============================================================================

/// Correlates a request with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

/// Contents of one unicast forwarding-table block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableBlock {
    /// 64 consecutive LIDs starting at `block * 64`; `NO_PATH` = unprogrammed.
    Linear(Vec<PortNum>),
    /// 16 (LID, port) slots of a random table; an empty slot holds LID 0.
    Random(Vec<(Lid, PortNum)>),
}

impl TableBlock {
    /// True when the block carries no route at all.
    pub fn is_unprogrammed(&self) -> bool {
        match self {
            Self::Linear(ports) => ports.iter().all(|p| *p == NO_PATH),
            Self::Random(pairs) => pairs.iter().all(|(lid, _)| lid.raw() == 0),
        }
    }
}

/// A request for the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MadRequest {
    /// Program one unicast forwarding block.
    SetUnicastBlock {
        switch: Guid,
        block: u16,
        contents: TableBlock,
    },
    /// Program one multicast block: 32 MLIDs × one 16-port position.
    SetMulticastBlock {
        switch: Guid,
        block: u16,
        position: u8,
        masks: Vec<u16>,
    },
    /// Drive a port's logical link state.
    SetPortState {
        node: Guid,
        port: PortNum,
        state: LinkState,
    },
    /// Configure a port's base LID and LMC.
    SetPortLid {
        node: Guid,
        port: PortNum,
        lid: Lid,
        lmc: u8,
    },
    /// Program an SL-to-VL mapping table on a switch port pair.
    SetSl2Vl {
        node: Guid,
        in_port: PortNum,
        out_port: PortNum,
        map: [u8; 16],
    },
    /// Program VL arbitration weights on a port.
    SetVlArbitration {
        node: Guid,
        port: PortNum,
        entries: Vec<(u8, u8)>,
    },
}

impl MadRequest {
    /// Node the request is addressed to.
    pub fn target(&self) -> Guid {
        match self {
            Self::SetUnicastBlock { switch, .. } | Self::SetMulticastBlock { switch, .. } => {
                *switch
            }
            Self::SetPortState { node, .. }
            | Self::SetPortLid { node, .. }
            | Self::SetSl2Vl { node, .. }
            | Self::SetVlArbitration { node, .. } => *node,
        }
    }
}

/// Asynchronous outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: TransactionId,
    pub result: Result<(), TransportError>,
}

impl Completion {
    pub fn success(id: TransactionId) -> Self {
        Self { id, result: Ok(()) }
    }

    pub fn failure(id: TransactionId, error: TransportError) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}
