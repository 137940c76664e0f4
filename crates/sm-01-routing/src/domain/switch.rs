//! # Switch Routing State
//!
//! Per-switch hop matrix plus staged and live forwarding state.
//!
//! ```text
//! rebuild ──→ staged ──diff vs programmed──→ changed blocks ──→ transport
//!                                                                   │
//! live  ←──────────── commit_*_block (on successful completion) ────┘
//! ```
//!
//! `programmed` is the baseline the diff runs against: the last contents
//! each block was successfully written with. A block with no baseline counts
//! as changed unless it is entirely unprogrammed.

use std::collections::{BTreeMap, BTreeSet};

use fabric_types::{PortNum, SwitchCapability, TableBlock};

use super::errors::RoutingResult;
use super::forwarding::{ForwardingTable, UnicastTable};
use super::hop_matrix::HopMatrix;
use super::multicast::{MulticastTable, MCAST_BLOCK_MLIDS};

#[derive(Debug, Clone)]
pub struct Switch {
    capability: SwitchCapability,
    num_ports: PortNum,
    hops: HopMatrix,
    staged: UnicastTable,
    live: UnicastTable,
    programmed: BTreeMap<u16, TableBlock>,
    staged_mcast: MulticastTable,
    live_mcast: MulticastTable,
    programmed_mcast: BTreeMap<(u16, u8), Vec<u16>>,
}

impl Switch {
    pub fn new(capability: SwitchCapability, num_ports: PortNum) -> Self {
        let table = UnicastTable::for_capability(&capability);
        Self {
            capability,
            num_ports,
            hops: HopMatrix::new(num_ports),
            staged: table.clone(),
            live: table,
            programmed: BTreeMap::new(),
            staged_mcast: MulticastTable::new(num_ports),
            live_mcast: MulticastTable::new(num_ports),
            programmed_mcast: BTreeMap::new(),
        }
    }

    pub fn capability(&self) -> &SwitchCapability {
        &self.capability
    }

    pub fn num_ports(&self) -> PortNum {
        self.num_ports
    }

    pub fn hops(&self) -> &HopMatrix {
        &self.hops
    }

    pub fn hops_mut(&mut self) -> &mut HopMatrix {
        &mut self.hops
    }

    /// Resize the hop matrix for `max_lid` and reset it.
    pub fn prepare_rebuild(&mut self, max_lid: u16) -> RoutingResult<()> {
        self.hops.prepare_rebuild(max_lid)
    }

    // -------------------------------------------------------------------------
    // Unicast
    // -------------------------------------------------------------------------

    /// Start a new staging pass from the live table.
    pub fn begin_unicast_staging(&mut self) {
        self.staged = self.live.clone();
    }

    pub fn staged(&self) -> &UnicastTable {
        &self.staged
    }

    pub fn staged_mut(&mut self) -> &mut UnicastTable {
        &mut self.staged
    }

    /// Last successfully programmed table.
    pub fn live(&self) -> &UnicastTable {
        &self.live
    }

    /// Staged blocks that differ from what was last programmed.
    pub fn changed_unicast_blocks(&self) -> Vec<(u16, TableBlock)> {
        self.staged
            .blocks()
            .filter(|(index, block)| match self.programmed.get(index) {
                Some(baseline) => baseline != block,
                None => !block.is_unprogrammed(),
            })
            .collect()
    }

    /// Record a successful download of one unicast block.
    pub fn commit_unicast_block(&mut self, index: u16, block: &TableBlock) -> RoutingResult<()> {
        self.live.apply_block(index, block)?;
        self.programmed.insert(index, block.clone());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Multicast
    // -------------------------------------------------------------------------

    pub fn begin_multicast_staging(&mut self) {
        self.staged_mcast.clear();
    }

    pub fn staged_mcast(&self) -> &MulticastTable {
        &self.staged_mcast
    }

    pub fn staged_mcast_mut(&mut self) -> &mut MulticastTable {
        &mut self.staged_mcast
    }

    pub fn live_mcast(&self) -> &MulticastTable {
        &self.live_mcast
    }

    /// Staged multicast block positions that differ from the baseline,
    /// including positions whose groups disappeared.
    pub fn changed_multicast_blocks(&self) -> Vec<(u16, u8, Vec<u16>)> {
        let mut keys: BTreeSet<(u16, u8)> = self.staged_mcast.block_keys();
        keys.extend(self.programmed_mcast.keys().copied());

        let zero = vec![0u16; MCAST_BLOCK_MLIDS];
        keys.into_iter()
            .filter_map(|(block, position)| {
                let staged = self.staged_mcast.block(block, position);
                let baseline = self
                    .programmed_mcast
                    .get(&(block, position))
                    .unwrap_or(&zero);
                (staged != *baseline).then_some((block, position, staged))
            })
            .collect()
    }

    /// Record a successful download of one multicast block position.
    pub fn commit_multicast_block(&mut self, block: u16, position: u8, masks: &[u16]) {
        self.live_mcast.apply_block(block, position, masks);
        if masks.iter().all(|m| *m == 0) {
            self.programmed_mcast.remove(&(block, position));
        } else {
            self.programmed_mcast.insert((block, position), masks.to_vec());
        }
    }
}
