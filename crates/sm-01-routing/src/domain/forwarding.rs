//! # Unicast Forwarding Tables
//!
//! Two representations behind one capability:
//!
//! - **Linear**: direct-indexed by LID, programmed in blocks of 64 entries.
//! - **Random**: capped slot table of (LID, port) pairs, programmed in blocks
//!   of 16 slots. A LID keeps its slot until it is cleared.
//!
//! The representation is chosen once per switch from its discovered
//! capability (`UnicastTable::for_capability`). Everything downstream works
//! through `ForwardingTable`.

use std::collections::BTreeMap;

use fabric_types::{Lid, PortNum, SwitchCapability, TableBlock, NO_PATH};

use super::errors::{RoutingError, RoutingResult};

/// LIDs per linear block.
pub const LINEAR_BLOCK_SIZE: usize = 64;

/// Slots per random block.
pub const RANDOM_BLOCK_SIZE: usize = 16;

/// Get/set/iterate-in-blocks over a unicast table.
pub trait ForwardingTable {
    /// Output port for `lid`, `NO_PATH` when unprogrammed.
    fn get(&self, lid: Lid) -> PortNum;

    /// Route `lid` out of `port`. `NO_PATH` removes the entry.
    fn set(&mut self, lid: Lid, port: PortNum) -> RoutingResult<()>;

    fn clear(&mut self);

    /// Number of blocks currently spanned.
    fn block_count(&self) -> u16;

    /// Contents of block `index`, padded to full size.
    fn block(&self, index: u16) -> TableBlock;

    /// Overwrite block `index` with programmed contents.
    fn apply_block(&mut self, index: u16, block: &TableBlock) -> RoutingResult<()>;

    /// LIDs with a programmed port, ascending.
    fn routed_lids(&self) -> Vec<Lid>;

    fn blocks(&self) -> Box<dyn Iterator<Item = (u16, TableBlock)> + '_> {
        Box::new((0..self.block_count()).map(move |i| (i, self.block(i))))
    }
}

fn check_unicast(lid: Lid) -> RoutingResult<()> {
    if lid.is_unicast() {
        Ok(())
    } else {
        Err(RoutingError::InvalidParameter(format!(
            "{} is not a unicast lid",
            lid
        )))
    }
}

// =============================================================================
// LINEAR
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearForwardingTable {
    capacity: usize,
    entries: Vec<PortNum>,
}

impl LinearForwardingTable {
    pub fn new(capacity: u16) -> Self {
        Self {
            capacity: capacity as usize,
            entries: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl ForwardingTable for LinearForwardingTable {
    fn get(&self, lid: Lid) -> PortNum {
        self.entries
            .get(lid.raw() as usize)
            .copied()
            .unwrap_or(NO_PATH)
    }

    fn set(&mut self, lid: Lid, port: PortNum) -> RoutingResult<()> {
        check_unicast(lid)?;
        let idx = lid.raw() as usize;
        if idx >= self.capacity {
            if port == NO_PATH {
                return Ok(());
            }
            return Err(RoutingError::TableFull {
                capacity: self.capacity,
            });
        }
        if idx >= self.entries.len() {
            if port == NO_PATH {
                return Ok(());
            }
            let len = (idx / LINEAR_BLOCK_SIZE + 1) * LINEAR_BLOCK_SIZE;
            self.entries
                .try_reserve(len - self.entries.len())
                .map_err(|_| RoutingError::InsufficientResources {
                    what: "linear forwarding table",
                    requested: len,
                })?;
            self.entries.resize(len, NO_PATH);
        }
        self.entries[idx] = port;
        Ok(())
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn block_count(&self) -> u16 {
        self.entries.len().div_ceil(LINEAR_BLOCK_SIZE) as u16
    }

    fn block(&self, index: u16) -> TableBlock {
        let start = index as usize * LINEAR_BLOCK_SIZE;
        let mut ports = vec![NO_PATH; LINEAR_BLOCK_SIZE];
        for (i, slot) in ports.iter_mut().enumerate() {
            if let Some(p) = self.entries.get(start + i) {
                *slot = *p;
            }
        }
        TableBlock::Linear(ports)
    }

    fn apply_block(&mut self, index: u16, block: &TableBlock) -> RoutingResult<()> {
        let TableBlock::Linear(ports) = block else {
            return Err(RoutingError::InvalidParameter(
                "random block applied to linear table".into(),
            ));
        };
        let start = index as usize * LINEAR_BLOCK_SIZE;
        for (i, port) in ports.iter().take(LINEAR_BLOCK_SIZE).enumerate() {
            let raw = start + i;
            if raw == 0 {
                continue;
            }
            self.set(Lid(raw as u16), *port)?;
        }
        Ok(())
    }

    fn routed_lids(&self) -> Vec<Lid> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, p)| **p != NO_PATH)
            .map(|(i, _)| Lid(i as u16))
            .collect()
    }
}

// =============================================================================
// RANDOM
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomForwardingTable {
    capacity: usize,
    slots: Vec<Option<(Lid, PortNum)>>,
    index: BTreeMap<Lid, usize>,
}

impl RandomForwardingTable {
    pub fn new(capacity: u16) -> Self {
        Self {
            capacity: capacity as usize,
            slots: Vec::new(),
            index: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn free_slot(&mut self) -> RoutingResult<usize> {
        if let Some(i) = self.slots.iter().position(Option::is_none) {
            return Ok(i);
        }
        if self.slots.len() >= self.capacity {
            return Err(RoutingError::TableFull {
                capacity: self.capacity,
            });
        }
        self.slots.push(None);
        Ok(self.slots.len() - 1)
    }

    fn trim(&mut self) {
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
    }
}

impl ForwardingTable for RandomForwardingTable {
    fn get(&self, lid: Lid) -> PortNum {
        self.index
            .get(&lid)
            .and_then(|i| self.slots[*i])
            .map(|(_, port)| port)
            .unwrap_or(NO_PATH)
    }

    fn set(&mut self, lid: Lid, port: PortNum) -> RoutingResult<()> {
        check_unicast(lid)?;
        if port == NO_PATH {
            if let Some(i) = self.index.remove(&lid) {
                self.slots[i] = None;
                self.trim();
            }
            return Ok(());
        }
        let slot = match self.index.get(&lid) {
            Some(i) => *i,
            None => {
                let i = self.free_slot()?;
                self.index.insert(lid, i);
                i
            }
        };
        self.slots[slot] = Some((lid, port));
        Ok(())
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }

    fn block_count(&self) -> u16 {
        self.slots.len().div_ceil(RANDOM_BLOCK_SIZE) as u16
    }

    fn block(&self, index: u16) -> TableBlock {
        let start = index as usize * RANDOM_BLOCK_SIZE;
        let pairs = (start..start + RANDOM_BLOCK_SIZE)
            .map(|i| {
                self.slots
                    .get(i)
                    .copied()
                    .flatten()
                    .unwrap_or((Lid(0), NO_PATH))
            })
            .collect();
        TableBlock::Random(pairs)
    }

    fn apply_block(&mut self, index: u16, block: &TableBlock) -> RoutingResult<()> {
        let TableBlock::Random(pairs) = block else {
            return Err(RoutingError::InvalidParameter(
                "linear block applied to random table".into(),
            ));
        };
        let start = index as usize * RANDOM_BLOCK_SIZE;
        let end = start + pairs.len().min(RANDOM_BLOCK_SIZE);
        if end > self.capacity {
            return Err(RoutingError::TableFull {
                capacity: self.capacity,
            });
        }
        if self.slots.len() < end {
            self.slots.resize(end, None);
        }

        for (offset, (lid, port)) in pairs.iter().take(RANDOM_BLOCK_SIZE).enumerate() {
            let slot = start + offset;
            if let Some((old, _)) = self.slots[slot].take() {
                self.index.remove(&old);
            }
            if lid.is_unicast() && *port != NO_PATH {
                if let Some(prev) = self.index.insert(*lid, slot) {
                    self.slots[prev] = None;
                }
                self.slots[slot] = Some((*lid, *port));
            }
        }
        self.trim();
        Ok(())
    }

    fn routed_lids(&self) -> Vec<Lid> {
        self.index.keys().copied().collect()
    }
}

// =============================================================================
// SELECTION
// =============================================================================

/// Unicast table of a switch, fixed at switch initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnicastTable {
    Linear(LinearForwardingTable),
    Random(RandomForwardingTable),
}

impl UnicastTable {
    /// Linear when the switch supports it, random otherwise.
    pub fn for_capability(cap: &SwitchCapability) -> Self {
        if cap.linear_fdb_cap > 0 {
            Self::Linear(LinearForwardingTable::new(cap.linear_fdb_cap))
        } else {
            Self::Random(RandomForwardingTable::new(cap.random_fdb_cap))
        }
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Linear(_))
    }

    fn inner(&self) -> &dyn ForwardingTable {
        match self {
            Self::Linear(t) => t,
            Self::Random(t) => t,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ForwardingTable {
        match self {
            Self::Linear(t) => t,
            Self::Random(t) => t,
        }
    }
}

impl ForwardingTable for UnicastTable {
    fn get(&self, lid: Lid) -> PortNum {
        self.inner().get(lid)
    }

    fn set(&mut self, lid: Lid, port: PortNum) -> RoutingResult<()> {
        self.inner_mut().set(lid, port)
    }

    fn clear(&mut self) {
        self.inner_mut().clear()
    }

    fn block_count(&self) -> u16 {
        self.inner().block_count()
    }

    fn block(&self, index: u16) -> TableBlock {
        self.inner().block(index)
    }

    fn apply_block(&mut self, index: u16, block: &TableBlock) -> RoutingResult<()> {
        self.inner_mut().apply_block(index, block)
    }

    fn routed_lids(&self) -> Vec<Lid> {
        self.inner().routed_lids()
    }
}
