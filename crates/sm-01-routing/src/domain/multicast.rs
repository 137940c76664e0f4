//! # Multicast Groups and Tables
//!
//! A group is identified by its MLID and carries a membership set plus, once
//! routed, a spanning tree over switches. Per-switch multicast tables hold a
//! port mask per MLID and are programmed in blocks:
//!
//! ```text
//!                 position 0        position 1
//!                 ports 0..15       ports 16..31
//! block 0  mlid 0xC000..0xC01F   [32 × u16]        [32 × u16]
//! block 1  mlid 0xC020..0xC03F   [32 × u16]        [32 × u16]
//! ```

use std::collections::{BTreeMap, BTreeSet};

use bitvec::prelude::*;
use fabric_types::{Guid, JoinState, Lid, PortNum, MULTICAST_LID_BASE};

use super::errors::{RoutingError, RoutingResult};

/// MLIDs per multicast block.
pub const MCAST_BLOCK_MLIDS: usize = 32;

/// Ports per mask position.
pub const MCAST_POSITION_PORTS: usize = 16;

// =============================================================================
// GROUPS
// =============================================================================

/// Member key: node GUID and port number.
pub type MemberKey = (Guid, PortNum);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TreeNode {
    /// Port toward the root, `None` at the root.
    pub upstream: Option<PortNum>,
    /// Ports the switch forwards the group to, upstream included.
    pub ports: BTreeSet<PortNum>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MulticastTree {
    pub root: Option<Guid>,
    pub switches: BTreeMap<Guid, TreeNode>,
}

impl MulticastTree {
    pub fn is_empty(&self) -> bool {
        self.switches.is_empty()
    }

    /// Undirected switch-to-switch edges implied by the upstream pointers.
    pub fn edge_count(&self) -> usize {
        self.switches
            .values()
            .filter(|n| n.upstream.is_some())
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastGroup {
    pub mlid: Lid,
    pub mgid: [u8; 16],
    pub members: BTreeMap<MemberKey, JoinState>,
    /// Tree whose masks every switch has been programmed with.
    pub tree: MulticastTree,
    /// Latest computed tree while its blocks are still downloading.
    pub staged_tree: Option<MulticastTree>,
}

impl MulticastGroup {
    pub fn new(mlid: Lid, mgid: [u8; 16]) -> RoutingResult<Self> {
        if !mlid.is_multicast() {
            return Err(RoutingError::InvalidParameter(format!(
                "{} is not a multicast lid",
                mlid
            )));
        }
        Ok(Self {
            mlid,
            mgid,
            members: BTreeMap::new(),
            tree: MulticastTree::default(),
            staged_tree: None,
        })
    }

    /// Add or update a member. Returns true when membership changed.
    pub fn join(&mut self, node: Guid, port: PortNum, state: JoinState) -> bool {
        self.members.insert((node, port), state) != Some(state)
    }

    /// Remove a member. Returns true when it was present.
    pub fn leave(&mut self, node: Guid, port: PortNum) -> bool {
        self.members.remove(&(node, port)).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// =============================================================================
// TABLES
// =============================================================================

/// Per-switch multicast forwarding state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastTable {
    width: usize,
    masks: BTreeMap<usize, BitVec<u16, Lsb0>>,
}

fn mlid_index(mlid: Lid) -> RoutingResult<usize> {
    mlid.multicast_index().ok_or_else(|| {
        RoutingError::InvalidParameter(format!("{} is not a multicast lid", mlid))
    })
}

impl MulticastTable {
    /// Table for a switch with ports `0..=num_ports`.
    pub fn new(num_ports: PortNum) -> Self {
        Self {
            width: num_ports as usize + 1,
            masks: BTreeMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.masks.clear();
    }

    /// Replace the port set for `mlid`. An empty set removes the entry.
    pub fn set_ports(&mut self, mlid: Lid, ports: &BTreeSet<PortNum>) -> RoutingResult<()> {
        let idx = mlid_index(mlid)?;
        if ports.is_empty() {
            self.masks.remove(&idx);
            return Ok(());
        }
        let mut mask = bitvec![u16, Lsb0; 0; self.width];
        for port in ports {
            if (*port as usize) >= self.width {
                return Err(RoutingError::InvalidParameter(format!(
                    "port {} beyond multicast table width {}",
                    port, self.width
                )));
            }
            mask.set(*port as usize, true);
        }
        self.masks.insert(idx, mask);
        Ok(())
    }

    /// Ports carrying `mlid`, ascending.
    pub fn ports(&self, mlid: Lid) -> BTreeSet<PortNum> {
        mlid.multicast_index()
            .and_then(|idx| self.masks.get(&idx))
            .map(|mask| mask.iter_ones().map(|p| p as PortNum).collect())
            .unwrap_or_default()
    }

    pub fn carries(&self, mlid: Lid, port: PortNum) -> bool {
        mlid.multicast_index()
            .and_then(|idx| self.masks.get(&idx))
            .and_then(|mask| mask.get(port as usize).map(|b| *b))
            .unwrap_or(false)
    }

    /// MLIDs with at least one port.
    pub fn mlids(&self) -> Vec<Lid> {
        self.masks
            .keys()
            .map(|idx| Lid(MULTICAST_LID_BASE + *idx as u16))
            .collect()
    }

    fn positions(&self) -> u8 {
        self.width.div_ceil(MCAST_POSITION_PORTS) as u8
    }

    /// (block, position) pairs spanned by the current entries.
    pub fn block_keys(&self) -> BTreeSet<(u16, u8)> {
        let blocks: BTreeSet<u16> = self
            .masks
            .keys()
            .map(|idx| (idx / MCAST_BLOCK_MLIDS) as u16)
            .collect();
        blocks
            .into_iter()
            .flat_map(|b| (0..self.positions()).map(move |pos| (b, pos)))
            .collect()
    }

    /// 32 masks covering ports `position*16 .. position*16+16`.
    pub fn block(&self, block: u16, position: u8) -> Vec<u16> {
        let first = block as usize * MCAST_BLOCK_MLIDS;
        let lo = position as usize * MCAST_POSITION_PORTS;
        (first..first + MCAST_BLOCK_MLIDS)
            .map(|idx| {
                let Some(mask) = self.masks.get(&idx) else {
                    return 0;
                };
                let mut word = 0u16;
                for bit in 0..MCAST_POSITION_PORTS {
                    if mask.get(lo + bit).map(|b| *b).unwrap_or(false) {
                        word |= 1 << bit;
                    }
                }
                word
            })
            .collect()
    }

    /// Overwrite one block position with programmed masks.
    pub fn apply_block(&mut self, block: u16, position: u8, masks: &[u16]) {
        let first = block as usize * MCAST_BLOCK_MLIDS;
        let lo = position as usize * MCAST_POSITION_PORTS;
        let width = self.width;

        for (offset, word) in masks.iter().take(MCAST_BLOCK_MLIDS).enumerate() {
            let idx = first + offset;
            let mask = self
                .masks
                .entry(idx)
                .or_insert_with(|| bitvec![u16, Lsb0; 0; width]);
            for bit in 0..MCAST_POSITION_PORTS {
                if lo + bit < width {
                    mask.set(lo + bit, word & (1 << bit) != 0);
                }
            }
            if mask.not_any() {
                self.masks.remove(&idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_rejects_unicast_lid() {
        assert!(MulticastGroup::new(Lid(5), [0; 16]).is_err());
        assert!(MulticastGroup::new(Lid(0xC000), [0; 16]).is_ok());
    }

    #[test]
    fn test_join_and_leave_report_changes() {
        let mut g = MulticastGroup::new(Lid(0xC001), [1; 16]).unwrap();
        assert!(g.join(Guid(1), 1, JoinState::FullMember));
        assert!(!g.join(Guid(1), 1, JoinState::FullMember));
        assert!(g.join(Guid(1), 1, JoinState::NonMember));
        assert!(g.leave(Guid(1), 1));
        assert!(!g.leave(Guid(1), 1));
        assert!(g.is_empty());
    }

    #[test]
    fn test_block_layout() {
        let mut t = MulticastTable::new(20);
        let ports: BTreeSet<PortNum> = [1, 3, 17].into_iter().collect();
        t.set_ports(Lid(0xC021), &ports).unwrap();

        assert_eq!(
            t.block_keys().into_iter().collect::<Vec<_>>(),
            vec![(1, 0), (1, 1)]
        );
        let low = t.block(1, 0);
        assert_eq!(low.len(), MCAST_BLOCK_MLIDS);
        assert_eq!(low[1], 0b1010);
        assert_eq!(t.block(1, 1)[1], 0b10);
    }

    #[test]
    fn test_apply_block_mirrors_staged() {
        let mut staged = MulticastTable::new(8);
        let ports: BTreeSet<PortNum> = [2, 5].into_iter().collect();
        staged.set_ports(Lid(0xC003), &ports).unwrap();

        let mut live = MulticastTable::new(8);
        for (b, pos) in staged.block_keys() {
            live.apply_block(b, pos, &staged.block(b, pos));
        }
        assert_eq!(live, staged);
        assert!(live.carries(Lid(0xC003), 5));
        assert!(!live.carries(Lid(0xC003), 1));

        live.apply_block(0, 0, &[0; MCAST_BLOCK_MLIDS]);
        assert!(live.mlids().is_empty());
    }

    #[test]
    fn test_port_beyond_width_rejected() {
        let mut t = MulticastTable::new(4);
        let ports: BTreeSet<PortNum> = [9].into_iter().collect();
        assert!(t.set_ports(Lid(0xC000), &ports).is_err());
    }
}
