//! # Core Fabric Entities
//!
//! Identifiers and small value types describing the fabric.
//!
//! ## Address Space
//!
//! ```text
//! 0x0000            reserved (invalid)
//! 0x0001 - 0xBFFF   unicast LIDs
//! 0xC000 - 0xFFFE   multicast LIDs (MLIDs)
//! 0xFFFF            permissive
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest assignable unicast LID.
pub const MAX_UNICAST_LID: u16 = 0xBFFF;

/// First multicast LID.
pub const MULTICAST_LID_BASE: u16 = 0xC000;

/// Highest multicast LID.
pub const MAX_MULTICAST_LID: u16 = 0xFFFE;

/// Largest supported LID mask count.
pub const MAX_LMC: u8 = 7;

/// Physical port number on a node. Port 0 is the switch management port.
pub type PortNum = u8;

/// Sentinel port meaning "no route" in forwarding tables and recommendations.
pub const NO_PATH: PortNum = 0xFF;

/// Highest port number a switch can expose.
pub const MAX_PORTS: PortNum = 254;

/// 64-bit globally unique identifier of a node, system or port.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Guid(pub u64);

impl Guid {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({:#018x})", self.0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Local identifier: the fabric address of a port.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Lid(pub u16);

impl Lid {
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u16 {
        self.0
    }

    /// True for assignable unicast LIDs (1..=0xBFFF).
    pub const fn is_unicast(&self) -> bool {
        self.0 != 0 && self.0 <= MAX_UNICAST_LID
    }

    /// True for multicast LIDs (0xC000..=0xFFFE).
    pub const fn is_multicast(&self) -> bool {
        self.0 >= MULTICAST_LID_BASE && self.0 <= MAX_MULTICAST_LID
    }

    /// Offset of a multicast LID inside the multicast table.
    pub fn multicast_index(&self) -> Option<usize> {
        self.is_multicast()
            .then(|| (self.0 - MULTICAST_LID_BASE) as usize)
    }

    /// Inclusive range of LIDs covered by this base LID under `lmc`.
    pub fn range(&self, lmc: u8) -> std::ops::RangeInclusive<u16> {
        let span = 1u16 << lmc.min(MAX_LMC);
        self.0..=self.0.saturating_add(span - 1)
    }
}

impl fmt::Debug for Lid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lid({:#06x})", self.0)
    }
}

impl fmt::Display for Lid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Kind of device discovered on the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Channel adapter (compute node, storage target).
    Endpoint,
    Switch,
    Router,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Endpoint => write!(f, "endpoint"),
            Self::Switch => write!(f, "switch"),
            Self::Router => write!(f, "router"),
        }
    }
}

/// Logical link state of a port.
///
/// ```text
/// [DOWN] ──physical up──→ [INIT] ──SM──→ [ARMED] ──SM──→ [ACTIVE]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Down,
    Init,
    Armed,
    Active,
}

impl LinkState {
    /// Any state other than `Down` means a physical link exists.
    pub fn is_up(&self) -> bool {
        !matches!(self, Self::Down)
    }

    /// Only `Active` links carry data traffic.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Join state of a multicast group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinState {
    #[default]
    FullMember,
    NonMember,
    SendOnlyNonMember,
}

/// Role of a subnet manager instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmRole {
    #[default]
    Discovering,
    Standby,
    Master,
}

impl fmt::Display for SmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovering => write!(f, "DISCOVERING"),
            Self::Standby => write!(f, "STANDBY"),
            Self::Master => write!(f, "MASTER"),
        }
    }
}

/// Another subnet manager instance seen on the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SmCandidate {
    pub guid: Guid,
    pub priority: u8,
}

impl SmCandidate {
    pub const fn new(guid: Guid, priority: u8) -> Self {
        Self { guid, priority }
    }

    /// Whether `self` wins arbitration against `other`.
    ///
    /// Higher priority wins; on equal priority the numerically smaller GUID
    /// wins. This is a strict total order on distinct GUIDs.
    pub fn is_preferred_over(&self, other: &SmCandidate) -> bool {
        if self.priority != other.priority {
            return self.priority > other.priority;
        }
        self.guid < other.guid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lid_classes() {
        assert!(!Lid(0).is_unicast());
        assert!(Lid(1).is_unicast());
        assert!(Lid(MAX_UNICAST_LID).is_unicast());
        assert!(!Lid(MULTICAST_LID_BASE).is_unicast());
        assert!(Lid(MULTICAST_LID_BASE).is_multicast());
        assert!(!Lid(0xFFFF).is_multicast());
        assert_eq!(Lid(0xC001).multicast_index(), Some(1));
    }

    #[test]
    fn test_lid_range_follows_lmc() {
        assert_eq!(Lid(8).range(0), 8..=8);
        assert_eq!(Lid(8).range(2), 8..=11);
    }

    #[test]
    fn test_candidate_preference_priority_first() {
        let low = SmCandidate::new(Guid(1), 3);
        let high = SmCandidate::new(Guid(99), 7);
        assert!(high.is_preferred_over(&low));
        assert!(!low.is_preferred_over(&high));
    }

    #[test]
    fn test_candidate_preference_guid_tiebreak() {
        let a = SmCandidate::new(Guid(10), 5);
        let b = SmCandidate::new(Guid(3), 5);
        assert!(b.is_preferred_over(&a));
        assert!(!a.is_preferred_over(&b));
    }

    #[test]
    fn test_only_active_carries_traffic() {
        assert!(LinkState::Init.is_up());
        assert!(!LinkState::Init.is_active());
        assert!(!LinkState::Armed.is_active());
        assert!(LinkState::Active.is_active());
        assert!(!LinkState::Down.is_up());
    }

    #[test]
    fn test_link_state_serde_names() {
        let json = serde_json::to_string(&LinkState::Active).unwrap();
        assert_eq!(json, "\"active\"");
    }
}
