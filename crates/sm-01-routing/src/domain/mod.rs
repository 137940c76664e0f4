//! Domain module for the routing subsystem
//!
//! ## Core Modules
//! - topology: node/port arena with handle-pair links
//! - hop_matrix: per-switch minimum-hop matrix
//! - forwarding: linear and random unicast tables
//! - multicast: groups, trees and per-switch multicast tables
//! - switch: staged/live forwarding state and block diffing
//! - fabric: fabric-wide state owned by the sweep engine

pub mod errors;
pub mod fabric;
pub mod forwarding;
pub mod hop_matrix;
pub mod multicast;
pub mod switch;
pub mod topology;

pub use errors::{RoutingError, RoutingResult};
pub use fabric::FabricState;
pub use forwarding::{
    ForwardingTable, LinearForwardingTable, RandomForwardingTable, UnicastTable,
    LINEAR_BLOCK_SIZE, RANDOM_BLOCK_SIZE,
};
pub use hop_matrix::{HopMatrix, HOP_NO_PATH};
pub use multicast::{
    MemberKey, MulticastGroup, MulticastTable, MulticastTree, TreeNode, MCAST_BLOCK_MLIDS,
    MCAST_POSITION_PORTS,
};
pub use switch::Switch;
pub use topology::{Destination, Node, NodeHandle, Port, PortRef, TopologyStore};
