//! # sm-01-routing
//!
//! Topology store, min-hop routing and forwarding-table synthesis for the
//! fabric subnet manager.
//!
//! ## Overview
//!
//! This subsystem provides:
//! - **Topology Store**: arena of nodes and ports, links as handle pairs
//! - **Hop Matrices**: per-switch minimum hop counts for every LID
//! - **Unicast Routing**: least-loaded min-hop port selection, optional
//!   dimension ordering or LMC-aware spreading
//! - **Multicast Routing**: one deterministic spanning tree per group
//! - **Synthesizer**: staged tables diffed against programmed blocks
//! - **Snapshots**: immutable routing views published for readers
//!
//! ## Architecture
//!
//! ```text
//! Sweep engine ──&mut FabricState──→ RoutingEngine
//!                                        │
//!                                        ├── build_hop_matrices
//!                                        ├── build_forwarding_tables ──→ UnicastBlockUpdate*
//!                                        └── build_multicast_trees   ──→ MulticastBlockUpdate*
//!
//! Sweep engine ──RoutingSnapshot──→ FabricView ←──read── query collaborators
//! ```
//!
//! ## Loop Freedom
//!
//! Unicast: every chosen port sits at the switch's minimum hop count, so
//! each forwarding step strictly approaches the destination.
//! Multicast: port choice is deterministic and never load-balanced, and tree
//! construction rejects revisiting a switch.

pub mod domain;
pub mod engine;
pub mod snapshot;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use domain::{
    Destination, FabricState, ForwardingTable, HopMatrix, LinearForwardingTable, MulticastGroup,
    MulticastTable, MulticastTree, Node, NodeHandle, Port, PortRef, RandomForwardingTable,
    RoutingError, RoutingResult, Switch, TopologyStore, TreeNode, UnicastTable, HOP_NO_PATH,
};
pub use engine::{
    engine_for, recommend_multicast_path, recommend_path, HopStats, MinHopEngine,
    MulticastBlockUpdate, MulticastPlan, PathOptions, PathTracking, RoutingEngine,
    RoutingEngineKind, RoutingOptions, SynthesisFlags, UnicastBlockUpdate, UnicastPlan,
};
pub use snapshot::{FabricView, RoutingSnapshot, SwitchSnapshot};
