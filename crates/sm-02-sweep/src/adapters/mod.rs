//! Adapters for the outbound ports.

#[cfg(any(test, feature = "simulator"))]
pub mod simulated;

#[cfg(any(test, feature = "simulator"))]
pub use simulated::{RequestKind, SimulatedFabric};
