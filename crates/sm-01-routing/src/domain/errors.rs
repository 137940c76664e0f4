//! Domain errors for routing synthesis.

use fabric_types::{Guid, Lid};
use thiserror::Error;

/// Errors raised while building hop matrices or forwarding tables.
///
/// An unreachable destination is deliberately absent: it is a valid routing
/// result (`None` / `NO_PATH`), never an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// A matrix or table could not be grown. Fatal to the current sweep.
    #[error("insufficient resources: cannot grow {what} to {requested} entries")]
    InsufficientResources { what: &'static str, requested: usize },

    /// Malformed input (LID 0, multicast LID for unicast, port out of range).
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Relaxation kept changing past the switch-count bound.
    #[error("hop matrices did not converge after {passes} passes")]
    NonConvergent { passes: usize },

    /// Handle does not refer to a live node.
    #[error("unknown node handle {0}")]
    UnknownNode(u32),

    /// Handle refers to a node that is not a switch.
    #[error("node {0} is not a switch")]
    NotASwitch(Guid),

    /// Forwarding table has no room for another entry.
    #[error("forwarding table full: capacity {capacity}")]
    TableFull { capacity: usize },

    /// Tree construction revisited a switch.
    #[error("multicast loop detected for {mlid} at switch {switch}")]
    MulticastLoop { mlid: Lid, switch: Guid },
}

/// Result type for routing operations
pub type RoutingResult<T> = Result<T, RoutingError>;
