//! # Error Types
//!
//! Errors reported by the management transport collaborator.

use thiserror::Error;

use crate::entities::Guid;

/// Failure of a management request or discovery round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response before the transport's retry budget ran out.
    #[error("request to {target} timed out")]
    Timeout { target: Guid },

    /// The target answered with an error status.
    #[error("request to {target} rejected with status {status:#06x}")]
    Rejected { target: Guid, status: u16 },

    /// The bounded in-flight queue could not accept the request.
    #[error("transport queue full")]
    QueueFull,

    /// Discovery could not complete.
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The transport has been torn down.
    #[error("transport closed")]
    Closed,
}
