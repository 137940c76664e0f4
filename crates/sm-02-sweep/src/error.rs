//! Error types for the sweep engine.

use fabric_types::TransportError;
use sm_01_routing::RoutingError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by the sweep engine and its phases.
///
/// Phase errors abort the current sweep and schedule a heavy retry; only
/// construction errors reach the caller.
#[derive(Debug, Error)]
pub enum SweepError {
    /// Routing synthesis failed (resources, non-convergence).
    #[error("routing: {0}")]
    Routing(#[from] RoutingError),

    /// Discovery or peer communication failed.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// No aligned LID range left for a port.
    #[error("no free LID range of {span} for port {port_guid}")]
    LidExhausted {
        port_guid: fabric_types::Guid,
        span: u16,
    },

    /// The engine task is gone.
    #[error("subnet manager stopped")]
    Stopped,
}

/// Result type for sweep operations
pub type SweepResult<T> = Result<T, SweepError>;
