//! Ports module for the sweep engine

pub mod inbound;
pub mod outbound;

pub use inbound::{SmStatus, SubnetManagerApi};
pub use outbound::{
    completion_channel, CompletionSink, CompletionStream, FabricDiscovery, MadTransport, PeerInfo,
    SmPeers,
};
