//! # sm-02-sweep
//!
//! Sweep orchestration and role arbitration for the fabric subnet manager.
//!
//! ## Overview
//!
//! This subsystem provides:
//! - **Sweep State Machine**: heavy and light sweeps, phase barrier, retry
//!   with exponential backoff
//! - **Phase Managers**: LINK, DROP, ADDRESS, UNICAST, MULTICAST
//! - **Role State Machine**: DISCOVERING / STANDBY / MASTER arbitration and
//!   handover
//! - **Service**: one tokio task owning the fabric model, fed by commands,
//!   completions and timers
//!
//! ## Architecture
//!
//! ```text
//! SmHandle ──Command──→ SweepService ──MadRequest──→ MadTransport
//!    ↑                    │    ↑                          │
//!    │                    │    └──────── Completion ──────┘
//!    │                    │
//!    │                    ├── FabricDiscovery (discover)
//!    │                    ├── SmPeers (arbitrate, poll, handover)
//!    │                    └── RoutingEngine (sm-01-routing)
//!    │                            │
//!    └──── queries ──── FabricView (snapshot per phase boundary)
//! ```
//!
//! ## Sweep
//!
//! ```text
//! Heavy: [IDLE] → LINK → DROP → ADDRESS → UNICAST → MULTICAST → [IDLE]
//! Light: [IDLE] → LINK → [IDLE]    (a detected change escalates to heavy)
//! ```
//!
//! A phase either finishes at once or issues requests and waits for every
//! one of them to complete. Failed requests mark the sweep incomplete and a
//! heavy retry follows after backoff.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sm_02_sweep::{completion_channel, spawn, SimulatedFabric, SmConfig, SubnetManagerApi};
//!
//! let (sink, completions) = completion_channel();
//! let fabric = Arc::new(SimulatedFabric::new(sink));
//! fabric.add_switch(0x100, 8).add_endpoint(0x1000, 1).connect(0x1000, 1, 0x100, 1);
//!
//! let (sm, task) = spawn(SmConfig::default(), fabric.clone(), fabric.clone(), fabric, completions)?;
//! println!("{}", sm.dump_forwarding_tables());
//! ```

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod service;

#[cfg(any(test, feature = "simulator"))]
pub use adapters::{RequestKind, SimulatedFabric};
pub use config::{ConfigError, SmConfig, MAX_PRIORITY};
pub use domain::{
    arbitrate, IdleWork, RetryPolicy, RoleEvent, RoleManager, RoleStateMachine, SweepEvent,
    SweepKind, SweepOutcome, SweepPhase, SweepState, SweepStateMachine,
};
pub use error::{SweepError, SweepResult};
pub use ports::{
    completion_channel, CompletionSink, CompletionStream, FabricDiscovery, MadTransport, PeerInfo,
    SmPeers, SmStatus, SubnetManagerApi,
};
pub use service::{spawn, Command, SmHandle, SweepService};
