//! Domain layer for the sweep engine
//!
//! Pure state machines and phase logic. Nothing here awaits; the service
//! layer owns the event loop and feeds results in.

pub mod context;
pub mod idle;
pub mod phase;
pub mod phases;
pub mod role;
pub mod state_machine;

pub use context::{apply_completed, SweepContext};
pub use idle::{IdleCallback, IdleQueue, IdleWork};
pub use phase::{PhaseEnv, PhaseManager, PhaseOutcome};
pub use phases::{
    DropManager, LidManager, LinkClaims, LinkManager, MulticastManager, PhaseSet, UnicastManager,
};
pub use role::{arbitrate, RoleEvent, RoleManager, RoleStateMachine};
pub use state_machine::{
    RetryPolicy, SweepEvent, SweepKind, SweepOutcome, SweepPhase, SweepState, SweepStateMachine,
};
