//! Driving Ports (API - Inbound)
//!
//! What operational tooling and query collaborators may ask of a running
//! subnet manager. Queries read the last published routing snapshot and never
//! wait for a sweep; commands are queued to the engine task.

use async_trait::async_trait;
use fabric_types::{Guid, JoinState, Lid, PortNum, SmRole};
use serde::{Deserialize, Serialize};
use sm_01_routing::MulticastGroup;

use crate::domain::{IdleWork, SweepKind, SweepOutcome, SweepState};
use crate::error::SweepResult;

/// Point-in-time view of the engine for introspection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmStatus {
    pub role: SmRole,
    pub state: SweepState,
    /// Transactions issued and not yet completed.
    pub outstanding: usize,
    pub heavy_sweeps: u64,
    pub light_sweeps: u64,
    pub aborted_sweeps: u64,
    pub incomplete_sweeps: u64,
    pub last_outcome: Option<SweepOutcome>,
    /// Generation of the published routing snapshot.
    pub generation: u64,
}

/// Primary subnet manager API.
#[async_trait]
pub trait SubnetManagerApi: Send + Sync {
    /// Ask for a sweep. Merged with any pending request if one is running.
    async fn trigger_sweep(&self, kind: SweepKind) -> SweepResult<()>;

    /// Report a fabric change seen outside of sweeps (a trap, a link event).
    async fn report_topology_change(&self) -> SweepResult<()>;

    /// Mastership was handed to this instance.
    async fn handover_received(&self) -> SweepResult<()>;

    /// Add a member to a multicast group, creating the group on first join.
    ///
    /// Returns whether membership changed. A change schedules a heavy sweep.
    async fn join_group(
        &self,
        mlid: Lid,
        mgid: [u8; 16],
        node: Guid,
        port: PortNum,
        state: JoinState,
    ) -> SweepResult<bool>;

    /// Remove a member; the group is deleted with its last member.
    async fn leave_group(&self, mlid: Lid, node: Guid, port: PortNum) -> SweepResult<bool>;

    /// Queue work to run once at the next point nothing is outstanding.
    async fn enqueue_idle(&self, work: IdleWork) -> SweepResult<()>;

    /// Stop the engine. Outstanding transactions are discarded.
    async fn shutdown(&self) -> SweepResult<()>;

    fn status(&self) -> SmStatus;

    fn hop_count(&self, switch: Guid, lid: Lid) -> Option<u8>;

    fn forwarding_entry(&self, switch: Guid, lid: Lid) -> Option<PortNum>;

    fn multicast_group(&self, mlid: Lid) -> Option<MulticastGroup>;

    /// Text dump of every programmed forwarding entry.
    fn dump_forwarding_tables(&self) -> String;
}
