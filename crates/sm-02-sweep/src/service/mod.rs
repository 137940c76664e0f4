//! Subnet manager service: the engine task and its handle.

mod runner;

#[cfg(test)]
mod tests;

pub use runner::{SweepService, COMMAND_QUEUE_DEPTH};

use std::sync::Arc;

use async_trait::async_trait;
use fabric_types::{Guid, JoinState, Lid, PortNum, SmRole};
use sm_01_routing::{FabricView, MulticastGroup, RoutingSnapshot};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::SmConfig;
use crate::domain::{IdleWork, RoleManager, SweepKind};
use crate::error::{SweepError, SweepResult};
use crate::ports::inbound::{SmStatus, SubnetManagerApi};
use crate::ports::outbound::{CompletionStream, FabricDiscovery, MadTransport, SmPeers};

/// Messages from handles to the engine task.
#[derive(Debug)]
pub enum Command {
    Sweep(SweepKind),
    TopologyChanged,
    HandoverReceived,
    JoinGroup {
        mlid: Lid,
        mgid: [u8; 16],
        node: Guid,
        port: PortNum,
        state: JoinState,
        reply: oneshot::Sender<SweepResult<bool>>,
    },
    LeaveGroup {
        mlid: Lid,
        node: Guid,
        port: PortNum,
        reply: oneshot::Sender<bool>,
    },
    Idle(IdleWork),
    Shutdown,
}

/// Build the engine and run it on a new task.
///
/// # Errors
///
/// Fails on invalid configuration; nothing is spawned then.
pub fn spawn<D, T, P>(
    config: SmConfig,
    discovery: Arc<D>,
    transport: Arc<T>,
    peers: Arc<P>,
    completions: CompletionStream,
) -> SweepResult<(SmHandle, JoinHandle<()>)>
where
    D: FabricDiscovery + 'static,
    T: MadTransport + 'static,
    P: SmPeers + 'static,
{
    let (service, handle) = SweepService::new(config, discovery, transport, peers, completions)?;
    let task = tokio::spawn(service.run());
    Ok((handle, task))
}

/// Cheap, cloneable access to a running subnet manager.
#[derive(Debug, Clone)]
pub struct SmHandle {
    commands: mpsc::Sender<Command>,
    view: Arc<FabricView>,
    status: watch::Receiver<SmStatus>,
    role: Arc<RoleManager>,
}

impl SmHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        view: Arc<FabricView>,
        status: watch::Receiver<SmStatus>,
        role: Arc<RoleManager>,
    ) -> Self {
        Self {
            commands,
            view,
            status,
            role,
        }
    }

    async fn send(&self, command: Command) -> SweepResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SweepError::Stopped)
    }

    /// Current role, read without going through the engine task.
    pub fn role(&self) -> SmRole {
        self.role.role()
    }

    /// Routing snapshot published at the last phase boundary.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.view.snapshot()
    }

    /// Status updates, for waiting on a condition.
    pub fn subscribe(&self) -> watch::Receiver<SmStatus> {
        self.status.clone()
    }
}

#[async_trait]
impl SubnetManagerApi for SmHandle {
    async fn trigger_sweep(&self, kind: SweepKind) -> SweepResult<()> {
        self.send(Command::Sweep(kind)).await
    }

    async fn report_topology_change(&self) -> SweepResult<()> {
        self.send(Command::TopologyChanged).await
    }

    async fn handover_received(&self) -> SweepResult<()> {
        self.send(Command::HandoverReceived).await
    }

    async fn join_group(
        &self,
        mlid: Lid,
        mgid: [u8; 16],
        node: Guid,
        port: PortNum,
        state: JoinState,
    ) -> SweepResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::JoinGroup {
            mlid,
            mgid,
            node,
            port,
            state,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SweepError::Stopped)?
    }

    async fn leave_group(&self, mlid: Lid, node: Guid, port: PortNum) -> SweepResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LeaveGroup {
            mlid,
            node,
            port,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SweepError::Stopped)
    }

    async fn enqueue_idle(&self, work: IdleWork) -> SweepResult<()> {
        self.send(Command::Idle(work)).await
    }

    async fn shutdown(&self) -> SweepResult<()> {
        self.send(Command::Shutdown).await
    }

    fn status(&self) -> SmStatus {
        self.status.borrow().clone()
    }

    fn hop_count(&self, switch: Guid, lid: Lid) -> Option<u8> {
        self.view.snapshot().hop_count(switch, lid)
    }

    fn forwarding_entry(&self, switch: Guid, lid: Lid) -> Option<PortNum> {
        self.view.snapshot().forwarding_entry(switch, lid)
    }

    fn multicast_group(&self, mlid: Lid) -> Option<MulticastGroup> {
        self.view.snapshot().multicast_group(mlid).cloned()
    }

    fn dump_forwarding_tables(&self) -> String {
        self.view.snapshot().dump_forwarding_tables()
    }
}
