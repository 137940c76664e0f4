//! # Sweep Context
//!
//! Per-sweep bookkeeping shared by the phases: the table of in-flight
//! transactions and the flags the phases raise.
//!
//! ## Outstanding Work
//!
//! Every accepted request gets a fresh `TransactionId` and an entry in the
//! pending table. A completion removes its entry; the outstanding count is the
//! table size, so a duplicate or unknown completion cannot decrement it twice.
//! IDs are never reused, so completions that arrive after their sweep was
//! abandoned are recognised as unknown.

use std::collections::HashMap;

use fabric_types::{Guid, MadRequest, TransactionId};
use sm_01_routing::{FabricState, PortRef};
use tracing::warn;

use crate::error::SweepResult;
use crate::metrics;
use crate::ports::outbound::MadTransport;

#[derive(Debug, Default)]
pub struct SweepContext {
    next_id: u64,
    pending: HashMap<TransactionId, MadRequest>,
    /// Sequence number of the running sweep, stamped on rediscovered nodes.
    pub sweep_id: u64,
    /// Some phase queued programming work.
    pub any_change: bool,
    /// Nodes or links differ from the previous sweep.
    pub topology_changed: bool,
    /// Some switch's hop matrix moved in UNICAST.
    pub hop_counts_changed: bool,
    /// Some transaction or group failed; a heavy retry is owed.
    pub incomplete: bool,
    /// Requests accepted by the transport this sweep.
    pub issued: usize,
    /// Requests that failed this sweep, rejected submits included.
    pub failed: usize,
}

impl SweepContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the per-sweep flags for a new sweep.
    ///
    /// Pending transactions are expected to be empty here; any left over are
    /// discarded.
    pub fn begin(&mut self) -> u64 {
        self.discard_outstanding();
        self.sweep_id += 1;
        self.any_change = false;
        self.topology_changed = false;
        self.hop_counts_changed = false;
        self.incomplete = false;
        self.issued = 0;
        self.failed = 0;
        self.sweep_id
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Hand `request` to the transport.
    ///
    /// A request the transport refuses is counted as failed on the spot and
    /// never becomes outstanding. Returns whether it was accepted.
    pub fn issue(&mut self, transport: &dyn MadTransport, request: MadRequest) -> bool {
        let id = TransactionId(self.next_id);
        self.next_id += 1;

        match transport.submit(id, request.clone()) {
            Ok(()) => {
                self.pending.insert(id, request);
                self.issued += 1;
                metrics::record_request_issued();
                true
            }
            Err(e) => {
                warn!(target_node = %request.target(), error = %e, "request refused by transport");
                self.record_failure();
                false
            }
        }
    }

    /// Remove the entry for `id`. `None` for unknown or repeated IDs.
    pub fn complete(&mut self, id: TransactionId) -> Option<MadRequest> {
        self.pending.remove(&id)
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
        self.incomplete = true;
        metrics::record_transaction_failure();
    }

    /// Forget every outstanding transaction; returns how many were dropped.
    pub fn discard_outstanding(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

/// Apply a successfully completed request to the fabric model.
///
/// Programming baselines and port attributes only change here, so a failed
/// or lost request leaves the model showing the old contents and the next
/// sweep queues the same change again.
pub fn apply_completed(fabric: &mut FabricState, request: &MadRequest) -> SweepResult<()> {
    match request {
        MadRequest::SetUnicastBlock {
            switch,
            block,
            contents,
        } => fabric.commit_unicast_block(*switch, *block, contents)?,
        MadRequest::SetMulticastBlock {
            switch,
            block,
            position,
            masks,
        } => fabric.commit_multicast_block(*switch, *block, *position, masks)?,
        MadRequest::SetPortState { node, port, state } => {
            if let Some(p) = port_of(fabric, *node, *port) {
                p.link_state = *state;
            }
        }
        MadRequest::SetPortLid {
            node,
            port,
            lid,
            lmc,
        } => {
            if let Some(p) = port_of(fabric, *node, *port) {
                p.base_lid = *lid;
                p.lmc = *lmc;
            }
        }
        MadRequest::SetSl2Vl { .. } | MadRequest::SetVlArbitration { .. } => {}
    }
    Ok(())
}

fn port_of(
    fabric: &mut FabricState,
    node: Guid,
    port: fabric_types::PortNum,
) -> Option<&mut sm_01_routing::Port> {
    let handle = fabric.topology.handle_of(node)?;
    fabric.topology.port_mut(PortRef::new(handle, port))
}
