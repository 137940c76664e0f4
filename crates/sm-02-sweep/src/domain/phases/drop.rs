//! DROP phase: forget nodes the current sweep did not rediscover and
//! multicast memberships of ports that went with them.

use sm_01_routing::NodeHandle;
use tracing::{debug, info};

use crate::domain::phase::{PhaseEnv, PhaseManager, PhaseOutcome};
use crate::domain::state_machine::SweepPhase;
use crate::error::SweepResult;

#[derive(Debug, Default)]
pub struct DropManager;

impl DropManager {
    pub fn new() -> Self {
        Self
    }
}

impl PhaseManager for DropManager {
    fn phase(&self) -> SweepPhase {
        SweepPhase::Drop
    }

    fn run(&mut self, env: &mut PhaseEnv<'_>) -> SweepResult<PhaseOutcome> {
        let sweep_id = env.ctx.sweep_id;
        let stale: Vec<NodeHandle> = env
            .fabric
            .topology
            .iter()
            .filter(|(_, n)| n.seen_in != sweep_id)
            .map(|(h, _)| h)
            .collect();

        for handle in &stale {
            if let Some(node) = env.fabric.topology.remove(*handle) {
                info!(node = %node.guid, kind = %node.node_type, "dropping node no longer discovered");
            }
        }
        if !stale.is_empty() {
            env.ctx.topology_changed = true;
            env.fabric.generation += 1;
        }

        let pruned = env.fabric.prune_group_members();
        if pruned > 0 {
            debug!(pruned, "multicast members of vanished ports removed");
        }
        Ok(PhaseOutcome::Done)
    }
}
