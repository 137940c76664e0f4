//! MULTICAST phase: one spanning tree per group, then the changed
//! multicast table blocks.

use tracing::{debug, warn};

use crate::domain::phase::{PhaseEnv, PhaseManager, PhaseOutcome};
use crate::domain::state_machine::SweepPhase;
use crate::error::SweepResult;
use crate::metrics;

#[derive(Debug, Default)]
pub struct MulticastManager;

impl MulticastManager {
    pub fn new() -> Self {
        Self
    }
}

impl PhaseManager for MulticastManager {
    fn phase(&self) -> SweepPhase {
        SweepPhase::Multicast
    }

    fn run(&mut self, env: &mut PhaseEnv<'_>) -> SweepResult<PhaseOutcome> {
        let plan = env.engine.build_multicast_trees(env.fabric)?;

        if !plan.failed_groups.is_empty() {
            warn!(groups = ?plan.failed_groups, "multicast groups left unrouted");
            env.ctx.incomplete = true;
        }

        let mut issued = 0;
        for update in &plan.updates {
            if env.issue(update.to_request()) {
                issued += 1;
            }
        }
        env.ctx.any_change |= plan.flags.any_change;
        metrics::record_blocks_queued("multicast", plan.updates.len());

        debug!(
            groups = env.fabric.groups.len(),
            blocks = plan.updates.len(),
            issued,
            "multicast phase done"
        );
        Ok(PhaseOutcome::from_issued(issued))
    }
}
