//! UNICAST phase: hop matrices, forwarding tables and QoS tables.

use sm_01_routing::SynthesisFlags;
use tracing::{debug, info, warn};

use crate::domain::phase::{PhaseEnv, PhaseManager, PhaseOutcome};
use crate::domain::state_machine::SweepPhase;
use crate::error::SweepResult;
use crate::metrics;

#[derive(Debug, Default)]
pub struct UnicastManager;

impl UnicastManager {
    pub fn new() -> Self {
        Self
    }
}

impl PhaseManager for UnicastManager {
    fn phase(&self) -> SweepPhase {
        SweepPhase::Unicast
    }

    fn run(&mut self, env: &mut PhaseEnv<'_>) -> SweepResult<PhaseOutcome> {
        let stats = env.engine.build_hop_matrices(env.fabric)?;
        debug!(
            engine = env.engine.name(),
            switches = stats.switches,
            passes = stats.passes,
            max_lid = stats.max_lid,
            changed = stats.changed_switches,
            "hop matrices built"
        );

        let plan = env.engine.build_forwarding_tables(env.fabric)?;
        let mut flags = SynthesisFlags::from(&stats);
        flags.merge(plan.flags);
        if flags.some_hop_count_set {
            info!(switches = stats.changed_switches, "hop counts changed, routes recomputed");
        }
        if plan.unreachable > 0 {
            debug!(entries = plan.unreachable, "destinations without a path");
        }
        if plan.overflowed > 0 {
            warn!(entries = plan.overflowed, "routes dropped by full forwarding tables");
        }

        let mut requests: Vec<_> = plan.updates.iter().map(|u| u.to_request()).collect();
        requests.extend(env.engine.update_sl2vl(env.fabric)?);
        requests.extend(env.engine.update_vlarb(env.fabric)?);

        let mut issued = 0;
        for request in requests {
            if env.issue(request) {
                issued += 1;
            }
        }
        env.ctx.any_change |= flags.any_change;
        env.ctx.hop_counts_changed |= flags.some_hop_count_set;
        metrics::record_blocks_queued("unicast", plan.updates.len());

        debug!(blocks = plan.updates.len(), issued, "unicast phase done");
        Ok(PhaseOutcome::from_issued(issued))
    }
}
