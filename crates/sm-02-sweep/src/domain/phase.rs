//! Phase manager interface.

use fabric_types::DiscoveryReport;
use sm_01_routing::{FabricState, RoutingEngine};

use super::context::SweepContext;
use super::state_machine::{SweepKind, SweepPhase};
use crate::config::SmConfig;
use crate::error::SweepResult;
use crate::ports::outbound::MadTransport;

/// Result of running one phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Nothing outstanding; advance now.
    Done,
    /// Requests are in flight; advance once they drain.
    DonePending,
}

impl PhaseOutcome {
    /// `DonePending` when `issued` requests went out, `Done` otherwise.
    pub fn from_issued(issued: usize) -> Self {
        if issued > 0 {
            Self::DonePending
        } else {
            Self::Done
        }
    }
}

/// Everything a phase may touch while it runs.
pub struct PhaseEnv<'a> {
    pub kind: SweepKind,
    pub fabric: &'a mut FabricState,
    pub ctx: &'a mut SweepContext,
    pub transport: &'a dyn MadTransport,
    pub engine: &'a dyn RoutingEngine,
    pub config: &'a SmConfig,
    /// Discovery result of the current sweep.
    pub report: &'a DiscoveryReport,
}

impl PhaseEnv<'_> {
    /// Issue `request`; true if the transport accepted it.
    pub fn issue(&mut self, request: fabric_types::MadRequest) -> bool {
        self.ctx.issue(self.transport, request)
    }
}

/// One unit of fabric work.
///
/// `run` must not block on the fabric: it issues requests and reports
/// `DonePending`. `on_drained` runs once those requests have all completed,
/// before the sweep advances.
pub trait PhaseManager: Send {
    fn phase(&self) -> SweepPhase;

    fn run(&mut self, env: &mut PhaseEnv<'_>) -> SweepResult<PhaseOutcome>;

    fn on_drained(&mut self, _env: &mut PhaseEnv<'_>) -> SweepResult<()> {
        Ok(())
    }
}
