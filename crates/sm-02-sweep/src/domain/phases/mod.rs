//! Phase managers, one per sweep phase.

pub mod address;
pub mod drop;
pub mod link;
pub mod multicast;
pub mod unicast;

pub use address::LidManager;
pub use drop::DropManager;
pub use link::{LinkClaims, LinkManager};
pub use multicast::MulticastManager;
pub use unicast::UnicastManager;

use super::phase::PhaseManager;
use super::state_machine::SweepPhase;

/// The five managers of a heavy sweep.
#[derive(Debug, Default)]
pub struct PhaseSet {
    link: LinkManager,
    drop: DropManager,
    address: LidManager,
    unicast: UnicastManager,
    multicast: MulticastManager,
}

impl PhaseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_mut(&mut self, phase: SweepPhase) -> &mut dyn PhaseManager {
        match phase {
            SweepPhase::Link => &mut self.link,
            SweepPhase::Drop => &mut self.drop,
            SweepPhase::Address => &mut self.address,
            SweepPhase::Unicast => &mut self.unicast,
            SweepPhase::Multicast => &mut self.multicast,
        }
    }

    pub fn lids(&self) -> &LidManager {
        &self.address
    }
}
