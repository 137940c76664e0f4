//! # ADDRESS phase
//!
//! Assigns every addressable port a base LID aligned to `2^lmc`.
//!
//! ## Assignment Order
//!
//! 1. The LID this manager gave the port in an earlier sweep, if still
//!    aligned and unclaimed.
//! 2. The LID the port reports as configured, under the same conditions.
//! 3. The lowest free aligned range.
//!
//! Assignments outlive the ports: a GUID that disappears keeps its range
//! reserved, so it gets the same LIDs back when it returns.
//!
//! Ports whose configured LID differs from the assignment get a
//! `SetPortLid` request; the LID table is rebuilt once those complete.

use std::collections::{BTreeMap, HashMap, HashSet};

use bitvec::prelude::*;
use fabric_types::{Guid, Lid, MadRequest, PortNum, MAX_UNICAST_LID};
use sm_01_routing::FabricState;
use tracing::{debug, warn};

use crate::config::SmConfig;
use crate::domain::phase::{PhaseEnv, PhaseManager, PhaseOutcome};
use crate::domain::state_machine::SweepPhase;
use crate::error::{SweepError, SweepResult};

/// A port that needs an address.
#[derive(Debug, Clone, Copy)]
struct Want {
    node: Guid,
    port: PortNum,
    port_guid: Guid,
    current: (Lid, u8),
    lmc: u8,
}

/// Claimed unicast LIDs.
struct LidSpace {
    used: BitVec,
    cursor: u16,
}

impl LidSpace {
    fn new() -> Self {
        Self {
            used: bitvec![0; MAX_UNICAST_LID as usize + 1],
            cursor: 1,
        }
    }

    fn fits(&self, base: Lid, lmc: u8) -> bool {
        let span = 1u16 << lmc;
        base.is_unicast()
            && base.raw() % span == 0
            && base.raw() as u32 + span as u32 - 1 <= MAX_UNICAST_LID as u32
            && base.range(lmc).all(|raw| !self.used[raw as usize])
    }

    fn claim(&mut self, base: Lid, lmc: u8) {
        for raw in base.range(lmc) {
            if raw <= MAX_UNICAST_LID {
                self.used.set(raw as usize, true);
            }
        }
    }

    /// Lowest free aligned range at or after the cursor, wrapping once.
    fn allocate(&mut self, lmc: u8) -> Option<Lid> {
        let span = 1u32 << lmc;
        let align = |from: u32| from.div_ceil(span).max(1) * span;
        let starts = [align(self.cursor as u32), span];

        for start in starts {
            let mut base = start;
            while base + span - 1 <= MAX_UNICAST_LID as u32 {
                let lid = Lid(base as u16);
                if self.fits(lid, lmc) {
                    self.claim(lid, lmc);
                    self.cursor = (base + span).min(MAX_UNICAST_LID as u32) as u16;
                    return Some(lid);
                }
                base += span;
            }
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct LidManager {
    /// Port GUID to (base LID, LMC), kept across sweeps.
    assigned: BTreeMap<Guid, (Lid, u8)>,
}

impl LidManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assignment recorded for a port GUID.
    pub fn assignment(&self, port_guid: Guid) -> Option<(Lid, u8)> {
        self.assigned.get(&port_guid).copied()
    }

    fn wants(fabric: &FabricState, config: &SmConfig) -> Vec<Want> {
        fabric
            .topology
            .iter()
            .flat_map(|(_, node)| {
                let lmc = if node.is_switch() && !config.lmc_esp0 {
                    0
                } else {
                    config.lmc
                };
                let guid = node.guid;
                node.addressable_ports()
                    .map(move |p| Want {
                        node: guid,
                        port: p.num,
                        port_guid: p.guid,
                        current: (p.base_lid, p.lmc),
                        lmc,
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Decide every port's address, updating the persistent map.
    fn plan(&mut self, fabric: &FabricState, config: &SmConfig) -> SweepResult<Vec<(Want, Lid)>> {
        let wants = Self::wants(fabric, config);
        let present: HashSet<Guid> = wants.iter().map(|w| w.port_guid).collect();

        let mut space = LidSpace::new();
        for (guid, (lid, lmc)) in &self.assigned {
            if !present.contains(guid) {
                space.claim(*lid, *lmc);
            }
        }

        let mut chosen: HashMap<Guid, Lid> = HashMap::new();

        for w in &wants {
            if let Some((lid, lmc)) = self.assigned.get(&w.port_guid) {
                if *lmc == w.lmc && space.fits(*lid, w.lmc) {
                    space.claim(*lid, w.lmc);
                    chosen.insert(w.port_guid, *lid);
                }
            }
        }

        for w in &wants {
            let base = w.current.0;
            if !chosen.contains_key(&w.port_guid) && space.fits(base, w.lmc) {
                space.claim(base, w.lmc);
                chosen.insert(w.port_guid, base);
            }
        }

        let mut out = Vec::with_capacity(wants.len());
        for w in wants {
            let lid = match chosen.get(&w.port_guid) {
                Some(lid) => *lid,
                None => space.allocate(w.lmc).ok_or(SweepError::LidExhausted {
                    port_guid: w.port_guid,
                    span: 1u16 << w.lmc,
                })?,
            };
            self.assigned.insert(w.port_guid, (lid, w.lmc));
            out.push((w, lid));
        }
        Ok(out)
    }

    fn rebuild(fabric: &mut FabricState) {
        let conflicts = fabric.topology.rebuild_lid_table();
        if !conflicts.is_empty() {
            warn!(
                count = conflicts.len(),
                first = %conflicts[0],
                "LIDs claimed by more than one port"
            );
        }
    }
}

impl PhaseManager for LidManager {
    fn phase(&self) -> SweepPhase {
        SweepPhase::Address
    }

    fn run(&mut self, env: &mut PhaseEnv<'_>) -> SweepResult<PhaseOutcome> {
        let plan = self.plan(env.fabric, env.config)?;

        let mut issued = 0;
        for (want, lid) in plan {
            if want.current == (lid, want.lmc) {
                continue;
            }
            debug!(node = %want.node, port = want.port, lid = %lid, lmc = want.lmc, "assigning LID");
            let request = MadRequest::SetPortLid {
                node: want.node,
                port: want.port,
                lid,
                lmc: want.lmc,
            };
            if env.issue(request) {
                issued += 1;
            }
        }

        if issued == 0 {
            Self::rebuild(env.fabric);
        }
        Ok(PhaseOutcome::from_issued(issued))
    }

    fn on_drained(&mut self, env: &mut PhaseEnv<'_>) -> SweepResult<()> {
        Self::rebuild(env.fabric);
        env.fabric.generation += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sm_01_routing::testing::TopologyBuilder;

    #[test]
    fn test_allocation_is_aligned() {
        let mut space = LidSpace::new();
        assert_eq!(space.allocate(0), Some(Lid(1)));
        assert_eq!(space.allocate(2), Some(Lid(4)));
        assert_eq!(space.allocate(0), Some(Lid(8)));
        assert!(!space.fits(Lid(5), 0));
        assert!(!space.fits(Lid(6), 1));
        assert!(space.fits(Lid(2), 0));
    }

    #[test]
    fn test_allocation_wraps_to_free_low_ranges() {
        let mut space = LidSpace::new();
        space.cursor = MAX_UNICAST_LID;
        space.claim(Lid(MAX_UNICAST_LID), 0);
        assert_eq!(space.allocate(0), Some(Lid(1)));
    }

    #[test]
    fn test_plan_keeps_valid_configured_lids() {
        let mut b = TopologyBuilder::new();
        let sw = b.switch(0x100, 4);
        let a = b.endpoint(0x1000, 1);
        let c = b.endpoint(0x1001, 1);
        b.link(a, 1, sw, 1).link(c, 1, sw, 2);
        b.lid(a, 1, 20, 0).lid(c, 1, 20, 0);
        let fabric = b.build();

        let mut lids = LidManager::new();
        let plan = lids.plan(&fabric, &SmConfig::for_testing()).unwrap();
        let by_node: HashMap<Guid, Lid> = plan.iter().map(|(w, l)| (w.node, *l)).collect();

        // first claimant keeps 20, the duplicate and the unset switch move
        assert_eq!(by_node[&Guid(0x1000)], Lid(20));
        assert_ne!(by_node[&Guid(0x1001)], Lid(20));
        assert!(by_node[&Guid(0x100)].is_unicast());
    }

    #[test]
    fn test_assignment_persists_across_absence() {
        let mut b = TopologyBuilder::new();
        let a = b.endpoint(0x1000, 1);
        b.endpoint(0x1001, 1);
        let fabric = b.build();
        let port_guid = fabric.topology.node(a).unwrap().ports[1].guid;

        let mut lids = LidManager::new();
        lids.plan(&fabric, &SmConfig::for_testing()).unwrap();
        let first = lids.assignment(port_guid).unwrap();

        // node 0x1000 vanishes; a newcomer must not take its range
        let mut b = TopologyBuilder::new();
        b.endpoint(0x1001, 1);
        b.endpoint(0x2000, 1);
        let without = b.build();
        let plan = lids.plan(&without, &SmConfig::for_testing()).unwrap();
        assert!(plan.iter().all(|(_, lid)| *lid != first.0));

        lids.plan(&fabric, &SmConfig::for_testing()).unwrap();
        assert_eq!(lids.assignment(port_guid), Some(first));
    }

    #[test]
    fn test_switch_port0_lmc_follows_esp0() {
        let mut b = TopologyBuilder::new();
        b.switch(0x100, 2);
        b.endpoint(0x1000, 1);
        let fabric = b.build();

        let mut config = SmConfig::for_testing();
        config.lmc = 2;
        let plan = LidManager::new().plan(&fabric, &config).unwrap();
        let lmcs: HashMap<Guid, u8> = plan.iter().map(|(w, _)| (w.node, w.lmc)).collect();
        assert_eq!(lmcs[&Guid(0x100)], 0);
        assert_eq!(lmcs[&Guid(0x1000)], 2);

        config.lmc_esp0 = true;
        let plan = LidManager::new().plan(&fabric, &config).unwrap();
        assert!(plan.iter().all(|(w, lid)| w.lmc == 2 && lid.raw() % 4 == 0));
    }
}
