//! # Routing Engines
//!
//! The sweep engine drives routing through `RoutingEngine`, one call per
//! concern. `MinHopEngine` is the default implementation; its
//! dimension-ordered variant only changes tie-breaking between equal ports.
//!
//! ```text
//! build_hop_matrices ──→ build_forwarding_tables ──→ build_multicast_trees
//!        │                        │                          │
//!     HopStats               UnicastPlan                MulticastPlan
//! ```

pub mod hops;
pub mod multicast;
pub mod synthesizer;
pub mod unicast;

use std::fmt;
use std::str::FromStr;

use fabric_types::MadRequest;
use serde::{Deserialize, Serialize};

use crate::domain::{FabricState, RoutingError, RoutingResult};

pub use hops::{build_hop_matrices, HopStats};
pub use multicast::{build_multicast_tree, recommend_multicast_path};
pub use synthesizer::{
    synthesize_multicast, synthesize_unicast, MulticastBlockUpdate, MulticastPlan,
    SynthesisFlags, UnicastBlockUpdate, UnicastPlan,
};
pub use unicast::{recommend_path, PathOptions, PathTracking};

/// Options shared by every engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingOptions {
    /// Recompute every entry instead of keeping valid live ones.
    pub ignore_existing: bool,
    /// Spread the LIDs of multi-LID ports across distinct remote hardware.
    pub lmc_tracking: bool,
}

/// Pluggable routing engine.
pub trait RoutingEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn build_hop_matrices(&self, fabric: &mut FabricState) -> RoutingResult<HopStats>;

    fn build_forwarding_tables(&self, fabric: &mut FabricState) -> RoutingResult<UnicastPlan>;

    fn build_multicast_trees(&self, fabric: &mut FabricState) -> RoutingResult<MulticastPlan>;

    /// SL-to-VL programming; none by default.
    fn update_sl2vl(&self, _fabric: &FabricState) -> RoutingResult<Vec<MadRequest>> {
        Ok(Vec::new())
    }

    /// VL arbitration programming; none by default.
    fn update_vlarb(&self, _fabric: &FabricState) -> RoutingResult<Vec<MadRequest>> {
        Ok(Vec::new())
    }
}

/// Min-hop routing with least-loaded port selection.
#[derive(Debug, Clone)]
pub struct MinHopEngine {
    options: RoutingOptions,
    dimension_order: bool,
}

impl MinHopEngine {
    pub fn new(options: RoutingOptions) -> Self {
        Self {
            options,
            dimension_order: false,
        }
    }

    /// Dimension-ordered variant. Rejects LMC tracking, which would need a
    /// combined tie-break policy.
    pub fn dimension_ordered(options: RoutingOptions) -> RoutingResult<Self> {
        if options.lmc_tracking {
            return Err(RoutingError::InvalidParameter(
                "dimension-order routing cannot be combined with lmc tracking".into(),
            ));
        }
        Ok(Self {
            options,
            dimension_order: true,
        })
    }

    pub fn options(&self) -> RoutingOptions {
        self.options
    }

    fn path_options(&self) -> PathOptions {
        PathOptions {
            ignore_existing: self.options.ignore_existing,
            dimension_order: self.dimension_order,
        }
    }
}

impl RoutingEngine for MinHopEngine {
    fn name(&self) -> &'static str {
        if self.dimension_order {
            "dor"
        } else {
            "minhop"
        }
    }

    fn build_hop_matrices(&self, fabric: &mut FabricState) -> RoutingResult<HopStats> {
        build_hop_matrices(&mut fabric.topology)
    }

    fn build_forwarding_tables(&self, fabric: &mut FabricState) -> RoutingResult<UnicastPlan> {
        synthesize_unicast(
            &mut fabric.topology,
            self.path_options(),
            self.options.lmc_tracking,
        )
    }

    fn build_multicast_trees(&self, fabric: &mut FabricState) -> RoutingResult<MulticastPlan> {
        synthesize_multicast(fabric, self.options.ignore_existing)
    }
}

/// Engine selector used by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingEngineKind {
    #[default]
    MinHop,
    Dor,
}

impl fmt::Display for RoutingEngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinHop => write!(f, "minhop"),
            Self::Dor => write!(f, "dor"),
        }
    }
}

impl FromStr for RoutingEngineKind {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minhop" => Ok(Self::MinHop),
            "dor" => Ok(Self::Dor),
            other => Err(RoutingError::InvalidParameter(format!(
                "unknown routing engine '{}'",
                other
            ))),
        }
    }
}

/// Construct the engine for `kind`.
pub fn engine_for(
    kind: RoutingEngineKind,
    options: RoutingOptions,
) -> RoutingResult<Box<dyn RoutingEngine>> {
    Ok(match kind {
        RoutingEngineKind::MinHop => Box::new(MinHopEngine::new(options)),
        RoutingEngineKind::Dor => Box::new(MinHopEngine::dimension_ordered(options)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_parsing() {
        assert_eq!("minhop".parse::<RoutingEngineKind>().unwrap(), RoutingEngineKind::MinHop);
        assert_eq!("DOR".parse::<RoutingEngineKind>().unwrap(), RoutingEngineKind::Dor);
        assert!("ftree".parse::<RoutingEngineKind>().is_err());
    }

    #[test]
    fn test_dor_rejects_lmc_tracking() {
        let options = RoutingOptions {
            lmc_tracking: true,
            ..RoutingOptions::default()
        };
        assert!(engine_for(RoutingEngineKind::Dor, options).is_err());
        assert_eq!(engine_for(RoutingEngineKind::MinHop, options).unwrap().name(), "minhop");
    }

    #[test]
    fn test_qos_hooks_default_to_nothing() {
        let engine = MinHopEngine::new(RoutingOptions::default());
        let fabric = FabricState::new();
        assert!(engine.update_sl2vl(&fabric).unwrap().is_empty());
        assert!(engine.update_vlarb(&fabric).unwrap().is_empty());
    }
}
