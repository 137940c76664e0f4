//! Property-based tests for hop matrices, unicast forwarding and multicast trees

use fabric_types::{JoinState, Lid, PortNum, NO_PATH};
use proptest::prelude::*;
use sm_01_routing::testing::TopologyBuilder;
use sm_01_routing::{
    FabricState, ForwardingTable, MinHopEngine, NodeHandle, PortRef, RoutingEngine,
    RoutingOptions, HOP_NO_PATH,
};

const PORTS: PortNum = 16;

/// Connected switch fabric: a random spanning tree plus extra links, with
/// endpoints hung off the switches.
#[derive(Debug, Clone)]
struct FabricShape {
    parents: Vec<usize>,
    extra: Vec<(usize, usize)>,
    endpoints: Vec<u8>,
}

prop_compose! {
    fn arb_fabric()(n in 2usize..8)(
        parents in (1..n).map(|i| 0..i).collect::<Vec<_>>(),
        extra in prop::collection::vec((0..n, 0..n), 0..6),
        endpoints in prop::collection::vec(0u8..3, n),
    ) -> FabricShape {
        FabricShape { parents, extra, endpoints }
    }
}

fn build(shape: &FabricShape, options: RoutingOptions) -> (FabricState, Vec<NodeHandle>) {
    let mut b = TopologyBuilder::new();
    let n = shape.endpoints.len();
    let switches: Vec<NodeHandle> = (0..n).map(|i| b.switch(0x100 + i as u64, PORTS)).collect();
    let mut next_port = vec![1 as PortNum; n];

    let mut connect = |b: &mut TopologyBuilder, x: usize, y: usize| {
        if x == y || next_port[x] > PORTS || next_port[y] > PORTS {
            return;
        }
        b.link(switches[x], next_port[x], switches[y], next_port[y]);
        next_port[x] += 1;
        next_port[y] += 1;
    };

    for (child, parent) in shape.parents.iter().enumerate() {
        connect(&mut b, child + 1, *parent);
    }
    for (x, y) in &shape.extra {
        connect(&mut b, *x, *y);
    }

    let mut guid = 0x1000u64;
    for (i, count) in shape.endpoints.iter().enumerate() {
        for _ in 0..*count {
            if next_port[i] > PORTS {
                break;
            }
            let ep = b.endpoint(guid, 1);
            guid += 1;
            b.link(ep, 1, switches[i], next_port[i]);
            next_port[i] += 1;
        }
    }

    b.auto_lids(0);
    let mut fabric = b.build();
    let engine = MinHopEngine::new(options);
    engine.build_hop_matrices(&mut fabric).unwrap();
    let plan = engine.build_forwarding_tables(&mut fabric).unwrap();
    for u in &plan.updates {
        fabric.commit_unicast_block(u.switch, u.block, &u.contents).unwrap();
    }
    (fabric, switches)
}

proptest! {
    #[test]
    fn hop_matrix_matches_neighbor_relaxation(shape in arb_fabric()) {
        let (fabric, switches) = build(&shape, RoutingOptions::default());
        let topo = &fabric.topology;

        for &s in &switches {
            let node = topo.node(s).unwrap();
            let sw = topo.switch(s).unwrap();
            for raw in 1..=topo.max_lid() {
                let lid = Lid(raw);
                let owner = topo.owner_of(lid).unwrap();
                let least = sw.hops().least_hops(lid);

                prop_assert_eq!(least == 0, owner == PortRef::new(s, 0));
                if least == 0 {
                    continue;
                }

                let mut expected = HOP_NO_PATH;
                for port in node.ports.iter().skip(1).filter(|p| p.is_linked()) {
                    let remote = port.remote.unwrap();
                    let via = if topo.node(remote.node).unwrap().is_switch() {
                        topo.switch(remote.node).unwrap().hops().least_hops(lid).saturating_add(1)
                    } else if remote == owner {
                        1
                    } else {
                        HOP_NO_PATH
                    };
                    expected = expected.min(via);
                }
                prop_assert_eq!(least, expected);
            }
        }
    }

    #[test]
    fn forwarding_is_min_hop_and_loop_free(shape in arb_fabric(), ignore in any::<bool>()) {
        let options = RoutingOptions { ignore_existing: ignore, lmc_tracking: false };
        let (fabric, switches) = build(&shape, options);
        let topo = &fabric.topology;

        for &start in &switches {
            for raw in 1..=topo.max_lid() {
                let lid = Lid(raw);
                let owner = topo.owner_of(lid).unwrap();
                let mut at = start;
                let mut steps = 0;

                loop {
                    let sw = topo.switch(at).unwrap();
                    let port = sw.live().get(lid);
                    prop_assert_ne!(port, NO_PATH);
                    if port == 0 {
                        prop_assert_eq!(owner, PortRef::new(at, 0));
                        break;
                    }
                    prop_assert_eq!(sw.hops().hops(lid, port), sw.hops().least_hops(lid));

                    let remote = topo.remote(PortRef::new(at, port)).unwrap();
                    if !topo.node(remote.node).unwrap().is_switch() {
                        prop_assert_eq!(remote, owner);
                        break;
                    }
                    at = remote.node;
                    steps += 1;
                    prop_assert!(steps <= switches.len());
                }
            }
        }
    }

    #[test]
    fn rebuild_on_static_fabric_changes_nothing(shape in arb_fabric()) {
        let (mut fabric, switches) = build(&shape, RoutingOptions::default());
        let before: Vec<_> = switches
            .iter()
            .map(|s| fabric.topology.switch(*s).unwrap().hops().clone())
            .collect();

        let engine = MinHopEngine::new(RoutingOptions::default());
        let stats = engine.build_hop_matrices(&mut fabric).unwrap();
        let plan = engine.build_forwarding_tables(&mut fabric).unwrap();

        let after: Vec<_> = switches
            .iter()
            .map(|s| fabric.topology.switch(*s).unwrap().hops().clone())
            .collect();
        prop_assert_eq!(before, after);
        prop_assert_eq!(stats.changed_switches, 0);
        prop_assert!(plan.updates.is_empty());
    }

    #[test]
    fn multicast_tree_spans_members_and_is_stable(shape in arb_fabric(), ignore in any::<bool>()) {
        let options = RoutingOptions { ignore_existing: ignore, lmc_tracking: false };
        let (mut fabric, _) = build(&shape, options);
        let mlid = Lid(0xC000);
        let members: Vec<_> = fabric
            .topology
            .iter()
            .filter(|(_, n)| !n.is_switch())
            .map(|(_, n)| n.guid)
            .collect();
        prop_assume!(!members.is_empty());
        for guid in &members {
            fabric.join_group(mlid, [0; 16], *guid, 1, JoinState::FullMember).unwrap();
        }

        let engine = MinHopEngine::new(options);
        let plan = engine.build_multicast_trees(&mut fabric).unwrap();
        prop_assert!(plan.failed_groups.is_empty());
        for u in &plan.updates {
            fabric.commit_multicast_block(u.switch, u.block, u.position, &u.masks).unwrap();
        }
        let tree = fabric.groups[&mlid].tree.clone();
        prop_assert!(fabric.groups[&mlid].staged_tree.is_none());
        prop_assert_eq!(tree.edge_count() + 1, tree.switches.len());

        let engine = MinHopEngine::new(RoutingOptions::default());
        let again = engine.build_multicast_trees(&mut fabric).unwrap();
        prop_assert!(again.failed_groups.is_empty());
        prop_assert!(again.updates.is_empty());
        prop_assert_eq!(&fabric.groups[&mlid].tree, &tree);
    }
}
