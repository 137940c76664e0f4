//! # Fabric Description File
//!
//! TOML description of a simulated fabric: nodes, cables, peer subnet
//! managers and multicast groups to join once the engine is up.
//!
//! ```toml
//! [[switch]]
//! guid = 0x100
//! ports = 4
//!
//! [[endpoint]]
//! guid = 0x1000
//! ports = 1
//! system = 0x1000       # optional
//!
//! [[link]]
//! a = [0x1000, 1]
//! b = [0x100, 1]
//! state = "init"        # optional, default "active"
//!
//! [[peer]]
//! guid = 0x3
//! priority = 2
//! role = "standby"
//!
//! [[group]]
//! mlid = 0xC001
//! members = [[0x1000, 1]]
//! ```

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use fabric_types::{Guid, JoinState, LinkState, Lid, PortNum, SmRole, SwitchCapability};
use serde::Deserialize;
use sm_02_sweep::{PeerInfo, SimulatedFabric, SmHandle, SubnetManagerApi};
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FabricFile {
    #[serde(rename = "switch")]
    pub switches: Vec<SwitchSpec>,
    #[serde(rename = "endpoint")]
    pub endpoints: Vec<EndpointSpec>,
    #[serde(rename = "link")]
    pub links: Vec<LinkSpec>,
    #[serde(rename = "peer")]
    pub peers: Vec<PeerSpec>,
    #[serde(rename = "group")]
    pub groups: Vec<GroupSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchSpec {
    pub guid: u64,
    pub ports: PortNum,
    pub system: Option<u64>,
    pub capability: Option<SwitchCapability>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointSpec {
    pub guid: u64,
    #[serde(default = "one")]
    pub ports: PortNum,
    pub system: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkSpec {
    pub a: (u64, PortNum),
    pub b: (u64, PortNum),
    #[serde(default = "active")]
    pub state: LinkState,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerSpec {
    pub guid: u64,
    pub priority: u8,
    #[serde(default)]
    pub role: SmRole,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupSpec {
    pub mlid: u16,
    #[serde(default)]
    pub mgid: [u8; 16],
    pub members: Vec<(u64, PortNum)>,
}

fn one() -> PortNum {
    1
}

fn active() -> LinkState {
    LinkState::Active
}

impl FabricFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read fabric file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid fabric file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: Self = toml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    /// Check that cables and group members name declared ports, and that no
    /// port is cabled twice.
    pub fn validate(&self) -> Result<()> {
        let mut ports: HashMap<u64, (PortNum, PortNum)> = HashMap::new();
        for sw in &self.switches {
            if ports.insert(sw.guid, (0, sw.ports)).is_some() {
                bail!("node {:#x} declared twice", sw.guid);
            }
        }
        for ep in &self.endpoints {
            if ports.insert(ep.guid, (1, ep.ports)).is_some() {
                bail!("node {:#x} declared twice", ep.guid);
            }
        }
        let check = |(guid, port): (u64, PortNum)| -> Result<()> {
            match ports.get(&guid) {
                Some((lo, hi)) if (*lo..=*hi).contains(&port) => Ok(()),
                Some(_) => bail!("node {:#x} has no port {}", guid, port),
                None => bail!("unknown node {:#x}", guid),
            }
        };

        let mut cabled = HashSet::new();
        for link in &self.links {
            check(link.a)?;
            check(link.b)?;
            for end in [link.a, link.b] {
                if end.1 == 0 {
                    bail!("port 0 of {:#x} cannot be cabled", end.0);
                }
                if !cabled.insert(end) {
                    bail!("port {} of {:#x} cabled twice", end.1, end.0);
                }
            }
        }
        for group in &self.groups {
            if !Lid(group.mlid).is_multicast() {
                bail!("group {:#x} is not a multicast lid", group.mlid);
            }
            for member in &group.members {
                check(*member)?;
            }
        }
        Ok(())
    }

    /// Build the described nodes, cables and peers into `sim`.
    pub fn populate(&self, sim: &SimulatedFabric) {
        for sw in &self.switches {
            match sw.capability {
                Some(cap) => sim.add_switch_with(sw.guid, sw.ports, cap),
                None => sim.add_switch(sw.guid, sw.ports),
            };
            if let Some(system) = sw.system {
                sim.set_system(sw.guid, system);
            }
        }
        for ep in &self.endpoints {
            sim.add_endpoint(ep.guid, ep.ports);
            if let Some(system) = ep.system {
                sim.set_system(ep.guid, system);
            }
        }
        for link in &self.links {
            sim.connect_in_state(link.a.0, link.a.1, link.b.0, link.b.1, link.state);
        }
        for peer in &self.peers {
            sim.add_peer(PeerInfo::new(Guid(peer.guid), peer.priority, peer.role));
        }
        info!(
            switches = self.switches.len(),
            endpoints = self.endpoints.len(),
            links = self.links.len(),
            peers = self.peers.len(),
            "fabric model loaded"
        );
    }

    /// Join every described group member through the running engine.
    pub async fn join_groups(&self, sm: &SmHandle) -> Result<usize> {
        let mut joined = 0;
        for group in &self.groups {
            for (node, port) in &group.members {
                let added = sm
                    .join_group(
                        Lid(group.mlid),
                        group.mgid,
                        Guid(*node),
                        *port,
                        JoinState::FullMember,
                    )
                    .await
                    .with_context(|| format!("join {:#x} to group {:#x}", node, group.mlid))?;
                joined += usize::from(added);
            }
        }
        Ok(joined)
    }
}
