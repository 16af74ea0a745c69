//! Minimal YAML loader for the topology source file.
//!
//! The textual grammar of the topology file is explicitly outside the core
//! engine crate's scope; this loader is a pragmatic daemon-level
//! convenience so the binary has something to feed `update_topology` with
//! at startup and on SIGHUP. Production deployments are free to replace
//! this with a richer format without touching `fleet-manager`.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use fleet_manager::{LocationNode, Machine, Subnet, Topology};

#[derive(Debug, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    locations: BTreeMap<String, LocationFile>,
}

#[derive(Debug, Default, Deserialize)]
struct LocationFile {
    #[serde(default)]
    subnets: Vec<SubnetFile>,
    #[serde(default)]
    machines: Vec<MachineFile>,
}

#[derive(Debug, Deserialize)]
struct SubnetFile {
    gateway_ip: Ipv4Addr,
    cidr: u8,
    start_ip: Ipv4Addr,
    stop_ip: Ipv4Addr,
    #[serde(default)]
    reserved_ips: BTreeSet<Ipv4Addr>,
}

#[derive(Debug, Deserialize)]
struct MachineFile {
    hostname: String,
    primary_ip: Ipv4Addr,
    #[serde(default)]
    ipmi_ip: Option<Ipv4Addr>,
    #[serde(default)]
    owner_users: BTreeSet<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

/// Load and parse a topology YAML file into the domain `Topology` the core
/// engine consumes (§6: "the manager consumes an already-parsed `Topology`
/// value").
pub fn load<P: AsRef<Path>>(path: P) -> Result<Topology> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading topology file {}", path.display()))?;
    let parsed: TopologyFile =
        serde_yaml::from_str(&content).with_context(|| format!("parsing topology file {}", path.display()))?;

    let mut locations = BTreeMap::new();
    for (location, node) in parsed.locations {
        let subnets = node
            .subnets
            .into_iter()
            .map(|s| Subnet {
                gateway_ip: s.gateway_ip,
                cidr: s.cidr,
                start_ip: s.start_ip,
                stop_ip: s.stop_ip,
                reserved_ips: s.reserved_ips,
            })
            .collect();
        let machines = node
            .machines
            .into_iter()
            .map(|m| Machine {
                hostname: m.hostname,
                primary_ip: m.primary_ip,
                ipmi_ip: m.ipmi_ip,
                owner_users: m.owner_users,
                tags: m.tags,
                location: location.clone(),
            })
            .collect();
        locations.insert(location, LocationNode { subnets, machines });
    }

    Ok(Topology { locations })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_minimal_topology() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.yaml");
        std::fs::write(
            &path,
            r#"
locations:
  dc1/r1:
    subnets:
      - gateway_ip: 10.0.0.1
        cidr: 24
        start_ip: 10.0.0.2
        stop_ip: 10.0.0.254
    machines:
      - hostname: h1
        primary_ip: 10.0.0.2
"#,
        )
        .unwrap();

        let topology = load(&path).unwrap();
        assert_eq!(topology.machines().count(), 1);
        assert_eq!(topology.subnets().count(), 1);
        let machine = topology.machine_by_hostname("h1").unwrap();
        assert_eq!(machine.location, "dc1/r1");
    }
}
