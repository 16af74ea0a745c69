//! Topology reconciler (component E): diff two topology snapshots into
//! added/removed/modified machine sets, and rebuild subnet cursors.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::subnet::SubnetCursor;
use crate::topology::{Machine, Topology};

#[derive(Debug, Default)]
pub struct MachineDiff {
    pub added: Vec<Machine>,
    pub removed: Vec<String>,
    pub modified: Vec<Machine>,
}

/// Diff `old` against `new` by hostname. A machine present in both but with
/// different owner/tags/location/IPMI fields is "modified"; this never
/// reorders VM ownership, only the machine-level metadata.
pub fn diff_topology(old: &Topology, new: &Topology) -> MachineDiff {
    let old_by_host: HashMap<&str, &Machine> =
        old.machines().map(|m| (m.hostname.as_str(), m)).collect();
    let new_by_host: HashMap<&str, &Machine> =
        new.machines().map(|m| (m.hostname.as_str(), m)).collect();

    let mut diff = MachineDiff::default();

    for (hostname, machine) in &new_by_host {
        match old_by_host.get(hostname) {
            None => diff.added.push((*machine).clone()),
            Some(old_machine) => {
                if old_machine != machine {
                    diff.modified.push((*machine).clone());
                }
            }
        }
    }

    for hostname in old_by_host.keys() {
        if !new_by_host.contains_key(hostname) {
            diff.removed.push(hostname.to_string());
        }
    }

    diff
}

/// Rebuild the `subnets` map from a new topology: cursors for surviving
/// gateways retain their `next_ip`; new gateways start at `start_ip`;
/// retired gateways are dropped.
pub fn rebuild_subnets(
    existing: &HashMap<Ipv4Addr, SubnetCursor>,
    topology: &Topology,
) -> HashMap<Ipv4Addr, SubnetCursor> {
    let mut rebuilt = HashMap::new();
    for subnet in topology.subnets() {
        let cursor = match existing.get(&subnet.gateway_ip) {
            Some(old) => old.carry_over(subnet),
            None => SubnetCursor::from_subnet(subnet),
        };
        rebuilt.insert(subnet.gateway_ip, cursor);
    }
    rebuilt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{LocationNode, Subnet};
    use std::collections::{BTreeMap, BTreeSet};

    fn machine(hostname: &str, location: &str) -> Machine {
        Machine {
            hostname: hostname.to_string(),
            primary_ip: "10.0.0.1".parse().unwrap(),
            ipmi_ip: None,
            owner_users: BTreeSet::new(),
            tags: BTreeMap::new(),
            location: location.to_string(),
        }
    }

    fn topology_with(machines: Vec<Machine>) -> Topology {
        let mut t = Topology::empty();
        for m in machines {
            t.locations.entry(m.location.clone()).or_insert_with(LocationNode::default).machines.push(m);
        }
        t
    }

    #[test]
    fn empty_to_empty_is_idempotent() {
        let t1 = Topology::empty();
        let t2 = Topology::empty();
        let diff = diff_topology(&t1, &t2);
        assert!(diff.added.is_empty() && diff.removed.is_empty() && diff.modified.is_empty());
    }

    #[test]
    fn identical_topology_twice_produces_empty_diff() {
        let t = topology_with(vec![machine("h1", "dc1/r1")]);
        let diff = diff_topology(&t, &t);
        assert!(diff.added.is_empty() && diff.removed.is_empty() && diff.modified.is_empty());
    }

    #[test]
    fn detects_added_and_removed() {
        let old = topology_with(vec![machine("h1", "dc1/r1")]);
        let new = topology_with(vec![machine("h2", "dc1/r1")]);
        let diff = diff_topology(&old, &new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].hostname, "h2");
        assert_eq!(diff.removed, vec!["h1".to_string()]);
    }

    #[test]
    fn detects_modified_owner_set() {
        let mut m2 = machine("h1", "dc1/r1");
        m2.owner_users.insert("alice".to_string());
        let old = topology_with(vec![machine("h1", "dc1/r1")]);
        let new = topology_with(vec![m2]);
        let diff = diff_topology(&old, &new);
        assert_eq!(diff.modified.len(), 1);
        assert!(diff.added.is_empty() && diff.removed.is_empty());
    }

    #[test]
    fn surviving_subnet_retains_next_ip() {
        let subnet = Subnet {
            gateway_ip: "10.0.0.1".parse().unwrap(),
            cidr: 24,
            start_ip: "10.0.0.1".parse().unwrap(),
            stop_ip: "10.0.0.254".parse().unwrap(),
            reserved_ips: BTreeSet::new(),
        };
        let mut existing = HashMap::new();
        let mut cursor = SubnetCursor::from_subnet(&subnet);
        cursor.next_ip = "10.0.0.50".parse().unwrap();
        existing.insert(subnet.gateway_ip, cursor);

        let mut t = Topology::empty();
        t.locations.entry("dc1".to_string()).or_default().subnets.push(subnet.clone());

        let rebuilt = rebuild_subnets(&existing, &t);
        assert_eq!(rebuilt[&subnet.gateway_ip].next_ip, "10.0.0.50".parse::<Ipv4Addr>().unwrap());
    }
}
