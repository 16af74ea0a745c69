//! The topology tree: locations, subnets and machines.
//!
//! A `Topology` value is always a complete replacement for the previous one;
//! [`crate::reconciler`] computes the diff between two values rather than
//! mutating one in place.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

/// A location path, e.g. `dc1/rack3`. The empty string is the root, matching
/// every location.
pub type Location = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub gateway_ip: Ipv4Addr,
    pub cidr: u8,
    pub start_ip: Ipv4Addr,
    pub stop_ip: Ipv4Addr,
    pub reserved_ips: BTreeSet<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub hostname: String,
    pub primary_ip: Ipv4Addr,
    pub ipmi_ip: Option<Ipv4Addr>,
    pub owner_users: BTreeSet<String>,
    pub tags: BTreeMap<String, String>,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocationNode {
    pub subnets: Vec<Subnet>,
    pub machines: Vec<Machine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Topology {
    pub locations: BTreeMap<Location, LocationNode>,
}

impl Topology {
    pub fn empty() -> Self {
        Topology::default()
    }

    /// All machines across all locations, in deterministic order.
    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.locations.values().flat_map(|node| node.machines.iter())
    }

    pub fn machine_by_hostname(&self, hostname: &str) -> Option<&Machine> {
        self.machines().find(|m| m.hostname == hostname)
    }

    /// All subnets across all locations, in deterministic order.
    pub fn subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.locations.values().flat_map(|node| node.subnets.iter())
    }

    /// Every location path present in the tree, including ones with no
    /// machines of their own (an ancestor referenced only by a deeper leaf).
    pub fn location_paths(&self) -> BTreeSet<Location> {
        let mut paths = BTreeSet::new();
        for loc in self.locations.keys() {
            paths.insert(loc.clone());
            for ancestor in location_ancestors(loc) {
                paths.insert(ancestor);
            }
        }
        paths
    }
}

/// True if `candidate` is `prefix` or a descendant of it at a slash
/// boundary: `dc1` matches `dc1/rack3` but not `dc10/rack3`.
pub fn location_matches_prefix(candidate: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    candidate == prefix || candidate.starts_with(&format!("{prefix}/"))
}

/// All proper ancestors of `location`, root (`""`) last, not including
/// `location` itself.
pub fn location_ancestors(location: &str) -> Vec<Location> {
    let mut ancestors = Vec::new();
    let mut rest = location;
    while let Some(idx) = rest.rfind('/') {
        rest = &rest[..idx];
        ancestors.push(rest.to_string());
    }
    if !location.is_empty() {
        ancestors.push(String::new());
    }
    ancestors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matches_slash_boundary_only() {
        assert!(location_matches_prefix("dc1/rack3", "dc1"));
        assert!(!location_matches_prefix("dc10/rack3", "dc1"));
        assert!(location_matches_prefix("dc1", "dc1"));
        assert!(location_matches_prefix("anything", ""));
    }

    #[test]
    fn ancestors_walk_to_root() {
        assert_eq!(
            location_ancestors("dc1/rack3/h1"),
            vec!["dc1/rack3".to_string(), "dc1".to_string(), String::new()]
        );
        assert_eq!(location_ancestors("dc1"), vec![String::new()]);
        assert_eq!(location_ancestors(""), Vec::<String>::new());
    }
}
