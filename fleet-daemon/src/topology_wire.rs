//! Marshalling between the wire `Topology` message and the domain
//! `fleet_manager::Topology` (§6: argument marshalling lives in the daemon
//! crate, never in the core engine).

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::str::FromStr;

use fleet_manager::{LocationNode, Machine, Subnet, Topology};

pub fn topology_to_wire(topology: &Topology) -> fleet_proto::v1::Topology {
    let mut machines = Vec::new();
    let mut subnets = Vec::new();
    for (location, node) in &topology.locations {
        for machine in &node.machines {
            machines.push(fleet_proto::v1::Machine {
                hostname: machine.hostname.clone(),
                primary_ip: machine.primary_ip.to_string(),
                ipmi_ip: machine.ipmi_ip.map(|ip| ip.to_string()),
                owner_users: machine.owner_users.iter().cloned().collect(),
                tags: machine.tags.clone().into_iter().collect(),
                location: location.clone(),
            });
        }
        for subnet in &node.subnets {
            subnets.push(fleet_proto::v1::Subnet {
                gateway_ip: subnet.gateway_ip.to_string(),
                cidr: subnet.cidr as u32,
                start_ip: subnet.start_ip.to_string(),
                stop_ip: subnet.stop_ip.to_string(),
                reserved_ips: subnet.reserved_ips.iter().map(Ipv4Addr::to_string).collect(),
                location: location.clone(),
            });
        }
    }
    fleet_proto::v1::Topology { machines, subnets }
}

pub fn wire_to_topology(wire: fleet_proto::v1::Topology) -> Result<Topology, String> {
    let mut locations: BTreeMap<String, LocationNode> = BTreeMap::new();

    for subnet in wire.subnets {
        let gateway_ip = parse_ip(&subnet.gateway_ip)?;
        let reserved_ips: Result<BTreeSet<Ipv4Addr>, String> =
            subnet.reserved_ips.iter().map(|s| parse_ip(s)).collect();
        let domain_subnet = Subnet {
            gateway_ip,
            cidr: subnet.cidr as u8,
            start_ip: parse_ip(&subnet.start_ip)?,
            stop_ip: parse_ip(&subnet.stop_ip)?,
            reserved_ips: reserved_ips?,
        };
        locations
            .entry(subnet.location.clone())
            .or_default()
            .subnets
            .push(domain_subnet);
    }

    for machine in wire.machines {
        let domain_machine = Machine {
            hostname: machine.hostname,
            primary_ip: parse_ip(&machine.primary_ip)?,
            ipmi_ip: machine.ipmi_ip.as_deref().map(parse_ip).transpose()?,
            owner_users: machine.owner_users.into_iter().collect(),
            tags: machine.tags.into_iter().collect(),
            location: machine.location.clone(),
        };
        locations.entry(machine.location).or_default().machines.push(domain_machine);
    }

    Ok(Topology { locations })
}

fn parse_ip(raw: &str) -> Result<Ipv4Addr, String> {
    Ipv4Addr::from_str(raw).map_err(|_| format!("invalid ipv4 address: {raw}"))
}
