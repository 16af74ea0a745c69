//! Subnet allocator (component A): a per-gateway cursor handing out unused
//! addresses in round-robin order.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::{FleetError, Result};
use crate::topology::Subnet;

#[derive(Debug, Clone)]
pub struct SubnetCursor {
    pub gateway_ip: Ipv4Addr,
    pub start_ip: Ipv4Addr,
    pub stop_ip: Ipv4Addr,
    pub next_ip: Ipv4Addr,
    pub reserved_ips: BTreeSet<Ipv4Addr>,
}

impl SubnetCursor {
    /// A fresh cursor for a subnet never seen before: `next_ip` starts at
    /// `start_ip`.
    pub fn from_subnet(subnet: &Subnet) -> Self {
        SubnetCursor {
            gateway_ip: subnet.gateway_ip,
            start_ip: subnet.start_ip,
            stop_ip: subnet.stop_ip,
            next_ip: subnet.start_ip,
            reserved_ips: subnet.reserved_ips.clone(),
        }
    }

    /// A cursor that survives a topology update: range and reservations
    /// refreshed from the new subnet, `next_ip` carried over from `self` if
    /// it still falls in range.
    pub fn carry_over(&self, subnet: &Subnet) -> Self {
        let next_ip = if ip_in_range(self.next_ip, subnet.start_ip, subnet.stop_ip) {
            self.next_ip
        } else {
            subnet.start_ip
        };
        SubnetCursor {
            gateway_ip: subnet.gateway_ip,
            start_ip: subnet.start_ip,
            stop_ip: subnet.stop_ip,
            next_ip,
            reserved_ips: subnet.reserved_ips.clone(),
        }
    }

    fn advance(ip: Ipv4Addr, start: Ipv4Addr, stop: Ipv4Addr) -> Ipv4Addr {
        let next = u32::from(ip).wrapping_add(1);
        if next > u32::from(stop) {
            start
        } else {
            Ipv4Addr::from(next)
        }
    }
}

fn ip_in_range(ip: Ipv4Addr, start: Ipv4Addr, stop: Ipv4Addr) -> bool {
    u32::from(ip) >= u32::from(start) && u32::from(ip) <= u32::from(stop)
}

/// A candidate IP is skipped if it's the gateway, reserved, or already
/// claimed by any of the three caller-supplied "taken" predicates. `storer`
/// exclusion is checked by the caller (component A step (d)), since it's
/// async and this function stays synchronous.
pub fn find_free_ip(
    cursor: &mut SubnetCursor,
    is_taken: impl Fn(Ipv4Addr) -> bool,
) -> Result<Ipv4Addr> {
    let mut candidate = cursor.next_ip;
    let mut steps = 0u64;
    let span = u64::from(u32::from(cursor.stop_ip)) - u64::from(u32::from(cursor.start_ip)) + 1;

    loop {
        if steps > span {
            return Err(FleetError::NoFreeAddresses(cursor.gateway_ip));
        }
        steps += 1;

        let skip =
            candidate == cursor.gateway_ip || cursor.reserved_ips.contains(&candidate) || is_taken(candidate);

        let advanced = SubnetCursor::advance(candidate, cursor.start_ip, cursor.stop_ip);

        if !skip {
            cursor.next_ip = advanced;
            return Ok(candidate);
        }
        candidate = advanced;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn cursor(start: &str, stop: &str, gateway: &str) -> SubnetCursor {
        SubnetCursor {
            gateway_ip: gateway.parse().unwrap(),
            start_ip: start.parse().unwrap(),
            stop_ip: stop.parse().unwrap(),
            next_ip: start.parse().unwrap(),
            reserved_ips: BTreeSet::new(),
        }
    }

    #[test]
    fn finds_first_free_and_advances() {
        let mut c = cursor("10.0.0.1", "10.0.0.4", "10.0.0.1");
        let ip = find_free_ip(&mut c, |_| false).unwrap();
        assert_eq!(ip, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(c.next_ip, "10.0.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn wraps_around_and_fails_when_full() {
        let mut c = cursor("10.0.0.1", "10.0.0.2", "10.0.0.1");
        let err = find_free_ip(&mut c, |_| true).unwrap_err();
        assert!(matches!(err, FleetError::NoFreeAddresses(_)));
    }

    #[test]
    fn round_trip_allocation_restores_cursor_position() {
        let mut c = cursor("10.0.0.1", "10.0.0.10", "10.0.0.1");
        let before = c.next_ip;
        let ip = find_free_ip(&mut c, |_| false).unwrap();
        // releasing just means "stop treating it as taken"; a fresh cursor
        // at the same start position finds the same candidate.
        let mut c2 = cursor("10.0.0.1", "10.0.0.10", "10.0.0.1");
        c2.next_ip = before;
        let ip2 = find_free_ip(&mut c2, |_| false).unwrap();
        assert_eq!(ip, ip2);
    }
}
