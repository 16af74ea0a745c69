//! Process-wide registries (component C) and the state they index into.
//!
//! Everything in this module lives behind the façade's single
//! `tokio::sync::RwLock` ([`crate::manager::Manager`]), except the fields
//! inside [`HypervisorLocal`], which each hypervisor record shares with its
//! own probe worker through a private `Arc`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Notify, RwLock as AsyncRwLock};

use crate::error::{FleetError, Result};
use crate::notifier::Subscriber;
use crate::subnet::SubnetCursor;
use crate::topology::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeStatus {
    NotYetProbed,
    Connected,
    AccessDenied,
    NoRpc,
    NoService,
    ConnectionRefused,
    Unreachable,
    Off,
}

impl ProbeStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ProbeStatus::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::NotYetProbed => "not_yet_probed",
            ProbeStatus::Connected => "connected",
            ProbeStatus::AccessDenied => "access_denied",
            ProbeStatus::NoRpc => "no_rpc",
            ProbeStatus::NoService => "no_service",
            ProbeStatus::ConnectionRefused => "connection_refused",
            ProbeStatus::Unreachable => "unreachable",
            ProbeStatus::Off => "off",
        }
    }
}

/// Per-VM state, owned exclusively by the hypervisor record that currently
/// holds it. The back-reference to that record is a hostname key, never a
/// pointer, so a deleted hypervisor never leaves a dangling VmInfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub ip_addr: Ipv4Addr,
    pub owner_users: BTreeSet<String>,
    pub tags: BTreeMap<String, String>,
    pub secondary_ips: Vec<Ipv4Addr>,
    pub hypervisor_hostname: String,
}

/// Fields a probe worker updates without taking the façade write lock:
/// purely local, advisory state that readers tolerate seeing slightly stale.
#[derive(Debug, Clone, Default)]
pub struct HypervisorLocalFields {
    pub cached_serial_number: Option<String>,
    pub health_status: String,
    pub last_ipmi_probe: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct HypervisorLocal {
    pub inner: AsyncRwLock<HypervisorLocalFields>,
}

#[derive(Debug)]
pub struct HypervisorRecord {
    pub hostname: String,
    pub primary_ip: Ipv4Addr,
    pub location: String,
    pub ipmi_ip: Option<Ipv4Addr>,
    pub owner_users: BTreeSet<String>,
    pub tags: BTreeMap<String, String>,
    pub declared_subnets: Vec<Ipv4Addr>,
    pub probe_status: ProbeStatus,
    pub vms: HashMap<Ipv4Addr, VmInfo>,
    pub migrating_vms: HashMap<Ipv4Addr, VmInfo>,
    pub delete_scheduled: Arc<AtomicBool>,
    /// Wakes the probe worker promptly when `delete_scheduled` is set,
    /// rather than leaving it to discover the flag on its next timer tick.
    pub shutdown_notify: Arc<Notify>,
    pub local: Arc<HypervisorLocal>,
}

impl HypervisorRecord {
    pub fn new(hostname: String, primary_ip: Ipv4Addr, location: String) -> Self {
        HypervisorRecord {
            hostname,
            primary_ip,
            location,
            ipmi_ip: None,
            owner_users: BTreeSet::new(),
            tags: BTreeMap::new(),
            declared_subnets: Vec::new(),
            probe_status: ProbeStatus::NotYetProbed,
            vms: HashMap::new(),
            migrating_vms: HashMap::new(),
            delete_scheduled: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            local: Arc::new(HypervisorLocal::default()),
        }
    }

    pub fn schedule_delete(&self) {
        self.delete_scheduled.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
    }
}

/// Everything guarded by the façade's single `RwLock`.
pub struct ManagerState {
    pub hypervisors: HashMap<String, HypervisorRecord>,
    pub vms: HashMap<Ipv4Addr, String>,
    pub allocating_ips: HashSet<Ipv4Addr>,
    pub migrating_ips: HashSet<Ipv4Addr>,
    pub subnets: HashMap<Ipv4Addr, SubnetCursor>,
    pub topology: Arc<Topology>,
    pub locations: HashMap<String, Vec<u64>>,
    pub subscribers: HashMap<u64, Subscriber>,
    pub next_subscription_id: u64,
    pub worker_handles: HashMap<String, tokio::task::JoinHandle<()>>,
}

impl ManagerState {
    pub fn new() -> Self {
        ManagerState {
            hypervisors: HashMap::new(),
            vms: HashMap::new(),
            allocating_ips: HashSet::new(),
            migrating_ips: HashSet::new(),
            subnets: HashMap::new(),
            topology: Arc::new(Topology::empty()),
            locations: HashMap::new(),
            subscribers: HashMap::new(),
            next_subscription_id: 1,
            worker_handles: HashMap::new(),
        }
    }

    pub fn next_subscriber_id(&mut self) -> u64 {
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        id
    }

    /// Insert a VM into `hostname`'s record and the global index.
    /// Fails with `DuplicateIp` if the global map already has this IP.
    pub fn insert_vm(&mut self, hostname: &str, vm: VmInfo) -> Result<()> {
        if self.vms.contains_key(&vm.ip_addr) {
            return Err(FleetError::DuplicateIp(vm.ip_addr));
        }
        let ip = vm.ip_addr;
        let record = self
            .hypervisors
            .get_mut(hostname)
            .ok_or_else(|| FleetError::UnknownMachine(hostname.to_string()))?;
        record.vms.insert(ip, vm);
        self.vms.insert(ip, hostname.to_string());
        Ok(())
    }

    /// Remove a VM wherever it currently lives. Idempotent.
    pub fn remove_vm(&mut self, ip: Ipv4Addr) {
        if let Some(hostname) = self.vms.remove(&ip) {
            if let Some(record) = self.hypervisors.get_mut(&hostname) {
                record.vms.remove(&ip);
            }
        }
    }

    /// Atomically re-point a VM from `src_hostname` to `dst_hostname`.
    pub fn move_vm(&mut self, ip: Ipv4Addr, src_hostname: &str, dst_hostname: &str) -> Result<()> {
        let vm = self
            .hypervisors
            .get_mut(src_hostname)
            .and_then(|r| r.vms.remove(&ip))
            .ok_or_else(|| FleetError::UnknownVm(ip))?;
        let dst = self
            .hypervisors
            .get_mut(dst_hostname)
            .ok_or_else(|| FleetError::UnknownMachine(dst_hostname.to_string()))?;
        let mut vm = vm;
        vm.hypervisor_hostname = dst_hostname.to_string();
        dst.vms.insert(ip, vm);
        self.vms.insert(ip, dst_hostname.to_string());
        Ok(())
    }

    pub fn lookup_hypervisor_by_vm_ip(&self, ip: Ipv4Addr) -> Option<&str> {
        self.vms.get(&ip).map(|s| s.as_str())
    }

    /// Apply a hypervisor's self-reported "this VM is present" fact. The
    /// hypervisor's own map always reflects what it told us; the global map
    /// stays with whichever hypervisor claimed the IP first (§9 conflict
    /// resolution).
    pub fn observe_vm_present(&mut self, hostname: &str, vm: VmInfo) -> VmObservationOutcome {
        let ip = vm.ip_addr;
        let prior_owner = self.vms.get(&ip).cloned();

        if let Some(record) = self.hypervisors.get_mut(hostname) {
            record.vms.insert(ip, vm);
        }

        match prior_owner {
            None => {
                self.vms.insert(ip, hostname.to_string());
                VmObservationOutcome::Claimed
            }
            Some(owner) if owner == hostname => VmObservationOutcome::Updated,
            Some(_) => VmObservationOutcome::Conflict,
        }
    }

    /// Apply a hypervisor's self-reported "this VM is gone" fact.
    pub fn observe_vm_absent(&mut self, hostname: &str, ip: Ipv4Addr) -> bool {
        if let Some(record) = self.hypervisors.get_mut(hostname) {
            record.vms.remove(&ip);
        }
        if self.vms.get(&ip).map(|owner| owner == hostname).unwrap_or(false) {
            self.vms.remove(&ip);
            true
        } else {
            false
        }
    }

    /// Remove every global `vms` claim this hypervisor owns, without
    /// touching its local `vms` map (used on disconnect, §4.2 step 4 — the
    /// reconnect diff stays a no-op).
    ///
    /// When `reassign` is true (§9, `reassign_on_disconnect`), an IP whose
    /// authoritative claimant just disconnected is promoted to another
    /// hypervisor already holding a conflicting, never-promoted local claim
    /// for the same IP. Returns the `(ip, new_owner)` pairs promoted so the
    /// caller can publish the corresponding `vm-changed` events.
    pub fn teardown_global_claims(&mut self, hostname: &str, reassign: bool) -> Vec<(Ipv4Addr, String)> {
        let Some(record) = self.hypervisors.get(hostname) else {
            return Vec::new();
        };
        let ips: Vec<Ipv4Addr> = record.vms.keys().copied().collect();
        let mut promoted = Vec::new();
        for ip in ips {
            if self.vms.get(&ip).map(|o| o == hostname).unwrap_or(false) {
                self.vms.remove(&ip);
                if reassign {
                    if let Some(new_owner) = self.find_waiting_claimant(hostname, ip) {
                        self.vms.insert(ip, new_owner.clone());
                        promoted.push((ip, new_owner));
                    }
                }
            }
        }
        promoted
    }

    /// A hypervisor other than `exclude_hostname` whose own local map still
    /// lists `ip` — the losing side of a §9 conflict that never got
    /// promoted to the global map.
    fn find_waiting_claimant(&self, exclude_hostname: &str, ip: Ipv4Addr) -> Option<String> {
        self.hypervisors
            .values()
            .find(|r| r.hostname != exclude_hostname && r.vms.contains_key(&ip))
            .map(|r| r.hostname.clone())
    }

    /// Full shutdown teardown (§4.2 step 6): drop every global claim and
    /// delete the record itself. Never reassigns — the machine is leaving
    /// the fleet, not merely unreachable.
    pub fn remove_hypervisor(&mut self, hostname: &str) -> Option<HypervisorRecord> {
        self.teardown_global_claims(hostname, false);
        self.hypervisors.remove(hostname)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmObservationOutcome {
    Claimed,
    Updated,
    Conflict,
}

pub fn machine_auth_ok(owner_users: &BTreeSet<String>, user: &str) -> bool {
    owner_users.contains(user)
}

/// A thread-safe, incrementing id source for worker-private signalling.
pub fn alloc_local_seq(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed)
}
