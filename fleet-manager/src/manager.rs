//! Manager façade (component G): the sole synchronization root. Every
//! public operation of §4.7 is a method here.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock as AsyncRwLock;

use crate::error::{FleetError, Result};
use crate::hypervisor_rpc::HypervisorRpcConnector;
use crate::ipmi::{IpmiClient, IpmiCredentials};
use crate::migration::{migrate_many, MigrationContext};
use crate::notifier::{self, HypervisorSummary, LocationSnapshot, Update, UpdateReceiver};
use crate::probe::{self, ProbeConfig, ProbeContext};
use crate::reconciler::{diff_topology, rebuild_subnets};
use crate::registry::{HypervisorRecord, ManagerState, ProbeStatus};
use crate::storer::Storer;
use crate::subnet::find_free_ip;
use crate::topology::{location_matches_prefix, Topology};

/// Opaque caller identity. The core never implements an identity provider;
/// it only compares this against a machine's `owner_users` set.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub dial_timeout: Duration,
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
    pub ipmi_reprobe_interval: Duration,
    pub subscriber_buffer_depth: usize,
    /// Whether a disconnecting authoritative hypervisor automatically
    /// releases a contested IP for reassignment (§9, resolved open
    /// question). Default `false`.
    pub reassign_on_disconnect: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            dial_timeout: Duration::from_secs(5),
            backoff_floor: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(60),
            ipmi_reprobe_interval: Duration::from_secs(300),
            subscriber_buffer_depth: 256,
            reassign_on_disconnect: false,
        }
    }
}

pub struct StartOptions {
    pub ipmi_username: String,
    pub ipmi_password_file: PathBuf,
    pub storer: Arc<dyn Storer>,
    pub connector: Arc<dyn HypervisorRpcConnector>,
    pub ipmi: Arc<dyn IpmiClient>,
    pub config: ManagerConfig,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HypervisorFilter {
    pub connected_only: bool,
}

#[derive(Debug, Clone)]
pub struct MachineInfo {
    pub hostname: String,
    pub primary_ip: Ipv4Addr,
    pub ipmi_ip: Option<Ipv4Addr>,
    pub location: String,
    pub owner_users: std::collections::BTreeSet<String>,
    pub tags: BTreeMap<String, String>,
    pub probe_status: ProbeStatus,
    pub vm_ips: Vec<Ipv4Addr>,
}

pub struct Manager {
    state: Arc<AsyncRwLock<ManagerState>>,
    storer: Arc<dyn Storer>,
    connector: Arc<dyn HypervisorRpcConnector>,
    ipmi: Arc<dyn IpmiClient>,
    ipmi_credentials: IpmiCredentials,
    config: ManagerConfig,
}

impl Manager {
    /// Construct a manager. Fails only for startup-fatal reasons (§7): an
    /// unreadable IPMI password file. Returns a plain `anyhow::Error`,
    /// matching the split between library-typed errors and binary-level
    /// context for the one class of error that should abort `main`.
    pub async fn new(opts: StartOptions) -> anyhow::Result<Self> {
        let ipmi_credentials = IpmiCredentials::load(opts.ipmi_username, &opts.ipmi_password_file)?;
        Ok(Manager {
            state: Arc::new(AsyncRwLock::new(ManagerState::new())),
            storer: opts.storer,
            connector: opts.connector,
            ipmi: opts.ipmi,
            ipmi_credentials,
            config: opts.config,
        })
    }

    fn probe_ctx(&self) -> Arc<ProbeContext> {
        Arc::new(ProbeContext {
            state: self.state.clone(),
            connector: self.connector.clone(),
            storer: self.storer.clone(),
            ipmi: self.ipmi.clone(),
            config: ProbeConfig {
                dial_timeout: self.config.dial_timeout,
                backoff_floor: self.config.backoff_floor,
                backoff_cap: self.config.backoff_cap,
                ipmi_reprobe_interval: self.config.ipmi_reprobe_interval,
                reassign_on_disconnect: self.config.reassign_on_disconnect,
            },
        })
    }

    fn migration_ctx(&self) -> MigrationContext {
        MigrationContext {
            state: self.state.clone(),
            connector: self.connector.clone(),
            storer: self.storer.clone(),
            rpc_timeout: self.config.dial_timeout,
        }
    }

    /// Topology reconciler (component E, §4.5). Idempotent: calling this
    /// twice with an identical topology mutates nothing the second time.
    pub async fn update_topology(&self, new_topology: Topology) {
        let diff = {
            let state = self.state.read().await;
            diff_topology(&state.topology, &new_topology)
        };

        let mut spawned: Vec<(String, Ipv4Addr, Option<Ipv4Addr>, Arc<std::sync::atomic::AtomicBool>, Arc<tokio::sync::Notify>, Arc<crate::registry::HypervisorLocal>)> = Vec::new();

        {
            let mut state = self.state.write().await;

            for machine in &diff.added {
                let record = HypervisorRecord::new(
                    machine.hostname.clone(),
                    machine.primary_ip,
                    machine.location.clone(),
                );
                let delete_scheduled = record.delete_scheduled.clone();
                let shutdown_notify = record.shutdown_notify.clone();
                let local = record.local.clone();
                let mut record = record;
                record.ipmi_ip = machine.ipmi_ip;
                record.owner_users = machine.owner_users.clone();
                record.tags = machine.tags.clone();
                state.hypervisors.insert(machine.hostname.clone(), record);
                spawned.push((
                    machine.hostname.clone(),
                    machine.primary_ip,
                    machine.ipmi_ip,
                    delete_scheduled,
                    shutdown_notify,
                    local,
                ));
            }

            for machine in &diff.modified {
                if let Some(record) = state.hypervisors.get_mut(&machine.hostname) {
                    record.location = machine.location.clone();
                    record.ipmi_ip = machine.ipmi_ip;
                    record.owner_users = machine.owner_users.clone();
                    record.tags = machine.tags.clone();
                }
            }

            for hostname in &diff.removed {
                if let Some(record) = state.hypervisors.get(hostname) {
                    record.schedule_delete();
                }
            }

            state.subnets = rebuild_subnets(&state.subnets, &new_topology);
            state.topology = Arc::new(new_topology);
        }

        let ctx = self.probe_ctx();
        for (hostname, primary_ip, ipmi_ip, delete_scheduled, shutdown_notify, local) in spawned {
            let ctx = ctx.clone();
            let spawn_hostname = hostname.clone();
            let handle = tokio::spawn(async move {
                probe::run_probe_worker(
                    ctx,
                    spawn_hostname,
                    primary_ip,
                    ipmi_ip,
                    delete_scheduled,
                    shutdown_notify,
                    local,
                )
                .await;
            });
            let mut state = self.state.write().await;
            state.worker_handles.insert(hostname, handle);
        }

        if !diff.added.is_empty() || !diff.removed.is_empty() || !diff.modified.is_empty() {
            let state = self.state.read().await;
            notifier::publish(&state.locations, &state.subscribers, "", Update::TopologyChanged);
        }
    }

    pub async fn change_machine_tags(
        &self,
        hostname: &str,
        auth: &AuthInfo,
        tags: BTreeMap<String, String>,
    ) -> Result<()> {
        let location = {
            let mut state = self.state.write().await;
            let record = state
                .hypervisors
                .get_mut(hostname)
                .ok_or_else(|| FleetError::UnknownMachine(hostname.to_string()))?;
            if !record.owner_users.contains(&auth.user) {
                return Err(FleetError::NotOwner);
            }
            record.tags = tags.clone();
            record.location.clone()
        };

        self.storer.write_machine_tags(hostname, &tags).await?;

        let state = self.state.read().await;
        notifier::publish(
            &state.locations,
            &state.subscribers,
            &location,
            Update::MachineTagsChanged { hostname: hostname.to_string(), tags },
        );
        Ok(())
    }

    pub async fn get_hypervisor_for_vm(&self, ip: Ipv4Addr) -> Result<String> {
        let state = self.state.read().await;
        state
            .lookup_hypervisor_by_vm_ip(ip)
            .map(|s| s.to_string())
            .ok_or(FleetError::UnknownVm(ip))
    }

    pub async fn get_machine_info(&self, hostname: &str) -> Result<MachineInfo> {
        let state = self.state.read().await;
        let record = state
            .hypervisors
            .get(hostname)
            .ok_or_else(|| FleetError::UnknownMachine(hostname.to_string()))?;
        let mut vm_ips: Vec<Ipv4Addr> = record.vms.keys().copied().collect();
        vm_ips.sort();
        Ok(MachineInfo {
            hostname: record.hostname.clone(),
            primary_ip: record.primary_ip,
            ipmi_ip: record.ipmi_ip,
            location: record.location.clone(),
            owner_users: record.owner_users.clone(),
            tags: record.tags.clone(),
            probe_status: record.probe_status,
            vm_ips,
        })
    }

    /// Cheap `Arc` clone of the current topology snapshot.
    pub async fn get_topology(&self) -> Arc<Topology> {
        self.state.read().await.topology.clone()
    }

    pub async fn list_hypervisors_in_location(&self, location: &str, filter: HypervisorFilter) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state
            .hypervisors
            .values()
            .filter(|r| location_matches_prefix(&r.location, location))
            .filter(|r| !filter.connected_only || r.probe_status.is_connected())
            .map(|r| r.hostname.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn list_locations(&self, prefix: &str) -> Vec<String> {
        let state = self.state.read().await;
        let mut locations: Vec<String> = state
            .topology
            .location_paths()
            .into_iter()
            .filter(|l| location_matches_prefix(l, prefix))
            .collect();
        locations.sort();
        locations.dedup();
        locations
    }

    pub async fn list_vms_in_location(&self, location: &str) -> Vec<Ipv4Addr> {
        let state = self.state.read().await;
        let mut ips: Vec<Ipv4Addr> = state
            .hypervisors
            .values()
            .filter(|r| location_matches_prefix(&r.location, location))
            .flat_map(|r| r.vms.keys().copied())
            .collect();
        ips.sort();
        ips
    }

    pub async fn make_update_channel(&self, location: &str) -> UpdateReceiver {
        let mut state = self.state.write().await;
        let id = state.next_subscriber_id();
        let snapshot = LocationSnapshot {
            hypervisors: state
                .hypervisors
                .values()
                .filter(|r| location_matches_prefix(&r.location, location))
                .map(HypervisorSummary::from_record)
                .collect(),
        };
        let buffer_depth = self.config.subscriber_buffer_depth;
        notifier::subscribe(
            &mut state.locations,
            &mut state.subscribers,
            id,
            location.to_string(),
            buffer_depth,
            snapshot,
        )
    }

    pub async fn close_update_channel(&self, id: u64) {
        let mut state = self.state.write().await;
        notifier::unsubscribe(&mut state.locations, &mut state.subscribers, id);
    }

    pub async fn move_ip_addresses(&self, target_hostname: &str, ips: Vec<Ipv4Addr>) -> Vec<(Ipv4Addr, Result<()>)> {
        let ctx = self.migration_ctx();
        migrate_many(&ctx, ips, target_hostname).await
    }

    pub async fn power_on_machine(&self, hostname: &str, auth: &AuthInfo) -> Result<()> {
        let ipmi_ip = {
            let state = self.state.read().await;
            let record = state
                .hypervisors
                .get(hostname)
                .ok_or_else(|| FleetError::UnknownMachine(hostname.to_string()))?;
            if !record.owner_users.contains(&auth.user) {
                return Err(FleetError::NotOwner);
            }
            record
                .ipmi_ip
                .ok_or_else(|| FleetError::InvalidIp("machine has no ipmi address configured".to_string()))?
        };
        self.ipmi.power_on(ipmi_ip).await?;
        Ok(())
    }

    /// Credentials loaded once at startup (§6); exposed for a real
    /// `IpmiClient` implementation to pick up, since the default
    /// [`crate::ipmi::NullIpmiClient`] never needs them.
    pub fn ipmi_credentials(&self) -> &IpmiCredentials {
        &self.ipmi_credentials
    }

    /// Allocate a free IP for `hostname` from any subnet it declares (or a
    /// specific `gateway_ip` if given). Component A.
    pub async fn allocate_ip(&self, hostname: &str, gateway_ip: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        let mut state = self.state.write().await;
        let gateways: Vec<Ipv4Addr> = match gateway_ip {
            Some(g) => vec![g],
            None => state
                .hypervisors
                .get(hostname)
                .map(|r| r.declared_subnets.clone())
                .ok_or_else(|| FleetError::UnknownMachine(hostname.to_string()))?,
        };

        for gw in gateways {
            let Some(mut cursor) = state.subnets.get(&gw).cloned() else {
                continue;
            };
            // Addresses this call has already found Storer-registered (d);
            // `find_free_ip` stays synchronous, so each hit re-enters the
            // walk with the candidate added to the exclusion set instead of
            // abandoning the gateway, until the walk exhausts the subnet.
            let mut storer_excluded: std::collections::BTreeSet<Ipv4Addr> = std::collections::BTreeSet::new();
            loop {
                let vms = &state.vms;
                let allocating = &state.allocating_ips;
                let migrating = &state.migrating_ips;
                let candidate = find_free_ip(&mut cursor, |ip| {
                    vms.contains_key(&ip)
                        || allocating.contains(&ip)
                        || migrating.contains(&ip)
                        || storer_excluded.contains(&ip)
                });
                let Ok(ip) = candidate else {
                    break;
                };
                if self.storer.check_ip_is_registered(ip).await.unwrap_or(false) {
                    storer_excluded.insert(ip);
                    continue;
                }
                state.allocating_ips.insert(ip);
                state.subnets.insert(gw, cursor);
                return Ok(ip);
            }
        }
        Err(FleetError::NoFreeAddresses(gateway_ip.unwrap_or(Ipv4Addr::UNSPECIFIED)))
    }

    /// Release a reservation made by `allocate_ip` that was never promoted
    /// to a live VM. Updates the Storer as well as the registry (§4.1).
    pub async fn release_allocation(&self, hostname: &str, ip: Ipv4Addr) -> Result<()> {
        let mut state = self.state.write().await;
        state.allocating_ips.remove(&ip);
        drop(state);

        let mut remaining = self.storer.get_ips_for_hypervisor(hostname).await?;
        remaining.retain(|&registered| registered != ip);
        self.storer.set_ips_for_hypervisor(hostname, &remaining).await?;
        Ok(())
    }

    /// Render a human-readable status page. Byte formatting only; no HTML
    /// templating concerns live in this crate (§6).
    pub async fn write_html<W: std::io::Write>(&self, mut writer: W) -> std::io::Result<()> {
        let state = self.state.read().await;
        writeln!(writer, "<html><body>")?;
        writeln!(writer, "<h1>Fleet Manager</h1>")?;
        writeln!(writer, "<table border=1>")?;
        writeln!(writer, "<tr><th>Hostname</th><th>Location</th><th>Status</th><th>VMs</th></tr>")?;
        let mut hostnames: Vec<&String> = state.hypervisors.keys().collect();
        hostnames.sort();
        for hostname in hostnames {
            let record = &state.hypervisors[hostname];
            writeln!(
                writer,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                record.hostname,
                record.location,
                record.probe_status.as_str(),
                record.vms.len()
            )?;
        }
        writeln!(writer, "</table></body></html>")?;
        Ok(())
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}
