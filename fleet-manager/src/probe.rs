//! Hypervisor probe worker (component B): one per hypervisor record,
//! spawned as an independent task. Implements the dial/handshake/steady
//! state/disconnect/shutdown lifecycle and the IPMI-on-unreachable probe.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{Notify, RwLock as AsyncRwLock};

use crate::hypervisor_rpc::{DialError, HypervisorRpcConnector, RpcError, VmUpdate};
use crate::ipmi::{IpmiClient, PowerState};
use crate::notifier::{publish, Update};
use crate::registry::{HypervisorLocal, ManagerState, ProbeStatus, VmObservationOutcome};
use crate::storer::Storer;
use crate::topology::Subnet;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub dial_timeout: Duration,
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
    pub ipmi_reprobe_interval: Duration,
    /// Whether `disconnect` promotes a conflicting local claim to the
    /// global map once the authoritative hypervisor drops off (§9).
    pub reassign_on_disconnect: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            dial_timeout: Duration::from_secs(5),
            backoff_floor: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(60),
            ipmi_reprobe_interval: Duration::from_secs(300),
            reassign_on_disconnect: false,
        }
    }
}

pub struct ProbeContext {
    pub state: Arc<AsyncRwLock<ManagerState>>,
    pub connector: Arc<dyn HypervisorRpcConnector>,
    pub storer: Arc<dyn Storer>,
    pub ipmi: Arc<dyn IpmiClient>,
    pub config: ProbeConfig,
}

fn classify_dial_error(err: DialError) -> ProbeStatus {
    match err {
        DialError::ConnectionRefused => ProbeStatus::ConnectionRefused,
        DialError::Unreachable => ProbeStatus::Unreachable,
        DialError::NoRpc => ProbeStatus::NoRpc,
        DialError::NoService => ProbeStatus::NoService,
        DialError::AccessDenied => ProbeStatus::AccessDenied,
    }
}

/// The probe worker's main loop. Runs until `delete_scheduled` is observed,
/// at which point the hypervisor record is removed and the task returns.
pub async fn run_probe_worker(
    ctx: Arc<ProbeContext>,
    hostname: String,
    primary_ip: Ipv4Addr,
    ipmi_ip: Option<Ipv4Addr>,
    delete_scheduled: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    local: Arc<HypervisorLocal>,
) {
    let mut backoff = ctx.config.backoff_floor;

    loop {
        if delete_scheduled.load(Ordering::Acquire) {
            shutdown(&ctx, &hostname).await;
            return;
        }

        match ctx.connector.connect(primary_ip, ctx.config.dial_timeout).await {
            Ok(conn) => {
                backoff = ctx.config.backoff_floor;
                let exited_for_shutdown =
                    steady_state(&ctx, &hostname, conn, &delete_scheduled, &shutdown_notify, &local).await;
                if exited_for_shutdown {
                    shutdown(&ctx, &hostname).await;
                    return;
                }
                // Disconnected mid-flight: loop back to dial immediately,
                // the next failed dial (if any) picks backoff back up.
            }
            Err(dial_err) => {
                set_probe_status(&ctx, &hostname, classify_dial_error(dial_err)).await;
                maybe_probe_ipmi(&ctx, &hostname, ipmi_ip, &local).await;

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown_notify.notified() => {}
                }
                if delete_scheduled.load(Ordering::Acquire) {
                    shutdown(&ctx, &hostname).await;
                    return;
                }
                backoff = (backoff * 2).min(ctx.config.backoff_cap);
            }
        }
    }
}

/// Handshake then block on the update stream. Returns `true` if the loop
/// exited because shutdown was requested (caller must tear the record
/// down), `false` if it exited because the connection dropped (caller
/// redials).
async fn steady_state(
    ctx: &ProbeContext,
    hostname: &str,
    conn: Box<dyn crate::hypervisor_rpc::HypervisorRpc>,
    delete_scheduled: &Arc<AtomicBool>,
    shutdown_notify: &Arc<Notify>,
    local: &Arc<HypervisorLocal>,
) -> bool {
    let mut stream = match conn.subscribe_updates().await {
        Ok(s) => s,
        Err(_) => {
            set_probe_status(ctx, hostname, ProbeStatus::NoRpc).await;
            return false;
        }
    };

    if let Ok(subnets) = conn.get_subnets().await {
        record_subnets(ctx, hostname, subnets).await;
    }

    if let Ok(serial) = conn.get_serial_number().await {
        refresh_serial(ctx, hostname, &serial, local).await;
    }

    if let Ok(rpc_tags) = conn.get_tags().await {
        merge_tags(ctx, hostname, rpc_tags).await;
    }

    set_probe_status(ctx, hostname, ProbeStatus::Connected).await;
    publish_status_changed(ctx, hostname, ProbeStatus::Connected).await;

    loop {
        tokio::select! {
            item = stream.next() => {
                match item {
                    Some(update) => apply_update(ctx, hostname, update).await,
                    None => {
                        disconnect(ctx, hostname).await;
                        return false;
                    }
                }
            }
            _ = shutdown_notify.notified() => {
                if delete_scheduled.load(Ordering::Acquire) {
                    return true;
                }
            }
        }
    }
}

async fn apply_update(ctx: &ProbeContext, hostname: &str, update: VmUpdate) {
    match update {
        VmUpdate::Added(vm) | VmUpdate::Changed(vm) => {
            let ip = vm.ip_addr;
            let outcome = {
                let mut state = ctx.state.write().await;
                state.observe_vm_present(hostname, vm)
            };
            match outcome {
                VmObservationOutcome::Claimed => {
                    publish_event(ctx, hostname, Update::VmAdded { hostname: hostname.to_string(), ip }).await
                }
                VmObservationOutcome::Updated => {
                    publish_event(ctx, hostname, Update::VmChanged { hostname: hostname.to_string(), ip }).await
                }
                VmObservationOutcome::Conflict => {
                    tracing::warn!(hostname, %ip, "hypervisor announced a vm ip already claimed elsewhere");
                }
            }
        }
        VmUpdate::Deleted(ip) => {
            let was_owner = {
                let mut state = ctx.state.write().await;
                state.observe_vm_absent(hostname, ip)
            };
            if was_owner {
                publish_event(ctx, hostname, Update::VmDeleted { hostname: hostname.to_string(), ip }).await;
            }
        }
        VmUpdate::SubnetsRefreshed(subnets) => {
            record_subnets(ctx, hostname, subnets).await;
        }
    }
}

async fn disconnect(ctx: &ProbeContext, hostname: &str) {
    set_probe_status(ctx, hostname, ProbeStatus::Unreachable).await;
    let promoted = {
        let mut state = ctx.state.write().await;
        state.teardown_global_claims(hostname, ctx.config.reassign_on_disconnect)
    };
    for (ip, new_owner) in promoted {
        publish_event(ctx, &new_owner, Update::VmChanged { hostname: new_owner.clone(), ip }).await;
    }
    publish_status_changed(ctx, hostname, ProbeStatus::Unreachable).await;
}

async fn shutdown(ctx: &ProbeContext, hostname: &str) {
    {
        let mut state = ctx.state.write().await;
        state.remove_hypervisor(hostname);
        state.worker_handles.remove(hostname);
    }
    let update = Update::HypervisorRemoved { hostname: hostname.to_string() };
    let state = ctx.state.read().await;
    publish(&state.locations, &state.subscribers, hostname, update);
}

async fn set_probe_status(ctx: &ProbeContext, hostname: &str, status: ProbeStatus) {
    let mut state = ctx.state.write().await;
    if let Some(record) = state.hypervisors.get_mut(hostname) {
        record.probe_status = status;
    }
}

async fn publish_status_changed(ctx: &ProbeContext, hostname: &str, status: ProbeStatus) {
    publish_event(
        ctx,
        hostname,
        Update::HypervisorStatusChanged { hostname: hostname.to_string(), status },
    )
    .await;
}

async fn publish_event(ctx: &ProbeContext, hostname: &str, update: Update) {
    let state = ctx.state.read().await;
    let location = state
        .hypervisors
        .get(hostname)
        .map(|r| r.location.clone())
        .unwrap_or_default();
    publish(&state.locations, &state.subscribers, &location, update);
}

async fn record_subnets(ctx: &ProbeContext, hostname: &str, subnets: Vec<Subnet>) {
    let mut state = ctx.state.write().await;
    let gateways: Vec<Ipv4Addr> = subnets.iter().map(|s| s.gateway_ip).collect();
    if let Some(record) = state.hypervisors.get_mut(hostname) {
        record.declared_subnets = gateways;
    }
    for subnet in &subnets {
        state
            .subnets
            .entry(subnet.gateway_ip)
            .or_insert_with(|| crate::subnet::SubnetCursor::from_subnet(subnet));
    }
}

async fn refresh_serial(ctx: &ProbeContext, hostname: &str, serial: &str, local: &Arc<HypervisorLocal>) {
    let changed = {
        let mut fields = local.inner.write().await;
        let changed = fields.cached_serial_number.as_deref() != Some(serial);
        fields.cached_serial_number = Some(serial.to_string());
        changed
    };
    if changed {
        if let Err(e) = ctx.storer.write_machine_serial_number(hostname, serial).await {
            tracing::warn!(hostname, error = %e, "failed to persist serial number; will retry next probe cycle");
        }
    }
}

/// Storer-held tags are authoritative; hypervisor-reported tags fill in any
/// key the storer doesn't have an opinion on.
async fn merge_tags(ctx: &ProbeContext, hostname: &str, rpc_tags: std::collections::BTreeMap<String, String>) {
    let authoritative = ctx
        .storer
        .read_machine_tags(hostname)
        .await
        .unwrap_or_default();

    let mut merged = rpc_tags;
    merged.extend(authoritative);

    let mut state = ctx.state.write().await;
    if let Some(record) = state.hypervisors.get_mut(hostname) {
        record.tags = merged;
    }
}

async fn maybe_probe_ipmi(ctx: &ProbeContext, hostname: &str, ipmi_ip: Option<Ipv4Addr>, local: &Arc<HypervisorLocal>) {
    let status = {
        let state = ctx.state.read().await;
        state.hypervisors.get(hostname).map(|r| r.probe_status)
    };
    let should_probe = matches!(status, Some(ProbeStatus::Unreachable) | Some(ProbeStatus::ConnectionRefused));
    if !should_probe {
        return;
    }
    let Some(ipmi_ip) = ipmi_ip else { return };

    let due = {
        let fields = local.inner.read().await;
        match fields.last_ipmi_probe {
            None => true,
            Some(last) => last.elapsed() > ctx.config.ipmi_reprobe_interval,
        }
    };
    if !due {
        return;
    }

    let result = ctx.ipmi.power_status(ipmi_ip).await;
    {
        let mut fields = local.inner.write().await;
        fields.last_ipmi_probe = Some(Instant::now());
    }
    if matches!(result, Ok(PowerState::Off)) {
        set_probe_status(ctx, hostname, ProbeStatus::Off).await;
        publish_status_changed(ctx, hostname, ProbeStatus::Off).await;
    }
}

/// Classify an `RpcError` surfaced outside the probe worker's own loop
/// (e.g. from a migration RPC) into a probe status, for callers that need
/// to record it without duplicating the dial-error mapping above.
pub fn classify_rpc_error(err: &RpcError) -> ProbeStatus {
    match err {
        RpcError::Timeout => ProbeStatus::Unreachable,
        RpcError::ConnectionClosed(_) => ProbeStatus::Unreachable,
        RpcError::Other(_) => ProbeStatus::NoRpc,
    }
}
