//! Migration coordinator (component D): two-phase move of a VM IP from its
//! current hypervisor to a target hypervisor.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FleetError, Result};
use crate::hypervisor_rpc::HypervisorRpcConnector;
use crate::notifier::{publish, Update};
use crate::registry::ManagerState;
use crate::storer::Storer;
use tokio::sync::RwLock as AsyncRwLock;

pub struct MigrationContext {
    pub state: Arc<AsyncRwLock<ManagerState>>,
    pub connector: Arc<dyn HypervisorRpcConnector>,
    pub storer: Arc<dyn Storer>,
    pub rpc_timeout: Duration,
}

/// Move one IP to `dst_hostname`. Returns the source hostname on success.
pub async fn migrate_one(ctx: &MigrationContext, ip: Ipv4Addr, dst_hostname: &str) -> Result<String> {
    // Step 1: stage the move under the write lock.
    let (src_hostname, dst_primary_ip, src_primary_ip, vm) = {
        let mut state = ctx.state.write().await;

        let src_hostname = state
            .vms
            .get(&ip)
            .cloned()
            .ok_or(FleetError::UnknownVm(ip))?;

        if state.migrating_ips.contains(&ip) || state.allocating_ips.contains(&ip) {
            return Err(FleetError::InsufficientResources(format!(
                "ip {ip} already has an in-flight allocation or migration"
            )));
        }
        if src_hostname == dst_hostname {
            return Err(FleetError::InsufficientResources(format!(
                "ip {ip} is already on {dst_hostname}"
            )));
        }

        let vm = state
            .hypervisors
            .get(&src_hostname)
            .and_then(|r| r.vms.get(&ip))
            .cloned()
            .ok_or(FleetError::UnknownVm(ip))?;

        let dst_primary_ip = state
            .hypervisors
            .get(dst_hostname)
            .map(|r| r.primary_ip)
            .ok_or_else(|| FleetError::UnknownMachine(dst_hostname.to_string()))?;
        let src_primary_ip = state
            .hypervisors
            .get(&src_hostname)
            .map(|r| r.primary_ip)
            .ok_or_else(|| FleetError::UnknownMachine(src_hostname.clone()))?;

        state.migrating_ips.insert(ip);
        if let Some(dst) = state.hypervisors.get_mut(dst_hostname) {
            dst.migrating_vms.insert(ip, vm.clone());
        }

        (src_hostname, dst_primary_ip, src_primary_ip, vm)
    };

    // Step 2: ask the destination to prepare. No lock held during RPC I/O.
    let prepare_result = async {
        let conn = ctx
            .connector
            .connect(dst_primary_ip, ctx.rpc_timeout)
            .await
            .map_err(|e| format!("{e:?}"))?;
        conn.prepare_vm_for_migration(&vm).await.map_err(|e| e.to_string())
    }
    .await;

    if let Err(reason) = prepare_result {
        rollback_staged(ctx, ip, dst_hostname).await;
        return Err(FleetError::MigrationPrepareFailed(reason));
    }

    // Step 3: ask the source to surrender.
    let surrender_result = async {
        let conn = ctx
            .connector
            .connect(src_primary_ip, ctx.rpc_timeout)
            .await
            .map_err(|e| format!("{e:?}"))?;
        conn.surrender_vm_for_migration(ip).await.map_err(|e| e.to_string())
    }
    .await;

    if let Err(reason) = surrender_result {
        if let Ok(conn) = ctx.connector.connect(dst_primary_ip, ctx.rpc_timeout).await {
            let _ = conn.discard_prepared_vm(ip).await;
        }
        rollback_staged(ctx, ip, dst_hostname).await;
        return Err(FleetError::MigrationCommitFailed(reason));
    }

    // Step 4: commit under the write lock.
    {
        let mut state = ctx.state.write().await;
        if let Some(dst) = state.hypervisors.get_mut(dst_hostname) {
            dst.migrating_vms.remove(&ip);
            dst.vms.insert(ip, vm.clone());
        }
        if let Some(src) = state.hypervisors.get_mut(&src_hostname) {
            src.vms.remove(&ip);
        }
        state.vms.insert(ip, dst_hostname.to_string());
        state.migrating_ips.remove(&ip);
    }

    if let Err(e) = ctx.storer.delete_vm(&src_hostname, ip).await {
        tracing::warn!(%ip, hostname = %src_hostname, error = %e, "failed to delete migrated vm record from storer");
    }
    if let Err(e) = ctx.storer.write_vm(dst_hostname, ip, &vm).await {
        tracing::warn!(%ip, hostname = %dst_hostname, error = %e, "failed to write migrated vm record to storer");
    }

    let state = ctx.state.read().await;
    let location = state
        .hypervisors
        .get(dst_hostname)
        .map(|r| r.location.clone())
        .unwrap_or_default();
    publish(
        &state.locations,
        &state.subscribers,
        &location,
        Update::VmChanged { hostname: dst_hostname.to_string(), ip },
    );

    Ok(src_hostname)
}

async fn rollback_staged(ctx: &MigrationContext, ip: Ipv4Addr, dst_hostname: &str) {
    let mut state = ctx.state.write().await;
    state.migrating_ips.remove(&ip);
    if let Some(dst) = state.hypervisors.get_mut(dst_hostname) {
        dst.migrating_vms.remove(&ip);
    }
}

/// Move a batch of IPs to `dst_hostname`, reporting per-address results. A
/// partial batch leaves successful moves committed.
pub async fn migrate_many(
    ctx: &MigrationContext,
    ips: Vec<Ipv4Addr>,
    dst_hostname: &str,
) -> Vec<(Ipv4Addr, Result<()>)> {
    let mut results = Vec::with_capacity(ips.len());
    for ip in ips {
        let result = migrate_one(ctx, ip, dst_hostname).await.map(|_| ());
        results.push((ip, result));
    }
    results
}
