//! In-memory fakes for every external collaborator (§1's ambient test
//! tooling), used by this crate's own integration tests and available to
//! the daemon's test suite. Kept as an ordinary public module, not gated
//! behind `#[cfg(test)]`, mirroring the teacher's mock-backend module.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::hypervisor_rpc::{
    DialError, HypervisorRpc, HypervisorRpcConnector, RpcError, UpdateStream, VmUpdate,
};
use crate::ipmi::{IpmiClient, IpmiError, PowerState};
use crate::registry::VmInfo;
use crate::topology::Subnet;

/// A scriptable fake hypervisor. `updates_tx` feeds the worker's update
/// stream from test code; `fail_prepare`/`fail_surrender` drive the
/// migration rollback scenarios (S4/S5).
pub struct MockHypervisorRpc {
    updates: Mutex<Option<mpsc::UnboundedReceiver<VmUpdate>>>,
    pub updates_tx: mpsc::UnboundedSender<VmUpdate>,
    pub subnets: Vec<Subnet>,
    pub serial: String,
    pub tags: BTreeMap<String, String>,
    pub fail_prepare: AtomicBool,
    pub fail_surrender: AtomicBool,
    pub discarded: Mutex<Vec<Ipv4Addr>>,
}

impl MockHypervisorRpc {
    pub fn new(subnets: Vec<Subnet>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(MockHypervisorRpc {
            updates: Mutex::new(Some(rx)),
            updates_tx: tx,
            subnets,
            serial: "SN-MOCK".to_string(),
            tags: BTreeMap::new(),
            fail_prepare: AtomicBool::new(false),
            fail_surrender: AtomicBool::new(false),
            discarded: Mutex::new(Vec::new()),
        })
    }

    pub fn push_update(&self, update: VmUpdate) {
        let _ = self.updates_tx.send(update);
    }
}

#[async_trait]
impl HypervisorRpc for Arc<MockHypervisorRpc> {
    async fn subscribe_updates(&self) -> Result<UpdateStream, RpcError> {
        let rx = self
            .updates
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RpcError::Other("mock already subscribed".to_string()))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn get_subnets(&self) -> Result<Vec<Subnet>, RpcError> {
        Ok(self.subnets.clone())
    }

    async fn get_serial_number(&self) -> Result<String, RpcError> {
        Ok(self.serial.clone())
    }

    async fn get_tags(&self) -> Result<BTreeMap<String, String>, RpcError> {
        Ok(self.tags.clone())
    }

    async fn prepare_vm_for_migration(&self, _vm: &VmInfo) -> Result<(), RpcError> {
        if self.fail_prepare.load(Ordering::Relaxed) {
            Err(RpcError::Other("mock prepare failure".to_string()))
        } else {
            Ok(())
        }
    }

    async fn surrender_vm_for_migration(&self, _ip: Ipv4Addr) -> Result<(), RpcError> {
        if self.fail_surrender.load(Ordering::Relaxed) {
            Err(RpcError::Other("mock surrender failure".to_string()))
        } else {
            Ok(())
        }
    }

    async fn discard_prepared_vm(&self, ip: Ipv4Addr) -> Result<(), RpcError> {
        self.discarded.lock().unwrap().push(ip);
        Ok(())
    }
}

/// Connects hostnames (by primary IP) to their `MockHypervisorRpc`, with
/// per-IP dial-failure injection for probe-worker backoff tests.
#[derive(Default)]
pub struct MockConnector {
    hosts: Mutex<HashMap<Ipv4Addr, Arc<MockHypervisorRpc>>>,
    dial_failures: Mutex<HashMap<Ipv4Addr, DialError>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(MockConnector::default())
    }

    pub fn register(&self, ip: Ipv4Addr, rpc: Arc<MockHypervisorRpc>) {
        self.hosts.lock().unwrap().insert(ip, rpc);
    }

    pub fn set_dial_failure(&self, ip: Ipv4Addr, err: DialError) {
        self.dial_failures.lock().unwrap().insert(ip, err);
    }

    pub fn clear_dial_failure(&self, ip: Ipv4Addr) {
        self.dial_failures.lock().unwrap().remove(&ip);
    }
}

#[async_trait]
impl HypervisorRpcConnector for MockConnector {
    async fn connect(&self, primary_ip: Ipv4Addr, _timeout: Duration) -> Result<Box<dyn HypervisorRpc>, DialError> {
        if let Some(err) = self.dial_failures.lock().unwrap().get(&primary_ip) {
            return Err(*err);
        }
        self.hosts
            .lock()
            .unwrap()
            .get(&primary_ip)
            .cloned()
            .map(|rpc| Box::new(rpc) as Box<dyn HypervisorRpc>)
            .ok_or(DialError::Unreachable)
    }
}

/// A fake IPMI collaborator keyed by IPMI IP.
#[derive(Default)]
pub struct MockIpmiClient {
    status: Mutex<HashMap<Ipv4Addr, PowerState>>,
}

impl MockIpmiClient {
    pub fn new() -> Arc<Self> {
        Arc::new(MockIpmiClient::default())
    }

    pub fn set_status(&self, ip: Ipv4Addr, state: PowerState) {
        self.status.lock().unwrap().insert(ip, state);
    }
}

#[async_trait]
impl IpmiClient for MockIpmiClient {
    async fn power_status(&self, ipmi_ip: Ipv4Addr) -> Result<PowerState, IpmiError> {
        self.status
            .lock()
            .unwrap()
            .get(&ipmi_ip)
            .copied()
            .ok_or(IpmiError::Unreachable)
    }

    async fn power_on(&self, ipmi_ip: Ipv4Addr) -> Result<(), IpmiError> {
        self.status.lock().unwrap().insert(ipmi_ip, PowerState::On);
        Ok(())
    }
}
