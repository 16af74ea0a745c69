//! The `HypervisorRpc` collaborator: wire framing and auth are someone
//! else's problem (§6); this module defines only the operation set the
//! probe worker and migration coordinator program against, plus the
//! connection factory so dialing itself is mockable.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::registry::VmInfo;
use crate::topology::Subnet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialError {
    ConnectionRefused,
    Unreachable,
    NoRpc,
    NoService,
    AccessDenied,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("rpc timed out")]
    Timeout,
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("rpc error: {0}")]
    Other(String),
}

/// One delta from a hypervisor's update stream.
#[derive(Debug, Clone)]
pub enum VmUpdate {
    Added(VmInfo),
    Changed(VmInfo),
    Deleted(Ipv4Addr),
    SubnetsRefreshed(Vec<Subnet>),
}

pub type UpdateStream = Pin<Box<dyn Stream<Item = VmUpdate> + Send>>;

/// The fixed operation set a probe worker invokes on a connected hypervisor.
#[async_trait]
pub trait HypervisorRpc: Send + Sync {
    async fn subscribe_updates(&self) -> Result<UpdateStream, RpcError>;
    async fn get_subnets(&self) -> Result<Vec<Subnet>, RpcError>;
    async fn get_serial_number(&self) -> Result<String, RpcError>;
    async fn get_tags(&self) -> Result<BTreeMap<String, String>, RpcError>;
    async fn prepare_vm_for_migration(&self, vm: &VmInfo) -> Result<(), RpcError>;
    async fn surrender_vm_for_migration(&self, ip: Ipv4Addr) -> Result<(), RpcError>;
    async fn discard_prepared_vm(&self, ip: Ipv4Addr) -> Result<(), RpcError>;
}

/// A connection factory: dialing is itself mockable in tests, independent
/// of the connection's subsequent behavior.
#[async_trait]
pub trait HypervisorRpcConnector: Send + Sync {
    async fn connect(
        &self,
        primary_ip: Ipv4Addr,
        timeout: Duration,
    ) -> Result<Box<dyn HypervisorRpc>, DialError>;
}

/// Default connector: the hypervisor-side wire protocol is an external
/// collaborator (§6), so every dial fails with `Unreachable`. A real
/// deployment supplies its own `HypervisorRpcConnector` backed by whatever
/// transport the hypervisor agent speaks.
pub struct NullHypervisorRpcConnector;

#[async_trait]
impl HypervisorRpcConnector for NullHypervisorRpcConnector {
    async fn connect(&self, _primary_ip: Ipv4Addr, _timeout: Duration) -> Result<Box<dyn HypervisorRpc>, DialError> {
        Err(DialError::Unreachable)
    }
}
