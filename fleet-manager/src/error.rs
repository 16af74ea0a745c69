//! Error taxonomy (component H): one `thiserror` enum at the crate boundary,
//! with conversions from every external collaborator's error type so call
//! sites can use `?` and still expose the right category upward.

use std::net::Ipv4Addr;

use crate::hypervisor_rpc::RpcError;
use crate::ipmi::IpmiError;
use crate::storer::StorerError;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("unknown machine: {0}")]
    UnknownMachine(String),

    #[error("unknown vm: {0}")]
    UnknownVm(Ipv4Addr),

    #[error("unknown location: {0}")]
    UnknownLocation(String),

    #[error("invalid ip: {0}")]
    InvalidIp(String),

    #[error("caller does not own this machine")]
    NotOwner,

    #[error("no free addresses in subnet with gateway {0}")]
    NoFreeAddresses(Ipv4Addr),

    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("hypervisor unreachable: {0}")]
    HypervisorUnreachable(String),

    #[error("storer i/o error: {0}")]
    StorerIo(String),

    #[error("rpc timed out")]
    RpcTimeout,

    #[error("migration prepare failed: {0}")]
    MigrationPrepareFailed(String),

    #[error("migration commit failed: {0}")]
    MigrationCommitFailed(String),

    #[error("duplicate ip: {0}")]
    DuplicateIp(Ipv4Addr),
}

pub type Result<T> = std::result::Result<T, FleetError>;

impl From<StorerError> for FleetError {
    fn from(err: StorerError) -> Self {
        FleetError::StorerIo(err.to_string())
    }
}

impl From<RpcError> for FleetError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout => FleetError::RpcTimeout,
            other => FleetError::HypervisorUnreachable(other.to_string()),
        }
    }
}

impl From<IpmiError> for FleetError {
    fn from(err: IpmiError) -> Self {
        FleetError::HypervisorUnreachable(format!("ipmi: {err}"))
    }
}
