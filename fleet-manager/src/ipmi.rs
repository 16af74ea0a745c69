//! IPMI power control (§6): a single `IpmiClient` trait. Hardware access is
//! out of scope for this crate; the daemon wires in a stub by default, with
//! an extension point documented for a real `ipmitool`/`rust-ipmi` backend.

use std::net::Ipv4Addr;
use std::path::Path;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
}

#[derive(Debug, thiserror::Error)]
pub enum IpmiError {
    #[error("ipmi unreachable")]
    Unreachable,
    #[error("ipmi not supported: {0}")]
    NotSupported(String),
}

#[derive(Debug, Clone)]
pub struct IpmiCredentials {
    pub username: String,
    pub password: String,
}

impl IpmiCredentials {
    /// Loaded once at startup, per §6: the password file is read a single
    /// time and the account name comes from configuration.
    pub fn load(username: impl Into<String>, password_file: &Path) -> anyhow::Result<Self> {
        let password = std::fs::read_to_string(password_file)
            .map_err(|e| anyhow::anyhow!("reading ipmi password file {password_file:?}: {e}"))?
            .trim()
            .to_string();
        Ok(IpmiCredentials {
            username: username.into(),
            password,
        })
    }
}

#[async_trait]
pub trait IpmiClient: Send + Sync {
    async fn power_status(&self, ipmi_ip: Ipv4Addr) -> Result<PowerState, IpmiError>;
    async fn power_on(&self, ipmi_ip: Ipv4Addr) -> Result<(), IpmiError>;
}

/// Default IPMI collaborator: hardware access is a documented non-goal of
/// this crate, so every call fails with `NotSupported` rather than
/// shelling out. A real deployment supplies its own `IpmiClient`.
pub struct NullIpmiClient;

#[async_trait]
impl IpmiClient for NullIpmiClient {
    async fn power_status(&self, _ipmi_ip: Ipv4Addr) -> Result<PowerState, IpmiError> {
        Err(IpmiError::NotSupported("no IpmiClient configured".to_string()))
    }

    async fn power_on(&self, _ipmi_ip: Ipv4Addr) -> Result<(), IpmiError> {
        Err(IpmiError::NotSupported("no IpmiClient configured".to_string()))
    }
}
