//! The `Storer` capability set (component K's trait surface) and an
//! in-memory reference implementation the daemon uses absent a real backend.
//!
//! The four sub-traits compose into one [`Storer`] supertrait so a single
//! concrete backend or four independently-mocked fakes both satisfy it —
//! mirrors the capability-set pattern the probe worker's RPC collaborator
//! uses.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::registry::VmInfo;

#[derive(Debug, thiserror::Error)]
pub enum StorerError {
    #[error("storer i/o: {0}")]
    Io(String),
}

#[async_trait]
pub trait IpStorer: Send + Sync {
    async fn add_ips_for_hypervisor(&self, hostname: &str, ips: &[Ipv4Addr]) -> Result<(), StorerError>;
    async fn check_ip_is_registered(&self, ip: Ipv4Addr) -> Result<bool, StorerError>;
    async fn get_hypervisor_for_ip(&self, ip: Ipv4Addr) -> Result<Option<String>, StorerError>;
    async fn get_ips_for_hypervisor(&self, hostname: &str) -> Result<Vec<Ipv4Addr>, StorerError>;
    async fn set_ips_for_hypervisor(&self, hostname: &str, ips: &[Ipv4Addr]) -> Result<(), StorerError>;
    async fn unregister_hypervisor(&self, hostname: &str) -> Result<(), StorerError>;
}

#[async_trait]
pub trait SerialStorer: Send + Sync {
    async fn read_machine_serial_number(&self, hostname: &str) -> Result<Option<String>, StorerError>;
    async fn write_machine_serial_number(&self, hostname: &str, serial: &str) -> Result<(), StorerError>;
}

#[async_trait]
pub trait TagsStorer: Send + Sync {
    async fn read_machine_tags(&self, hostname: &str) -> Result<BTreeMap<String, String>, StorerError>;
    async fn write_machine_tags(
        &self,
        hostname: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), StorerError>;
}

#[async_trait]
pub trait VmStorer: Send + Sync {
    async fn list_vms(&self, hostname: &str) -> Result<Vec<Ipv4Addr>, StorerError>;
    async fn read_vm(&self, hostname: &str, ip: Ipv4Addr) -> Result<Option<VmInfo>, StorerError>;
    async fn write_vm(&self, hostname: &str, ip: Ipv4Addr, vm: &VmInfo) -> Result<(), StorerError>;
    async fn delete_vm(&self, hostname: &str, ip: Ipv4Addr) -> Result<(), StorerError>;
}

pub trait Storer: IpStorer + SerialStorer + TagsStorer + VmStorer {}
impl<T: IpStorer + SerialStorer + TagsStorer + VmStorer> Storer for T {}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    ips_by_hypervisor: HashMap<String, Vec<Ipv4Addr>>,
    serials: HashMap<String, String>,
    tags: HashMap<String, BTreeMap<String, String>>,
    vms: HashMap<String, HashMap<Ipv4Addr, SerializableVm>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SerializableVm {
    ip_addr: Ipv4Addr,
    owner_users: std::collections::BTreeSet<String>,
    tags: BTreeMap<String, String>,
    secondary_ips: Vec<Ipv4Addr>,
    hypervisor_hostname: String,
}

impl From<&VmInfo> for SerializableVm {
    fn from(vm: &VmInfo) -> Self {
        SerializableVm {
            ip_addr: vm.ip_addr,
            owner_users: vm.owner_users.clone(),
            tags: vm.tags.clone(),
            secondary_ips: vm.secondary_ips.clone(),
            hypervisor_hostname: vm.hypervisor_hostname.clone(),
        }
    }
}

impl From<SerializableVm> for VmInfo {
    fn from(vm: SerializableVm) -> Self {
        VmInfo {
            ip_addr: vm.ip_addr,
            owner_users: vm.owner_users,
            tags: vm.tags,
            secondary_ips: vm.secondary_ips,
            hypervisor_hostname: vm.hypervisor_hostname,
        }
    }
}

/// In-memory reference `Storer` (component K). Optionally snapshots to a
/// JSON file on every write so a development daemon survives a restart.
pub struct InMemoryStorer {
    snapshot: RwLock<Snapshot>,
    snapshot_path: Option<PathBuf>,
}

impl InMemoryStorer {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryStorer {
            snapshot: RwLock::new(Snapshot::default()),
            snapshot_path: None,
        })
    }

    pub fn with_snapshot_path(path: PathBuf) -> Arc<Self> {
        Arc::new(InMemoryStorer {
            snapshot: RwLock::new(Snapshot::default()),
            snapshot_path: Some(path),
        })
    }

    /// Load a previously-persisted snapshot from disk, if one exists.
    pub async fn load(path: PathBuf) -> Result<Arc<Self>, StorerError> {
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorerError::Io(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(StorerError::Io(e.to_string())),
        };
        Ok(Arc::new(InMemoryStorer {
            snapshot: RwLock::new(snapshot),
            snapshot_path: Some(path),
        }))
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), StorerError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(|e| StorerError::Io(e.to_string()))?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| StorerError::Io(e.to_string()))
    }
}

#[async_trait]
impl IpStorer for InMemoryStorer {
    async fn add_ips_for_hypervisor(&self, hostname: &str, ips: &[Ipv4Addr]) -> Result<(), StorerError> {
        let mut snap = self.snapshot.write().await;
        let entry = snap.ips_by_hypervisor.entry(hostname.to_string()).or_default();
        for ip in ips {
            if !entry.contains(ip) {
                entry.push(*ip);
            }
        }
        self.persist(&snap).await
    }

    async fn check_ip_is_registered(&self, ip: Ipv4Addr) -> Result<bool, StorerError> {
        let snap = self.snapshot.read().await;
        Ok(snap.ips_by_hypervisor.values().any(|ips| ips.contains(&ip)))
    }

    async fn get_hypervisor_for_ip(&self, ip: Ipv4Addr) -> Result<Option<String>, StorerError> {
        let snap = self.snapshot.read().await;
        Ok(snap
            .ips_by_hypervisor
            .iter()
            .find(|(_, ips)| ips.contains(&ip))
            .map(|(hostname, _)| hostname.clone()))
    }

    async fn get_ips_for_hypervisor(&self, hostname: &str) -> Result<Vec<Ipv4Addr>, StorerError> {
        let snap = self.snapshot.read().await;
        Ok(snap.ips_by_hypervisor.get(hostname).cloned().unwrap_or_default())
    }

    async fn set_ips_for_hypervisor(&self, hostname: &str, ips: &[Ipv4Addr]) -> Result<(), StorerError> {
        let mut snap = self.snapshot.write().await;
        snap.ips_by_hypervisor.insert(hostname.to_string(), ips.to_vec());
        self.persist(&snap).await
    }

    async fn unregister_hypervisor(&self, hostname: &str) -> Result<(), StorerError> {
        let mut snap = self.snapshot.write().await;
        snap.ips_by_hypervisor.remove(hostname);
        snap.serials.remove(hostname);
        snap.tags.remove(hostname);
        snap.vms.remove(hostname);
        self.persist(&snap).await
    }
}

#[async_trait]
impl SerialStorer for InMemoryStorer {
    async fn read_machine_serial_number(&self, hostname: &str) -> Result<Option<String>, StorerError> {
        let snap = self.snapshot.read().await;
        Ok(snap.serials.get(hostname).cloned())
    }

    async fn write_machine_serial_number(&self, hostname: &str, serial: &str) -> Result<(), StorerError> {
        let mut snap = self.snapshot.write().await;
        snap.serials.insert(hostname.to_string(), serial.to_string());
        self.persist(&snap).await
    }
}

#[async_trait]
impl TagsStorer for InMemoryStorer {
    async fn read_machine_tags(&self, hostname: &str) -> Result<BTreeMap<String, String>, StorerError> {
        let snap = self.snapshot.read().await;
        Ok(snap.tags.get(hostname).cloned().unwrap_or_default())
    }

    async fn write_machine_tags(
        &self,
        hostname: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), StorerError> {
        let mut snap = self.snapshot.write().await;
        snap.tags.insert(hostname.to_string(), tags.clone());
        self.persist(&snap).await
    }
}

#[async_trait]
impl VmStorer for InMemoryStorer {
    async fn list_vms(&self, hostname: &str) -> Result<Vec<Ipv4Addr>, StorerError> {
        let snap = self.snapshot.read().await;
        Ok(snap
            .vms
            .get(hostname)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn read_vm(&self, hostname: &str, ip: Ipv4Addr) -> Result<Option<VmInfo>, StorerError> {
        let snap = self.snapshot.read().await;
        Ok(snap
            .vms
            .get(hostname)
            .and_then(|m| m.get(&ip))
            .cloned()
            .map(VmInfo::from))
    }

    async fn write_vm(&self, hostname: &str, ip: Ipv4Addr, vm: &VmInfo) -> Result<(), StorerError> {
        let mut snap = self.snapshot.write().await;
        snap.vms
            .entry(hostname.to_string())
            .or_default()
            .insert(ip, SerializableVm::from(vm));
        self.persist(&snap).await
    }

    async fn delete_vm(&self, hostname: &str, ip: Ipv4Addr) -> Result<(), StorerError> {
        let mut snap = self.snapshot.write().await;
        if let Some(m) = snap.vms.get_mut(hostname) {
            m.remove(&ip);
        }
        self.persist(&snap).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_registration_round_trips() {
        let storer = InMemoryStorer::new();
        let ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        assert!(!storer.check_ip_is_registered(ip).await.unwrap());
        storer.add_ips_for_hypervisor("h1", &[ip]).await.unwrap();
        assert!(storer.check_ip_is_registered(ip).await.unwrap());
        assert_eq!(storer.get_hypervisor_for_ip(ip).await.unwrap().as_deref(), Some("h1"));
    }

    #[tokio::test]
    async fn unregister_clears_all_four_sub_interfaces() {
        let storer = InMemoryStorer::new();
        let ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        storer.add_ips_for_hypervisor("h1", &[ip]).await.unwrap();
        storer.write_machine_serial_number("h1", "SN1").await.unwrap();
        storer.unregister_hypervisor("h1").await.unwrap();
        assert!(storer.get_ips_for_hypervisor("h1").await.unwrap().is_empty());
        assert_eq!(storer.read_machine_serial_number("h1").await.unwrap(), None);
    }
}
