//! Concurrent engine tracking a fleet of hypervisors: topology, IP/VM
//! registry, migration, and a location-scoped notifier bus, behind a
//! single synchronization root (`Manager`).

pub mod error;
pub mod hypervisor_rpc;
pub mod ipmi;
pub mod manager;
pub mod migration;
pub mod notifier;
pub mod probe;
pub mod reconciler;
pub mod registry;
pub mod storer;
pub mod subnet;
pub mod testing;
pub mod topology;

pub use error::{FleetError, Result};
pub use hypervisor_rpc::NullHypervisorRpcConnector;
pub use ipmi::NullIpmiClient;
pub use manager::{AuthInfo, HypervisorFilter, Manager, ManagerConfig, MachineInfo, StartOptions};
pub use registry::ProbeStatus;
pub use storer::InMemoryStorer;
pub use topology::{LocationNode, Machine, Subnet, Topology};
