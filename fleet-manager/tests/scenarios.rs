//! Integration tests for the scenarios in §8 of the design spec, run
//! against the reference `Storer` and mock `HypervisorRpc`/`IpmiClient`.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use fleet_manager::hypervisor_rpc::{DialError, VmUpdate};
use fleet_manager::manager::{AuthInfo, HypervisorFilter, ManagerConfig, StartOptions};
use fleet_manager::notifier::Update;
use fleet_manager::registry::VmInfo;
use fleet_manager::storer::InMemoryStorer;
use fleet_manager::testing::{MockConnector, MockHypervisorRpc, MockIpmiClient};
use fleet_manager::topology::{LocationNode, Machine, Subnet, Topology};
use fleet_manager::Manager;

fn password_file() -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), "hunter2").unwrap();
    file
}

fn test_config() -> ManagerConfig {
    ManagerConfig {
        dial_timeout: Duration::from_millis(200),
        backoff_floor: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(50),
        ipmi_reprobe_interval: Duration::from_millis(50),
        subscriber_buffer_depth: 16,
        reassign_on_disconnect: false,
    }
}

async fn make_manager(
    connector: std::sync::Arc<MockConnector>,
) -> (Manager, std::sync::Arc<InMemoryStorer>, tempfile::NamedTempFile) {
    let pw = password_file();
    let storer = InMemoryStorer::new();
    let manager = Manager::new(StartOptions {
        ipmi_username: "admin".to_string(),
        ipmi_password_file: pw.path().to_path_buf(),
        storer: storer.clone(),
        connector,
        ipmi: MockIpmiClient::new(),
        config: test_config(),
    })
    .await
    .unwrap();
    (manager, storer, pw)
}

fn machine(hostname: &str, ip: &str, location: &str) -> Machine {
    Machine {
        hostname: hostname.to_string(),
        primary_ip: ip.parse().unwrap(),
        ipmi_ip: None,
        owner_users: BTreeSet::from(["alice".to_string()]),
        tags: BTreeMap::new(),
        location: location.to_string(),
    }
}

fn topology_with(machines: Vec<Machine>, subnets: Vec<(&str, Subnet)>) -> Topology {
    let mut t = Topology::empty();
    for m in machines {
        t.locations.entry(m.location.clone()).or_insert_with(LocationNode::default).machines.push(m);
    }
    for (location, subnet) in subnets {
        t.locations.entry(location.to_string()).or_insert_with(LocationNode::default).subnets.push(subnet);
    }
    t
}

fn vm(ip: Ipv4Addr, hostname: &str) -> VmInfo {
    VmInfo {
        ip_addr: ip,
        owner_users: BTreeSet::new(),
        tags: BTreeMap::new(),
        secondary_ips: vec![],
        hypervisor_hostname: hostname.to_string(),
    }
}

/// Poll `check` until it resolves `true` or `timeout` elapses.
async fn wait_until<Fut>(mut check: impl FnMut() -> Fut, timeout: Duration)
where
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    loop {
        if check().await {
            return;
        }
        if start.elapsed() > timeout {
            panic!("condition not reached within timeout");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_connected(manager: &Manager, hostname: &str) {
    wait_until(
        || async move {
            manager
                .get_machine_info(hostname)
                .await
                .map(|i| i.probe_status == fleet_manager::ProbeStatus::Connected)
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;
}

#[tokio::test]
async fn s1_register_and_probe() {
    let connector = MockConnector::new();
    let h1_ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
    let rpc = MockHypervisorRpc::new(vec![]);
    connector.register(h1_ip, rpc);

    let (manager, _storer, _pw) = make_manager(connector).await;
    let mut sub = manager.make_update_channel("dc1").await;

    let topology = topology_with(vec![machine("h1", "10.0.0.1", "dc1/r1")], vec![]);
    manager.update_topology(topology).await;

    assert!(matches!(sub.receiver.recv().await, Some(Update::Snapshot(_))));

    wait_connected(&manager, "h1").await;

    let info = manager.get_machine_info("h1").await.unwrap();
    assert_eq!(info.probe_status, fleet_manager::ProbeStatus::Connected);
}

#[tokio::test]
async fn s2_vm_appears() {
    let connector = MockConnector::new();
    let h1_ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
    let rpc = MockHypervisorRpc::new(vec![]);
    connector.register(h1_ip, rpc.clone());

    let (manager, _storer, _pw) = make_manager(connector).await;
    let topology = topology_with(vec![machine("h1", "10.0.0.1", "dc1/r1")], vec![]);
    manager.update_topology(topology).await;
    wait_connected(&manager, "h1").await;

    let vm_ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
    rpc.push_update(VmUpdate::Added(vm(vm_ip, "h1")));

    wait_until(
        || async { manager.get_hypervisor_for_vm(vm_ip).await.is_ok() },
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(manager.get_hypervisor_for_vm(vm_ip).await.unwrap(), "h1");
    let info = manager.get_machine_info("h1").await.unwrap();
    assert!(info.vm_ips.contains(&vm_ip));
}

#[tokio::test]
async fn s3_duplicate_ip_rejected() {
    let connector = MockConnector::new();
    let h1_ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
    let h2_ip: Ipv4Addr = "10.0.0.2".parse().unwrap();
    let rpc1 = MockHypervisorRpc::new(vec![]);
    let rpc2 = MockHypervisorRpc::new(vec![]);
    connector.register(h1_ip, rpc1.clone());
    connector.register(h2_ip, rpc2.clone());

    let (manager, _storer, _pw) = make_manager(connector).await;
    let topology = topology_with(
        vec![machine("h1", "10.0.0.1", "dc1/r1"), machine("h2", "10.0.0.2", "dc1/r1")],
        vec![],
    );
    manager.update_topology(topology).await;
    wait_connected(&manager, "h1").await;
    wait_connected(&manager, "h2").await;

    let vm_ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
    rpc1.push_update(VmUpdate::Added(vm(vm_ip, "h1")));
    wait_until(
        || async { manager.get_hypervisor_for_vm(vm_ip).await.is_ok() },
        Duration::from_secs(2),
    )
    .await;

    rpc2.push_update(VmUpdate::Added(vm(vm_ip, "h2")));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // invariant 1: global map still points at h1, the first claimant.
    assert_eq!(manager.get_hypervisor_for_vm(vm_ip).await.unwrap(), "h1");
    let h2_info = manager.get_machine_info("h2").await.unwrap();
    assert!(h2_info.vm_ips.contains(&vm_ip), "h2's own map still reflects its report");
}

#[tokio::test]
async fn s4_migration_succeeds() {
    let connector = MockConnector::new();
    let h1_ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
    let h2_ip: Ipv4Addr = "10.0.0.2".parse().unwrap();
    let rpc1 = MockHypervisorRpc::new(vec![]);
    let rpc2 = MockHypervisorRpc::new(vec![]);
    connector.register(h1_ip, rpc1.clone());
    connector.register(h2_ip, rpc2.clone());

    let (manager, storer, _pw) = make_manager(connector).await;
    let topology = topology_with(
        vec![machine("h1", "10.0.0.1", "dc1/r1"), machine("h2", "10.0.0.2", "dc1/r1")],
        vec![],
    );
    manager.update_topology(topology).await;
    wait_connected(&manager, "h1").await;
    wait_connected(&manager, "h2").await;

    let vm_ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
    rpc1.push_update(VmUpdate::Added(vm(vm_ip, "h1")));
    wait_until(
        || async { manager.get_hypervisor_for_vm(vm_ip).await.is_ok() },
        Duration::from_secs(2),
    )
    .await;

    let results = manager.move_ip_addresses("h2", vec![vm_ip]).await;
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_ok());

    assert_eq!(manager.get_hypervisor_for_vm(vm_ip).await.unwrap(), "h2");
    let h1_info = manager.get_machine_info("h1").await.unwrap();
    assert!(!h1_info.vm_ips.contains(&vm_ip));
    let h2_info = manager.get_machine_info("h2").await.unwrap();
    assert!(h2_info.vm_ips.contains(&vm_ip));

    assert!(storer.read_vm("h2", vm_ip).await.unwrap().is_some());
    assert!(storer.read_vm("h1", vm_ip).await.unwrap().is_none());
}

#[tokio::test]
async fn s5_migration_rollback_on_surrender_failure() {
    let connector = MockConnector::new();
    let h1_ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
    let h2_ip: Ipv4Addr = "10.0.0.2".parse().unwrap();
    let rpc1 = MockHypervisorRpc::new(vec![]);
    let rpc2 = MockHypervisorRpc::new(vec![]);
    rpc1.fail_surrender.store(true, std::sync::atomic::Ordering::Relaxed);
    connector.register(h1_ip, rpc1.clone());
    connector.register(h2_ip, rpc2.clone());

    let (manager, _storer, _pw) = make_manager(connector).await;
    let topology = topology_with(
        vec![machine("h1", "10.0.0.1", "dc1/r1"), machine("h2", "10.0.0.2", "dc1/r1")],
        vec![],
    );
    manager.update_topology(topology).await;
    wait_connected(&manager, "h1").await;
    wait_connected(&manager, "h2").await;

    let vm_ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
    rpc1.push_update(VmUpdate::Added(vm(vm_ip, "h1")));
    wait_until(
        || async { manager.get_hypervisor_for_vm(vm_ip).await.is_ok() },
        Duration::from_secs(2),
    )
    .await;

    let results = manager.move_ip_addresses("h2", vec![vm_ip]).await;
    assert_eq!(results.len(), 1);
    assert!(matches!(
        results[0].1,
        Err(fleet_manager::FleetError::MigrationCommitFailed(_))
    ));

    // state identical to pre-migration.
    assert_eq!(manager.get_hypervisor_for_vm(vm_ip).await.unwrap(), "h1");
    let h2_info = manager.get_machine_info("h2").await.unwrap();
    assert!(!h2_info.vm_ips.contains(&vm_ip));
    assert_eq!(rpc2.discarded.lock().unwrap().as_slice(), &[vm_ip]);
}

#[tokio::test]
async fn s6_topology_shrink_removes_hypervisor() {
    let connector = MockConnector::new();
    let h1_ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
    let rpc = MockHypervisorRpc::new(vec![]);
    connector.register(h1_ip, rpc.clone());

    let (manager, _storer, _pw) = make_manager(connector).await;
    let mut sub = manager.make_update_channel("dc1").await;
    let topology = topology_with(vec![machine("h1", "10.0.0.1", "dc1/r1")], vec![]);
    manager.update_topology(topology).await;
    assert!(matches!(sub.receiver.recv().await, Some(Update::Snapshot(_))));
    wait_connected(&manager, "h1").await;

    let vm_ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
    rpc.push_update(VmUpdate::Added(vm(vm_ip, "h1")));
    wait_until(
        || async { manager.get_hypervisor_for_vm(vm_ip).await.is_ok() },
        Duration::from_secs(2),
    )
    .await;

    manager.update_topology(Topology::empty()).await;

    wait_until(
        || async { manager.get_machine_info("h1").await.is_err() },
        Duration::from_secs(2),
    )
    .await;

    assert!(manager.get_hypervisor_for_vm(vm_ip).await.is_err());

    let mut saw_removed = false;
    while let Ok(Some(update)) =
        tokio::time::timeout(Duration::from_millis(200), sub.receiver.recv()).await
    {
        if matches!(update, Update::HypervisorRemoved { ref hostname } if hostname == "h1") {
            saw_removed = true;
            break;
        }
    }
    assert!(saw_removed);
}

#[tokio::test]
async fn update_topology_is_idempotent() {
    let connector = MockConnector::new();
    let (manager, _storer, _pw) = make_manager(connector).await;
    let topology = topology_with(vec![machine("h1", "10.0.0.1", "dc1/r1")], vec![]);
    manager.update_topology(topology.clone()).await;
    let first = manager.get_topology().await;
    manager.update_topology(topology).await;
    let second = manager.get_topology().await;
    assert_eq!(*first, *second);
}

#[tokio::test]
async fn change_machine_tags_requires_ownership() {
    let connector = MockConnector::new();
    let (manager, _storer, _pw) = make_manager(connector).await;
    let topology = topology_with(vec![machine("h1", "10.0.0.1", "dc1/r1")], vec![]);
    manager.update_topology(topology).await;

    let mut tags = BTreeMap::new();
    tags.insert("env".to_string(), "prod".to_string());

    let err = manager
        .change_machine_tags("h1", &AuthInfo { user: "mallory".to_string() }, tags.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, fleet_manager::FleetError::NotOwner));

    manager
        .change_machine_tags("h1", &AuthInfo { user: "alice".to_string() }, tags.clone())
        .await
        .unwrap();
    let info = manager.get_machine_info("h1").await.unwrap();
    assert_eq!(info.tags, tags);
}

#[tokio::test]
async fn list_hypervisors_filters_by_connected_status() {
    let connector = MockConnector::new();
    connector.set_dial_failure("10.0.0.1".parse().unwrap(), DialError::Unreachable);
    let (manager, _storer, _pw) = make_manager(connector).await;
    let topology = topology_with(vec![machine("h1", "10.0.0.1", "dc1/r1")], vec![]);
    manager.update_topology(topology).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let all = manager.list_hypervisors_in_location("dc1", HypervisorFilter::default()).await;
    assert_eq!(all, vec!["h1".to_string()]);
    let connected = manager
        .list_hypervisors_in_location("dc1", HypervisorFilter { connected_only: true })
        .await;
    assert!(connected.is_empty());
}
