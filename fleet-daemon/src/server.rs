//! Daemon wiring (component M): load config, construct the `Storer`,
//! construct the `Manager`, load the initial topology, serve gRPC + HTTP,
//! and reload the topology on SIGHUP.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tonic::transport::Server;
use tracing::{error, info, warn};

use fleet_manager::manager::{ManagerConfig, StartOptions};
use fleet_manager::{InMemoryStorer, Manager, NullHypervisorRpcConnector, NullIpmiClient};
use fleet_proto::v1::FleetManagerServiceServer;

use crate::config::Config;
use crate::grpc::FleetManagerGrpc;
use crate::{http_server, topology_loader};

pub async fn run(config: Config) -> Result<()> {
    let storer = match &config.storer.snapshot_path {
        Some(path) => match InMemoryStorer::load(path.clone()).await {
            Ok(storer) => storer,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "no existing storer snapshot, starting empty");
                InMemoryStorer::with_snapshot_path(path.clone())
            }
        },
        None => InMemoryStorer::new(),
    };

    let manager_config = ManagerConfig {
        dial_timeout: Duration::from_secs(config.probe.dial_timeout_secs),
        backoff_floor: Duration::from_millis(config.probe.backoff_floor_ms),
        backoff_cap: Duration::from_secs(config.probe.backoff_cap_secs),
        ipmi_reprobe_interval: Duration::from_secs(config.probe.ipmi_reprobe_interval_secs),
        subscriber_buffer_depth: config.notifier.subscriber_buffer_depth,
        reassign_on_disconnect: config.probe.reassign_on_disconnect,
    };

    let manager = Manager::new(StartOptions {
        ipmi_username: config.ipmi.username.clone(),
        ipmi_password_file: PathBuf::from(&config.ipmi.password_file),
        storer,
        connector: Arc::new(NullHypervisorRpcConnector),
        ipmi: Arc::new(NullIpmiClient),
        config: manager_config,
    })
    .await
    .context("constructing fleet manager")?;
    let manager = Arc::new(manager);

    load_topology(&manager, &config.topology.source_path).await;

    #[cfg(unix)]
    spawn_sighup_reloader(manager.clone(), config.topology.source_path.clone());

    let grpc_addr = config
        .server
        .grpc_listen_address
        .parse()
        .with_context(|| format!("invalid grpc listen address: {}", config.server.grpc_listen_address))?;
    let http_addr = config
        .server
        .http_listen_address
        .parse()
        .with_context(|| format!("invalid http listen address: {}", config.server.http_listen_address))?;

    let http_manager = manager.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http_server::run(http_addr, http_manager).await {
            error!(error = %err, "http status/metrics server failed");
        }
    });

    info!(address = %grpc_addr, "starting grpc server");
    let service = FleetManagerGrpc::new(manager);
    let grpc_result = Server::builder()
        .add_service(FleetManagerServiceServer::new(service))
        .serve(grpc_addr)
        .await;

    http_handle.abort();
    grpc_result.context("grpc server error")?;
    Ok(())
}

async fn load_topology(manager: &Arc<Manager>, path: &str) {
    match topology_loader::load(path) {
        Ok(topology) => {
            info!(path = %path, machines = topology.machines().count(), "loaded topology");
            manager.update_topology(topology).await;
        }
        Err(err) => {
            warn!(error = %err, path = %path, "no topology loaded at startup, starting with an empty fleet");
        }
    }
}

#[cfg(unix)]
fn spawn_sighup_reloader(manager: Arc<Manager>, topology_path: String) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, "failed to install SIGHUP handler, topology reload via signal disabled");
                return;
            }
        };
        loop {
            sighup.recv().await;
            info!("received SIGHUP, reloading topology");
            load_topology(&manager, &topology_path).await;
        }
    });
}
