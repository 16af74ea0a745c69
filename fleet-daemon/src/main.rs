//! # Fleet Manager Daemon
//!
//! The daemon binary wires the fleet manager engine (`fleet-manager`) to
//! external clients: a `tonic` gRPC server exposing the manager façade and
//! an `axum` HTTP server for the status page and liveness/metrics.
//!
//! ## Usage
//! ```bash
//! fleet-daemon --config /etc/fleet-manager/daemon.yaml
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod grpc;
mod http_server;
mod server;
mod topology_loader;
mod topology_wire;

use cli::Args;
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.log_json {
        fleet_common::init_logging_json(&args.log_level)?;
    } else {
        fleet_common::init_logging(&args.log_level)?;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting fleet manager daemon");

    let config = match Config::load(&args.config) {
        Ok(cfg) => {
            info!(config_path = %args.config, "configuration loaded");
            cfg
        }
        Err(_) if args.config == "/etc/fleet-manager/daemon.yaml" => {
            info!("no config file found, using defaults");
            Config::default()
        }
        Err(e) => {
            error!(error = %e, path = %args.config, "failed to load configuration");
            return Err(e);
        }
    };

    let config = config.with_cli_overrides(&args);

    info!(
        grpc_listen = %config.server.grpc_listen_address,
        http_listen = %config.server.http_listen_address,
        topology = %config.topology.source_path,
        "daemon configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "server failed");
        return Err(e);
    }

    Ok(())
}
