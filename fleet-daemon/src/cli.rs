//! Command-line argument parsing.

use clap::Parser;

/// Fleet Manager Daemon - hypervisor fleet registry, probe, and migration service
#[derive(Parser, Debug)]
#[command(name = "fleet-daemon")]
#[command(about = "Fleet Manager Daemon - hypervisor fleet registry, probe, and migration service")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/fleet-manager/daemon.yaml")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit structured JSON logs instead of human-readable text
    #[arg(long)]
    pub log_json: bool,

    /// Listen address for the gRPC server
    #[arg(long)]
    pub grpc_listen: Option<String>,

    /// Listen address for the HTTP status/metrics server
    #[arg(long)]
    pub http_listen: Option<String>,

    /// Path to the YAML topology source
    #[arg(long)]
    pub topology: Option<String>,
}
