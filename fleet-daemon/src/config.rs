//! Layered YAML + CLI-override configuration for the daemon binary
//! (component I).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::Args;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub topology: TopologyConfig,
    pub ipmi: IpmiConfig,
    pub probe: ProbeConfig,
    pub notifier: NotifierConfig,
    pub storer: StorerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            topology: TopologyConfig::default(),
            ipmi: IpmiConfig::default(),
            probe: ProbeConfig::default(),
            notifier: NotifierConfig::default(),
            storer: StorerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(anyhow::anyhow!("config file not found: {}", path.display()));
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content).with_context(|| "parsing config file")?;
        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref grpc_listen) = args.grpc_listen {
            self.server.grpc_listen_address = grpc_listen.clone();
        }
        if let Some(ref http_listen) = args.http_listen {
            self.server.http_listen_address = http_listen.clone();
        }
        if let Some(ref topology_path) = args.topology {
            self.topology.source_path = topology_path.clone();
        }
        self
    }
}

/// gRPC + HTTP listen addresses (component L).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub grpc_listen_address: String,
    pub http_listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            grpc_listen_address: "0.0.0.0:9443".to_string(),
            http_listen_address: "0.0.0.0:9080".to_string(),
        }
    }
}

/// Where the topology tree is loaded from. Reloaded on SIGHUP or an
/// `UpdateTopology` RPC; the YAML grammar itself is outside the core crate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub source_path: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        TopologyConfig {
            source_path: "/etc/fleet-manager/topology.yaml".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IpmiConfig {
    pub username: String,
    pub password_file: String,
}

impl Default for IpmiConfig {
    fn default() -> Self {
        IpmiConfig {
            username: "admin".to_string(),
            password_file: "/etc/fleet-manager/ipmi_password".to_string(),
        }
    }
}

/// Probe worker tuning (§4.2): dial timeout, backoff floor/cap, and the
/// IPMI re-probe interval `T_ipmi` (§6).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub dial_timeout_secs: u64,
    pub backoff_floor_ms: u64,
    pub backoff_cap_secs: u64,
    pub ipmi_reprobe_interval_secs: u64,
    /// Whether a disconnecting authoritative hypervisor automatically
    /// releases a contested IP for reassignment (§9).
    pub reassign_on_disconnect: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            dial_timeout_secs: 5,
            backoff_floor_ms: 500,
            backoff_cap_secs: 60,
            ipmi_reprobe_interval_secs: 300,
            reassign_on_disconnect: false,
        }
    }
}

/// Per-subscriber notifier buffer depth (§4.6).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub subscriber_buffer_depth: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        NotifierConfig {
            subscriber_buffer_depth: 256,
        }
    }
}

/// Reference `Storer` snapshot path (component K). When unset the daemon
/// runs with a purely in-memory store that does not survive a restart.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorerConfig {
    pub snapshot_path: Option<PathBuf>,
}

impl Default for StorerConfig {
    fn default() -> Self {
        StorerConfig { snapshot_path: None }
    }
}
