use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueHint};

use crate::config::ClusterConfig;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_BASE_PORT: u16 = 2000;
pub const DEFAULT_REPLICAS: u16 = 5;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve a single replica over TCP.
    Replica(ReplicaArgs),
    /// Serve several replicas on consecutive ports from one process.
    Cluster(ClusterArgs),
    /// Coordinate writes across the replicas from an interactive shell.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ReplicaArgs {
    /// Socket address the replica should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:2000")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Number of replicas to start.
    #[arg(long, default_value_t = DEFAULT_REPLICAS)]
    pub replicas: u16,

    /// Port of the first replica; the rest follow consecutively.
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    pub base_port: u16,

    #[arg(long, default_value = DEFAULT_HOST, value_hint = ValueHint::Hostname)]
    pub host: String,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Comma-separated replica addresses. Defaults to five replicas on
    /// consecutive ports from 127.0.0.1:2000.
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    pub replica: Vec<String>,

    /// JSON config file; flags given on the command line take precedence.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Per-call timeout for replica requests, in milliseconds.
    #[arg(long)]
    pub call_timeout_ms: Option<u64>,

    /// Reconciler heartbeat period, in milliseconds.
    #[arg(long)]
    pub heartbeat_interval_ms: Option<u64>,

    /// Run five PUT/GET/DELETE rounds before opening the shell.
    #[arg(long)]
    pub warm_up: bool,
}

impl ClientArgs {
    /// Merges the config file, the command-line overrides and the defaults.
    pub fn cluster_config(&self) -> Result<ClusterConfig> {
        let mut config = match &self.config {
            Some(path) => ClusterConfig::load(path)?,
            None => ClusterConfig::default(),
        };
        if !self.replica.is_empty() {
            config.replicas = self.replica.clone();
        }
        if config.replicas.is_empty() {
            config.replicas =
                ClusterConfig::consecutive(DEFAULT_HOST, DEFAULT_BASE_PORT, DEFAULT_REPLICAS)?;
        }
        if let Some(ms) = self.call_timeout_ms {
            config.call_timeout_ms = ms;
        }
        if let Some(ms) = self.heartbeat_interval_ms {
            config.heartbeat_interval_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }
}
