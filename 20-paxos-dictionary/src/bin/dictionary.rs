//! Runs replicas or the coordinating shell.
//!
//! Start five replicas in one process and connect a shell to them:
//! ```bash
//! cargo run --bin dictionary -- cluster --replicas 5 --base-port 2000
//! cargo run --bin dictionary -- client --warm-up
//! ```
//!
//! Or run each replica as its own process:
//! ```bash
//! cargo run --bin dictionary -- replica --listen 127.0.0.1:2000
//! ```

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use paxos_dictionary::cli::{Cli, ClusterArgs, Command};
use paxos_dictionary::client;
use paxos_dictionary::config::ClusterConfig;
use paxos_dictionary::runtime::ReplicaServer;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Replica(args) => {
            let server = ReplicaServer::bind(&args.listen.to_string()).await?;
            info!("replica listening on {}", server.local_addr()?);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("replica exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Cluster(args) => run_cluster(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn run_cluster(args: ClusterArgs) -> Result<()> {
    let addrs = ClusterConfig::consecutive(&args.host, args.base_port, args.replicas)?;
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut servers = Vec::with_capacity(addrs.len());
    for addr in &addrs {
        let server = ReplicaServer::bind(addr).await?;
        info!("replica listening on {}", server.local_addr()?);
        let mut stop = stop_rx.clone();
        servers.push(tokio::spawn(server.run_until(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })));
    }

    tokio::signal::ctrl_c().await?;
    info!("stopping {} replicas", servers.len());
    let _ = stop_tx.send(true);
    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("replica exited with error: {err:?}"),
            Err(err) => warn!("replica task failed: {err:?}"),
        }
    }
    Ok(())
}
