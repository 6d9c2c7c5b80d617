//! Interactive shell that coordinates writes across the replicas.
//!
//! [`run`] connects to every configured replica, starts the reconciler in the
//! background and then reads commands from stdin until EXIT, end of input or
//! ctrl-c. [`handle_line`] holds the per-line behavior and does no terminal
//! I/O of its own.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::select;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::cli::ClientArgs;
use crate::cluster::{Cluster, Connector};
use crate::learner::Learner;
use crate::proposer::Coordinator;
use crate::protocol::{ConsoleCommand, USAGE};
use crate::reconciler::Reconciler;
use crate::transport::TcpConnector;

/// Output of one shell line, and whether the shell should keep going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellReply {
    Continue(Vec<String>),
    Exit(Vec<String>),
}

impl ShellReply {
    pub fn lines(&self) -> &[String] {
        match self {
            ShellReply::Continue(lines) | ShellReply::Exit(lines) => lines,
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let config = args.cluster_config()?;
    let connector: Arc<dyn Connector> = Arc::new(TcpConnector);
    let cluster = Arc::new(Cluster::connect(connector.as_ref(), &config.replicas, config.call_timeout()).await?);
    let learner = Arc::new(Learner::new());
    let coordinator = Coordinator::new(
        Arc::clone(&cluster),
        Arc::clone(&learner),
        config.call_timeout(),
    );

    let reconciler = Reconciler::new(
        cluster,
        learner,
        connector,
        config.heartbeat_interval(),
        config.call_timeout(),
    );
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let heartbeat = tokio::spawn(reconciler.run_until(async move {
        let _ = stop_rx.await;
    }));

    if args.warm_up {
        write_lines(&warm_up(&coordinator).await).await?;
    }
    write_lines(&[format!("ready. Commands: {USAGE}")]).await?;

    let result = shell_loop(&coordinator).await;

    let _ = stop_tx.send(());
    if let Err(err) = heartbeat.await {
        warn!(error = ?err, "reconciler task failed");
    }
    result
}

async fn shell_loop(coordinator: &Coordinator) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    info!("end of input");
                    break;
                }
                if input.trim().is_empty() {
                    continue;
                }
                let reply = handle_line(coordinator, &input).await;
                write_lines(reply.lines()).await?;
                if matches!(reply, ShellReply::Exit(_)) {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

/// Parses and executes one line of shell input.
pub async fn handle_line(coordinator: &Coordinator, line: &str) -> ShellReply {
    let command = match ConsoleCommand::parse(line) {
        Ok(command) => command,
        Err(err) => return ShellReply::Continue(vec![format!("error: {err}")]),
    };

    let lines = match command {
        ConsoleCommand::Put { key, value } => vec![coordinator.put(key, value).await.to_string()],
        ConsoleCommand::Delete { key } => vec![coordinator.delete(key).await.to_string()],
        ConsoleCommand::Get { key } => vec![coordinator.read(&key).await.to_string()],
        ConsoleCommand::Status => status_lines(coordinator),
        ConsoleCommand::Help => help_lines(),
        ConsoleCommand::Exit => return ShellReply::Exit(vec!["bye".to_string()]),
    };
    ShellReply::Continue(lines)
}

/// Five put/get/delete rounds on keys 1000..=5000, one output line per step.
pub async fn warm_up(coordinator: &Coordinator) -> Vec<String> {
    let mut lines = vec!["warm-up start".to_string()];
    for i in 1..=5i64 {
        let key = (i * 1000).to_string();
        let value = (i * -20).to_string();
        lines.push(format!("PUT {key} {value}: {}", coordinator.put(key.as_str(), value.as_str()).await));
        lines.push(format!("GET {key}: {}", coordinator.read(&key).await));
        lines.push(format!("DELETE {key}: {}", coordinator.delete(key.as_str()).await));
    }
    lines.push("warm-up end".to_string());
    lines
}

fn status_lines(coordinator: &Coordinator) -> Vec<String> {
    let cluster = coordinator.cluster();
    let mut lines = vec![format!(
        "{} replicas, quorum {}",
        cluster.len(),
        cluster.quorum()
    )];
    for (addr, reachable) in cluster.reachability() {
        let state = if reachable { "reachable" } else { "unreachable" };
        lines.push(format!("  {addr}: {state}"));
    }

    let learner = coordinator.learner();
    let canonical = learner.canonical();
    lines.push(format!(
        "{} proposals learned, {} keys",
        learner.learned().len(),
        canonical.len()
    ));
    for (key, value) in canonical {
        lines.push(format!("  {key} = {value}"));
    }
    lines
}

fn help_lines() -> Vec<String> {
    [
        "Commands (case-insensitive):",
        "  PUT <key> <value>  (alias: p)  -- insert a new key on a majority",
        "  GET <key>          (alias: g)  -- read from one replica",
        "  DELETE <key>       (alias: d)  -- remove an existing key on a majority",
        "  STATUS             (alias: s)  -- replica reachability and learned state",
        "  HELP               (alias: h)  -- show this message",
        "  EXIT               (alias: e)  -- leave the shell",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

async fn write_lines(lines: &[String]) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    for line in lines {
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await
}
