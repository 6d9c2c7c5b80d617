//! Networked replica server.
//!
//! A [`ReplicaServer`] owns one [`ReplicaNode`] and a TCP listener. Every
//! accepted connection gets its own task that answers requests in order until
//! the peer hangs up or the server shuts down. Requests from different
//! connections are served concurrently; the node does its own locking.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::message::{Request, Response, WirePrior, read_message, write_message};
use crate::node::ReplicaNode;
use crate::replica::{AcceptReply, Promise};

pub struct ReplicaServer {
    listener: TcpListener,
    node: Arc<ReplicaNode>,
}

impl ReplicaServer {
    pub fn new(listener: TcpListener, node: Arc<ReplicaNode>) -> Self {
        Self { listener, node }
    }

    /// Binds `addr` and serves a fresh replica named after the bound address.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let name = listener.local_addr()?.to_string();
        Ok(Self::new(listener, Arc::new(ReplicaNode::new(name))))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn node(&self) -> &Arc<ReplicaNode> {
        &self.node
    }

    /// Serves until `shutdown` resolves, then closes every open connection.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ReplicaServer { listener, node } = self;
        let (closed_tx, closed_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(replica = %node.name(), "replica server shutting down");
                    let _ = closed_tx.send(true);
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => spawn_connection(stream, peer, &node, closed_rx.clone()),
                        Err(err) => warn!(error = ?err, "failed to accept connection"),
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    node: &Arc<ReplicaNode>,
    closed: watch::Receiver<bool>,
) {
    let node = Arc::clone(node);
    tokio::spawn(async move {
        debug!(%peer, "connection opened");
        match serve_connection(stream, &node, closed).await {
            Ok(()) => debug!(%peer, "connection closed"),
            Err(err) => warn!(%peer, error = ?err, "connection closed with error"),
        }
    });
}

async fn serve_connection(
    stream: TcpStream,
    node: &ReplicaNode,
    mut closed: watch::Receiver<bool>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let request = select! {
            biased;
            _ = closed.changed() => return Ok(()),
            request = read_message::<_, Request>(&mut reader) => request,
        };
        let response = match request {
            Ok(Some(request)) => dispatch(node, request),
            Ok(None) => return Ok(()),
            Err(err) => {
                let reply = Response::Error {
                    message: err.to_string(),
                };
                write_message(&mut writer, &reply).await?;
                return Err(err.into());
            }
        };
        write_message(&mut writer, &response).await?;
    }
}

fn dispatch(node: &ReplicaNode, request: Request) -> Response {
    match request {
        Request::Promise { proposal } => match node.promise(proposal) {
            Promise::Granted { prior } => Response::Promised {
                prior: prior.map(|prior| WirePrior {
                    proposal: prior.proposal,
                    command: prior.command.encode(),
                }),
            },
            Promise::Refused { promised } => Response::PromiseRefused { promised },
        },
        Request::Accept { proposal, command } => match node.accept_encoded(proposal, &command) {
            AcceptReply::Done { proposal } => Response::Done { proposal },
            AcceptReply::Refused(refusal) => Response::Refused { refusal },
        },
        Request::Get { key } => Response::Value {
            value: node.get(&key),
        },
        Request::Snapshot => Response::Snapshot {
            dictionary: node.snapshot(),
        },
        Request::UpdateDictionary { dictionary } => {
            node.update_dictionary(dictionary);
            Response::Ack
        }
    }
}
