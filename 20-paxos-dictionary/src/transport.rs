//! Networked client side of the replica protocol.
//!
//! A [`TcpReplica`] holds one connection to a [`crate::runtime::ReplicaServer`]
//! and sends requests over it one at a time. The connection is taken out of
//! its slot for the duration of a call and only put back once the reply has
//! been read. A call that fails, or that is cancelled by a timeout halfway
//! through, therefore leaves the handle without a connection: every later
//! call reports the replica unreachable until the reconciler replaces the
//! handle with a freshly connected one.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cluster::Connector;
use crate::command::{Command, MalformedCommand};
use crate::message::{Request, Response, WirePrior, read_message, write_message};
use crate::replica::{AcceptReply, PriorAccept, Promise, ProposalNumber, Replica, ReplicaError};

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub struct TcpReplica {
    addr: String,
    connection: Mutex<Option<Connection>>,
}

impl TcpReplica {
    pub async fn connect(addr: &str) -> Result<Self, ReplicaError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| ReplicaError::unreachable(addr, err))?;
        let (reader, writer) = stream.into_split();
        debug!(%addr, "connected");
        Ok(Self {
            addr: addr.to_string(),
            connection: Mutex::new(Some(Connection {
                reader: BufReader::new(reader),
                writer,
            })),
        })
    }

    async fn call(&self, request: &Request) -> Result<Response, ReplicaError> {
        let mut slot = self.connection.lock().await;
        let Some(mut connection) = slot.take() else {
            return Err(ReplicaError::unreachable(&self.addr, "connection lost"));
        };

        write_message(&mut connection.writer, request)
            .await
            .map_err(|err| ReplicaError::unreachable(&self.addr, err))?;
        let response = read_message::<_, Response>(&mut connection.reader)
            .await
            .map_err(|err| ReplicaError::unreachable(&self.addr, err))?
            .ok_or_else(|| ReplicaError::unreachable(&self.addr, "connection closed by replica"))?;

        *slot = Some(connection);
        match response {
            Response::Error { message } => Err(self.protocol(message)),
            response => Ok(response),
        }
    }

    fn protocol(&self, detail: impl ToString) -> ReplicaError {
        ReplicaError::Protocol {
            addr: self.addr.clone(),
            detail: detail.to_string(),
        }
    }

    fn unexpected(&self, response: Response) -> ReplicaError {
        self.protocol(format!("unexpected response {response:?}"))
    }
}

fn decode_prior(prior: WirePrior) -> Result<PriorAccept, MalformedCommand> {
    Ok(PriorAccept {
        proposal: prior.proposal,
        command: Command::decode(&prior.command)?,
    })
}

#[async_trait]
impl Replica for TcpReplica {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn promise(&self, proposal: ProposalNumber) -> Result<Promise, ReplicaError> {
        match self.call(&Request::Promise { proposal }).await? {
            Response::Promised { prior } => {
                // A garbled pending command cannot be re-driven; the promise
                // itself still counts.
                let prior = prior.and_then(|prior| match decode_prior(prior) {
                    Ok(prior) => Some(prior),
                    Err(err) => {
                        warn!(addr = %self.addr, error = %err, "dropping malformed pending command");
                        None
                    }
                });
                Ok(Promise::Granted { prior })
            }
            Response::PromiseRefused { promised } => Ok(Promise::Refused { promised }),
            other => Err(self.unexpected(other)),
        }
    }

    async fn accept(
        &self,
        proposal: ProposalNumber,
        command: &Command,
    ) -> Result<AcceptReply, ReplicaError> {
        let request = Request::Accept {
            proposal,
            command: command.encode(),
        };
        match self.call(&request).await? {
            Response::Done { proposal } => Ok(AcceptReply::Done { proposal }),
            Response::Refused { refusal } => Ok(AcceptReply::Refused(refusal)),
            other => Err(self.unexpected(other)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ReplicaError> {
        let request = Request::Get {
            key: key.to_string(),
        };
        match self.call(&request).await? {
            Response::Value { value } => Ok(value),
            other => Err(self.unexpected(other)),
        }
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, String>, ReplicaError> {
        match self.call(&Request::Snapshot).await? {
            Response::Snapshot { dictionary } => Ok(dictionary),
            other => Err(self.unexpected(other)),
        }
    }

    async fn update_dictionary(
        &self,
        dictionary: BTreeMap<String, String>,
    ) -> Result<(), ReplicaError> {
        match self.call(&Request::UpdateDictionary { dictionary }).await? {
            Response::Ack => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }
}

/// Opens a new TCP connection per [`Connector::connect`] call.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn Replica>, ReplicaError> {
        Ok(Arc::new(TcpReplica::connect(addr).await?))
    }
}
