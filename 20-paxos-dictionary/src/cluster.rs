//! The coordinator's view of the replica set.
//!
//! A [`Cluster`] is a fixed list of [`Endpoint`]s, one per replica address.
//! Membership never changes; what changes is the handle behind an address,
//! which the reconciler swaps for a fresh one after reconnecting.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::{Result, ensure};
use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::command::Command;
use crate::replica::{AcceptReply, Promise, ProposalNumber, Replica, ReplicaError};

/// Establishes a fresh handle to the replica at `addr`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn Replica>, ReplicaError>;
}

/// Number of affirmative replies a round needs out of `total` replicas.
pub fn quorum(total: usize) -> usize {
    total / 2 + 1
}

/// A replica handle plus the address it was obtained from.
#[derive(Clone)]
pub struct Endpoint {
    pub addr: String,
    pub replica: Arc<dyn Replica>,
    pub reachable: bool,
}

impl Endpoint {
    pub fn new(replica: Arc<dyn Replica>) -> Self {
        Self {
            addr: replica.addr().to_string(),
            replica,
            reachable: true,
        }
    }

    /// Placeholder for an address that could not be reached yet.
    pub fn disconnected(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            replica: Arc::new(Disconnected {
                addr: addr.to_string(),
            }),
            reachable: false,
        }
    }
}

pub struct Cluster {
    endpoints: RwLock<Vec<Endpoint>>,
}

impl Cluster {
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self> {
        ensure!(!endpoints.is_empty(), "cluster requires at least one replica");
        Ok(Self {
            endpoints: RwLock::new(endpoints),
        })
    }

    /// Connects to every address concurrently, giving each attempt at most
    /// `call_timeout`. Addresses that cannot be reached start out disconnected
    /// and are left for the reconciler to pick up.
    pub async fn connect(
        connector: &dyn Connector,
        addrs: &[String],
        call_timeout: Duration,
    ) -> Result<Self> {
        let attempts = addrs.iter().map(|addr| async move {
            let connected = match timeout(call_timeout, connector.connect(addr)).await {
                Ok(connected) => connected,
                Err(_) => Err(ReplicaError::Timeout {
                    addr: addr.clone(),
                    after: call_timeout,
                }),
            };
            match connected {
                Ok(replica) => {
                    info!(%addr, "connected to replica");
                    Endpoint::new(replica)
                }
                Err(err) => {
                    warn!(%addr, error = %err, "replica unreachable at startup");
                    Endpoint::disconnected(addr)
                }
            }
        });
        Self::new(join_all(attempts).await)
    }

    /// Snapshot of the current endpoints.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn quorum(&self) -> usize {
        quorum(self.len())
    }

    /// Reachability per address.
    pub fn reachability(&self) -> BTreeMap<String, bool> {
        self.read()
            .iter()
            .map(|endpoint| (endpoint.addr.clone(), endpoint.reachable))
            .collect()
    }

    pub fn mark_unreachable(&self, addr: &str) {
        let mut endpoints = self.write();
        if let Some(endpoint) = endpoints.iter_mut().find(|e| e.addr == addr) {
            endpoint.reachable = false;
        }
    }

    pub fn mark_reachable(&self, addr: &str) {
        let mut endpoints = self.write();
        if let Some(endpoint) = endpoints.iter_mut().find(|e| e.addr == addr) {
            if !endpoint.reachable {
                info!(%addr, "replica reachable again");
            }
            endpoint.reachable = true;
        }
    }

    /// Swaps in a freshly connected handle for `addr`.
    pub fn replace(&self, replica: Arc<dyn Replica>) {
        let fresh = Endpoint::new(replica);
        let mut endpoints = self.write();
        if let Some(slot) = endpoints.iter_mut().find(|e| e.addr == fresh.addr) {
            *slot = fresh;
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Endpoint>> {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Endpoint>> {
        self.endpoints.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stand-in handle that fails every call.
struct Disconnected {
    addr: String,
}

impl Disconnected {
    fn fail(&self) -> ReplicaError {
        ReplicaError::unreachable(&self.addr, "not connected")
    }
}

#[async_trait]
impl Replica for Disconnected {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn promise(&self, _proposal: ProposalNumber) -> Result<Promise, ReplicaError> {
        Err(self.fail())
    }

    async fn accept(
        &self,
        _proposal: ProposalNumber,
        _command: &Command,
    ) -> Result<AcceptReply, ReplicaError> {
        Err(self.fail())
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, ReplicaError> {
        Err(self.fail())
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, String>, ReplicaError> {
        Err(self.fail())
    }

    async fn update_dictionary(
        &self,
        _dictionary: BTreeMap<String, String>,
    ) -> Result<(), ReplicaError> {
        Err(self.fail())
    }
}
