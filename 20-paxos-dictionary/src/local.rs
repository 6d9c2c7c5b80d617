//! In-process transport.
//!
//! [`LocalNetwork`] hosts a set of [`ReplicaNode`]s keyed by address and hands
//! out [`LocalReplica`] handles to them. Each handle rides on its own link,
//! which the network can cut to simulate a partition or a crashed process.
//! A cut link never comes back; callers have to reconnect, just like with a
//! broken TCP connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::info;

use crate::cluster::Connector;
use crate::command::Command;
use crate::node::ReplicaNode;
use crate::replica::{AcceptReply, Promise, ProposalNumber, Replica, ReplicaError};

struct Site {
    node: Arc<ReplicaNode>,
    up: bool,
    links: Vec<Arc<AtomicBool>>,
}

impl Site {
    fn new(addr: &str) -> Self {
        Self {
            node: Arc::new(ReplicaNode::new(addr)),
            up: true,
            links: Vec::new(),
        }
    }

    fn cut_links(&mut self) {
        for link in self.links.drain(..) {
            link.store(false, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
pub struct LocalNetwork {
    sites: Mutex<HashMap<String, Site>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network with one fresh replica per address.
    pub fn with_replicas<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let network = Self::new();
        for addr in addrs {
            network.add_replica(addr);
        }
        network
    }

    pub fn add_replica(&self, addr: impl Into<String>) -> Arc<ReplicaNode> {
        let addr = addr.into();
        let site = Site::new(&addr);
        let node = Arc::clone(&site.node);
        self.sites().insert(addr, site);
        node
    }

    pub fn addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.sites().keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// The replica currently serving `addr`.
    pub fn node(&self, addr: &str) -> Option<Arc<ReplicaNode>> {
        self.sites().get(addr).map(|site| Arc::clone(&site.node))
    }

    /// Cuts every open link to `addr` and refuses new connections.
    pub fn partition(&self, addr: &str) {
        if let Some(site) = self.sites().get_mut(addr) {
            site.up = false;
            site.cut_links();
            info!(%addr, "replica partitioned");
        }
    }

    /// Accepts connections to `addr` again. Links cut earlier stay cut.
    pub fn heal(&self, addr: &str) {
        if let Some(site) = self.sites().get_mut(addr) {
            site.up = true;
            info!(%addr, "replica healed");
        }
    }

    /// Replaces the replica at `addr` with a fresh, empty one.
    pub fn restart(&self, addr: &str) {
        if let Some(site) = self.sites().get_mut(addr) {
            site.cut_links();
            site.node = Arc::new(ReplicaNode::new(addr));
            site.up = true;
            info!(%addr, "replica restarted");
        }
    }

    fn sites(&self) -> MutexGuard<'_, HashMap<String, Site>> {
        self.sites.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for LocalNetwork {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn Replica>, ReplicaError> {
        let mut sites = self.sites();
        let Some(site) = sites.get_mut(addr) else {
            return Err(ReplicaError::unreachable(addr, "no such replica"));
        };
        if !site.up {
            return Err(ReplicaError::unreachable(addr, "connection refused"));
        }

        let link = Arc::new(AtomicBool::new(true));
        site.links.retain(|link| link.load(Ordering::SeqCst));
        site.links.push(Arc::clone(&link));
        Ok(Arc::new(LocalReplica {
            addr: addr.to_string(),
            node: Arc::clone(&site.node),
            link,
        }))
    }
}

/// Handle to an in-process replica over a link that may be cut.
pub struct LocalReplica {
    addr: String,
    node: Arc<ReplicaNode>,
    link: Arc<AtomicBool>,
}

impl LocalReplica {
    fn node(&self) -> Result<&ReplicaNode, ReplicaError> {
        if self.link.load(Ordering::SeqCst) {
            Ok(&self.node)
        } else {
            Err(ReplicaError::unreachable(&self.addr, "link down"))
        }
    }
}

#[async_trait]
impl Replica for LocalReplica {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn promise(&self, proposal: ProposalNumber) -> Result<Promise, ReplicaError> {
        Ok(self.node()?.promise(proposal))
    }

    async fn accept(
        &self,
        proposal: ProposalNumber,
        command: &Command,
    ) -> Result<AcceptReply, ReplicaError> {
        Ok(self.node()?.accept(proposal, command))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ReplicaError> {
        Ok(self.node()?.get(key))
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, String>, ReplicaError> {
        Ok(self.node()?.snapshot())
    }

    async fn update_dictionary(
        &self,
        dictionary: BTreeMap<String, String>,
    ) -> Result<(), ReplicaError> {
        self.node()?.update_dictionary(dictionary);
        Ok(())
    }
}
