//! Heartbeat loop that keeps replicas in line with the canonical dictionary.
//!
//! Every tick compares each replica's full dictionary with the learner's
//! canonical view and overwrites the replica wholesale when they differ. A
//! replica that cannot be reached is marked unreachable and reconnected at
//! the same address; if that works, the fresh handle replaces the old one and
//! is brought up to date in the same tick. Otherwise it is retried on the next
//! tick, at the same fixed interval.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::select;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, Connector, Endpoint};
use crate::learner::Learner;
use crate::replica::{Replica, ReplicaError};

/// What one tick found, by replica address.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub in_sync: Vec<String>,
    pub repaired: Vec<String>,
    /// Reconnected during this tick; also listed under `in_sync` or `repaired`.
    pub reconnected: Vec<String>,
    pub unreachable: Vec<String>,
}

impl TickReport {
    pub fn converged(&self) -> bool {
        self.unreachable.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Convergence {
    InSync,
    Repaired,
}

enum EndpointStatus {
    Synced { sync: Convergence, reconnected: bool },
    Unreachable,
}

pub struct Reconciler {
    cluster: Arc<Cluster>,
    learner: Arc<Learner>,
    connector: Arc<dyn Connector>,
    interval: Duration,
    call_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        cluster: Arc<Cluster>,
        learner: Arc<Learner>,
        connector: Arc<dyn Connector>,
        interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            learner,
            connector,
            interval,
            call_timeout,
        }
    }

    /// Ticks every interval until `shutdown` resolves. The first tick runs
    /// one interval after start.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        tokio::pin!(shutdown);

        info!(interval = ?self.interval, "reconciler started");
        loop {
            select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    debug!(?report, "heartbeat");
                }
            }
        }
        info!("reconciler stopped");
    }

    /// Runs one reconciliation pass over every replica concurrently.
    pub async fn tick(&self) -> TickReport {
        let canonical = self.learner.canonical();
        let endpoints = self.cluster.endpoints();
        let statuses = join_all(
            endpoints
                .iter()
                .map(|endpoint| self.reconcile(endpoint, &canonical)),
        )
        .await;

        let mut report = TickReport::default();
        for (endpoint, status) in endpoints.into_iter().zip(statuses) {
            match status {
                EndpointStatus::Synced { sync, reconnected } => {
                    if reconnected {
                        report.reconnected.push(endpoint.addr.clone());
                    }
                    match sync {
                        Convergence::InSync => report.in_sync.push(endpoint.addr),
                        Convergence::Repaired => report.repaired.push(endpoint.addr),
                    }
                }
                EndpointStatus::Unreachable => report.unreachable.push(endpoint.addr),
            }
        }
        report
    }

    async fn reconcile(
        &self,
        endpoint: &Endpoint,
        canonical: &BTreeMap<String, String>,
    ) -> EndpointStatus {
        match self.sync(endpoint.replica.as_ref(), canonical).await {
            Ok(sync) => {
                self.cluster.mark_reachable(&endpoint.addr);
                return EndpointStatus::Synced {
                    sync,
                    reconnected: false,
                };
            }
            Err(err) => {
                if endpoint.reachable {
                    warn!(addr = %endpoint.addr, error = %err, "heartbeat failed");
                }
                self.cluster.mark_unreachable(&endpoint.addr);
            }
        }

        let fresh = match self.reconnect(&endpoint.addr).await {
            Ok(fresh) => fresh,
            Err(err) => {
                debug!(addr = %endpoint.addr, error = %err, "reconnect failed");
                return EndpointStatus::Unreachable;
            }
        };
        info!(addr = %endpoint.addr, "reconnected to replica");
        self.cluster.replace(Arc::clone(&fresh));

        match self.sync(fresh.as_ref(), canonical).await {
            Ok(sync) => EndpointStatus::Synced {
                sync,
                reconnected: true,
            },
            Err(err) => {
                warn!(addr = %endpoint.addr, error = %err, "replica failed right after reconnecting");
                self.cluster.mark_unreachable(&endpoint.addr);
                EndpointStatus::Unreachable
            }
        }
    }

    async fn sync(
        &self,
        replica: &dyn Replica,
        canonical: &BTreeMap<String, String>,
    ) -> Result<Convergence, ReplicaError> {
        let current = self.bounded(replica.addr(), replica.snapshot()).await?;
        if &current == canonical {
            return Ok(Convergence::InSync);
        }

        info!(
            addr = %replica.addr(),
            replica_keys = current.len(),
            canonical_keys = canonical.len(),
            "replica diverged; overwriting with canonical view"
        );
        self.bounded(replica.addr(), replica.update_dictionary(canonical.clone()))
            .await?;
        Ok(Convergence::Repaired)
    }

    async fn reconnect(&self, addr: &str) -> Result<Arc<dyn Replica>, ReplicaError> {
        self.bounded(addr, self.connector.connect(addr)).await
    }

    async fn bounded<T>(
        &self,
        addr: &str,
        call: impl Future<Output = Result<T, ReplicaError>>,
    ) -> Result<T, ReplicaError> {
        timeout(self.call_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(ReplicaError::Timeout {
                    addr: addr.to_string(),
                    after: self.call_timeout,
                })
            })
    }
}
