//! The capability set every replica exposes to the coordinator.
//!
//! [`Replica`] is implemented once per transport: [`crate::local::LocalReplica`]
//! calls straight into an in-process [`crate::node::ReplicaNode`], while
//! [`crate::transport::TcpReplica`] speaks the JSON-lines protocol from
//! [`crate::message`] to a [`crate::runtime::ReplicaServer`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::Command;

/// Orders competing rounds. Higher is newer.
pub type ProposalNumber = u64;

/// Why a replica declined a promise or an accept.
///
/// Refusals are expected outcomes of the protocol, not failures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Refusal {
    #[error("key exists")]
    KeyExists,
    #[error("key absent")]
    KeyAbsent,
    #[error("key busy")]
    KeyBusy,
    #[error("already promised to proposal {promised}")]
    StaleProposal { promised: ProposalNumber },
    #[error("malformed command: {detail}")]
    MalformedCommand { detail: String },
}

/// A command a replica accepted under `proposal` but has not finished applying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorAccept {
    pub proposal: ProposalNumber,
    pub command: Command,
}

/// Answer to a promise request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promise {
    /// The replica will ignore proposals older than the one it granted. If it
    /// is midway through accepting an earlier command, that command rides
    /// along so the new round can finish it.
    Granted { prior: Option<PriorAccept> },
    Refused { promised: ProposalNumber },
}

impl Promise {
    pub fn is_granted(&self) -> bool {
        matches!(self, Promise::Granted { .. })
    }
}

/// Answer to an accept request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptReply {
    Done { proposal: ProposalNumber },
    Refused(Refusal),
}

impl AcceptReply {
    pub fn is_done(&self) -> bool {
        matches!(self, AcceptReply::Done { .. })
    }
}

/// A call that did not produce an answer. The coordinator counts these as
/// absent votes and the reconciler treats them as a reason to reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error("replica {addr} unreachable: {reason}")]
    Unreachable { addr: String, reason: String },
    #[error("replica {addr} did not answer within {after:?}")]
    Timeout { addr: String, after: Duration },
    #[error("replica {addr} sent an unexpected reply: {detail}")]
    Protocol { addr: String, detail: String },
}

impl ReplicaError {
    pub fn unreachable(addr: &str, reason: impl ToString) -> Self {
        ReplicaError::Unreachable {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
pub trait Replica: Send + Sync {
    /// Address the replica was reached at.
    fn addr(&self) -> &str;

    async fn promise(&self, proposal: ProposalNumber) -> Result<Promise, ReplicaError>;

    async fn accept(
        &self,
        proposal: ProposalNumber,
        command: &Command,
    ) -> Result<AcceptReply, ReplicaError>;

    /// Direct read, outside of agreement.
    async fn get(&self, key: &str) -> Result<Option<String>, ReplicaError>;

    async fn snapshot(&self) -> Result<BTreeMap<String, String>, ReplicaError>;

    /// Overwrites the replica's whole dictionary.
    async fn update_dictionary(
        &self,
        dictionary: BTreeMap<String, String>,
    ) -> Result<(), ReplicaError>;
}
