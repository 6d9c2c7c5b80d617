//! The proposer side of agreement.
//!
//! One [`Coordinator::submit`] call runs a full round:
//!
//! 1. draw a proposal number higher than any this coordinator issued before,
//! 2. ask every replica to promise it, and stop with [`Outcome::NoMajority`]
//!    unless a quorum grants,
//! 3. if any granting replica was midway through accepting an earlier command,
//!    drive that command instead of the caller's (highest proposal wins),
//! 4. ask every replica to accept the command and learn it once a quorum
//!    reports done.
//!
//! Calls go out concurrently and each is bounded by the coordinator's call
//! timeout, so a round takes as long as the slowest live replica. A replica
//! that fails or times out is a missing vote, never an error for the round.
//!
//! Replicas that applied a command in a round that missed its quorum are not
//! rolled back. The reconciler later overwrites them with the canonical view.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, Endpoint, quorum};
use crate::command::Command;
use crate::learner::Learner;
use crate::replica::{AcceptReply, Promise, ProposalNumber, Refusal, Replica, ReplicaError};

/// One replica's answer, or the reason there was none.
#[derive(Debug, Clone)]
pub struct ReplicaReply<T> {
    pub addr: String,
    pub reply: Result<T, ReplicaError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Promise,
    Accept,
}

/// Result of one round.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A quorum applied `command`. When `matched_request` is false the round
    /// finished an earlier proposal's command instead of the caller's.
    Committed {
        proposal: ProposalNumber,
        command: Command,
        matched_request: bool,
        replies: Vec<ReplicaReply<AcceptReply>>,
    },
    /// Too few replicas answered affirmatively in `phase`.
    NoMajority {
        proposal: ProposalNumber,
        phase: Phase,
        affirmative: usize,
        required: usize,
    },
    /// Replicas answered but refused to apply the command. `reason` is the
    /// most common refusal. `matched_request` is false when the refused command
    /// was an earlier pending one rather than the caller's.
    Rejected {
        proposal: ProposalNumber,
        command: Command,
        matched_request: bool,
        reason: Refusal,
        done: usize,
        required: usize,
        replies: Vec<ReplicaReply<AcceptReply>>,
    },
}

impl Outcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed { .. })
    }

    pub fn proposal(&self) -> ProposalNumber {
        match self {
            Outcome::Committed { proposal, .. }
            | Outcome::NoMajority { proposal, .. }
            | Outcome::Rejected { proposal, .. } => *proposal,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Committed {
                matched_request: true,
                ..
            } => write!(f, "success"),
            Outcome::Committed { command, .. } => {
                write!(f, "success, but an earlier pending '{command}' was committed instead")
            }
            Outcome::NoMajority {
                phase,
                affirmative,
                required,
                ..
            } => {
                let verb = match phase {
                    Phase::Promise => "promised",
                    Phase::Accept => "accepted",
                };
                write!(f, "no majority: {affirmative} {verb}, {required} required")
            }
            Outcome::Rejected {
                reason,
                matched_request: true,
                ..
            } => write!(f, "refused, {reason}"),
            Outcome::Rejected {
                reason, command, ..
            } => write!(
                f,
                "refused, {reason} (an earlier pending '{command}' was driven instead of yours)"
            ),
        }
    }
}

/// Result of a direct read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Found { addr: String, value: String },
    NotFound { addr: String },
    Unavailable,
}

impl fmt::Display for ReadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadOutcome::Found { value, .. } => f.write_str(value),
            ReadOutcome::NotFound { .. } => f.write_str("not found"),
            ReadOutcome::Unavailable => f.write_str("no replica reachable"),
        }
    }
}

pub struct Coordinator {
    cluster: Arc<Cluster>,
    learner: Arc<Learner>,
    call_timeout: Duration,
    next_proposal: AtomicU64,
    next_reader: AtomicUsize,
}

impl Coordinator {
    pub fn new(cluster: Arc<Cluster>, learner: Arc<Learner>, call_timeout: Duration) -> Self {
        Self {
            cluster,
            learner,
            call_timeout,
            next_proposal: AtomicU64::new(1),
            next_reader: AtomicUsize::new(0),
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn learner(&self) -> &Arc<Learner> {
        &self.learner
    }

    pub async fn put(&self, key: impl Into<String>, value: impl Into<String>) -> Outcome {
        self.submit(Command::put(key, value)).await
    }

    pub async fn delete(&self, key: impl Into<String>) -> Outcome {
        self.submit(Command::delete(key)).await
    }

    /// Runs one promise/accept round for `request`. Not retried on failure;
    /// submitting again draws a fresh, higher proposal number.
    pub async fn submit(&self, request: Command) -> Outcome {
        let proposal = self.next_proposal.fetch_add(1, Ordering::SeqCst);
        let endpoints = self.cluster.endpoints();
        let required = quorum(endpoints.len());
        debug!(proposal, %request, replicas = endpoints.len(), "starting round");

        let promises = self
            .fan_out(&endpoints, move |replica: Arc<dyn Replica>| async move {
                replica.promise(proposal).await
            })
            .await;
        let granted = promises
            .iter()
            .filter(|r| matches!(r.reply, Ok(Promise::Granted { .. })))
            .count();
        if granted < required {
            self.skip_past_refusals(&promises);
            warn!(proposal, granted, required, "no majority in promise phase");
            return Outcome::NoMajority {
                proposal,
                phase: Phase::Promise,
                affirmative: granted,
                required,
            };
        }

        let command = adopt_prior(&promises).unwrap_or_else(|| request.clone());
        let matched_request = command == request;
        if !matched_request {
            info!(proposal, %command, %request, "finishing earlier pending command first");
        }

        let accepts = {
            let command = &command;
            self.fan_out(&endpoints, move |replica: Arc<dyn Replica>| async move {
                replica.accept(proposal, command).await
            })
            .await
        };
        let done = accepts
            .iter()
            .filter(|r| matches!(r.reply, Ok(AcceptReply::Done { .. })))
            .count();

        if done >= required {
            self.learner.learn(proposal, &command);
            if done < endpoints.len() {
                info!(proposal, done, total = endpoints.len(), "committed; lagging replicas left to the reconciler");
            }
            return Outcome::Committed {
                proposal,
                command,
                matched_request,
                replies: accepts,
            };
        }

        if done > 0 {
            warn!(proposal, done, required, "applied below quorum; not rolled back");
        }
        match most_common_refusal(&accepts) {
            Some(reason) => Outcome::Rejected {
                proposal,
                command,
                matched_request,
                reason,
                done,
                required,
                replies: accepts,
            },
            None => Outcome::NoMajority {
                proposal,
                phase: Phase::Accept,
                affirmative: done,
                required,
            },
        }
    }

    /// Reads `key` from one replica, rotating the starting replica on every
    /// call and moving on when a replica cannot be reached.
    pub async fn read(&self, key: &str) -> ReadOutcome {
        let endpoints = self.cluster.endpoints();
        let start = self.next_reader.fetch_add(1, Ordering::Relaxed);
        for offset in 0..endpoints.len() {
            let endpoint = &endpoints[(start + offset) % endpoints.len()];
            let reply = match timeout(self.call_timeout, endpoint.replica.get(key)).await {
                Ok(reply) => reply,
                Err(_) => Err(ReplicaError::Timeout {
                    addr: endpoint.addr.clone(),
                    after: self.call_timeout,
                }),
            };
            match reply {
                Ok(Some(value)) => {
                    return ReadOutcome::Found {
                        addr: endpoint.addr.clone(),
                        value,
                    };
                }
                Ok(None) => {
                    return ReadOutcome::NotFound {
                        addr: endpoint.addr.clone(),
                    };
                }
                Err(err) => self.note_failure(endpoint, &err),
            }
        }
        ReadOutcome::Unavailable
    }

    /// Sends one call per endpoint concurrently and waits for all of them.
    async fn fan_out<T, F, Fut>(&self, endpoints: &[Endpoint], call: F) -> Vec<ReplicaReply<T>>
    where
        F: Fn(Arc<dyn Replica>) -> Fut,
        Fut: Future<Output = Result<T, ReplicaError>>,
    {
        let after = self.call_timeout;
        let calls = endpoints.iter().map(|endpoint| {
            let addr = endpoint.addr.clone();
            let pending = call(Arc::clone(&endpoint.replica));
            async move {
                let reply = match timeout(after, pending).await {
                    Ok(reply) => reply,
                    Err(_) => Err(ReplicaError::Timeout {
                        addr: addr.clone(),
                        after,
                    }),
                };
                ReplicaReply { addr, reply }
            }
        });
        let replies = join_all(calls).await;

        for (endpoint, reply) in endpoints.iter().zip(&replies) {
            if let Err(err) = &reply.reply {
                self.note_failure(endpoint, err);
            }
        }
        replies
    }

    fn note_failure(&self, endpoint: &Endpoint, err: &ReplicaError) {
        if endpoint.reachable {
            warn!(addr = %endpoint.addr, error = %err, "replica did not answer");
            self.cluster.mark_unreachable(&endpoint.addr);
        } else {
            debug!(addr = %endpoint.addr, error = %err, "replica still unreachable");
        }
    }

    /// Moves the proposal counter past the highest number a replica reported
    /// having promised, so a resubmission is not refused for the same reason.
    fn skip_past_refusals(&self, promises: &[ReplicaReply<Promise>]) {
        let highest = promises
            .iter()
            .filter_map(|r| match r.reply {
                Ok(Promise::Refused { promised }) => Some(promised),
                _ => None,
            })
            .max();
        if let Some(promised) = highest {
            self.next_proposal.fetch_max(promised.saturating_add(1), Ordering::SeqCst);
        }
    }
}

/// The pending command with the highest proposal number among granted
/// promises, if any replica reported one.
fn adopt_prior(promises: &[ReplicaReply<Promise>]) -> Option<Command> {
    promises
        .iter()
        .filter_map(|r| match &r.reply {
            Ok(Promise::Granted { prior: Some(prior) }) => Some(prior),
            _ => None,
        })
        .max_by_key(|prior| prior.proposal)
        .map(|prior| prior.command.clone())
}

/// Most frequent refusal; ties go to the one seen first.
fn most_common_refusal(accepts: &[ReplicaReply<AcceptReply>]) -> Option<Refusal> {
    let mut tally: Vec<(&Refusal, usize)> = Vec::new();
    for reply in accepts {
        if let Ok(AcceptReply::Refused(refusal)) = &reply.reply {
            match tally.iter_mut().find(|(seen, _)| *seen == refusal) {
                Some((_, count)) => *count += 1,
                None => tally.push((refusal, 1)),
            }
        }
    }
    tally
        .into_iter()
        .rev()
        .max_by_key(|(_, count)| *count)
        .map(|(refusal, _)| refusal.clone())
}
