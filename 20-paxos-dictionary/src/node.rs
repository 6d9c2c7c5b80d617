//! Replica-side half of the agreement protocol.
//!
//! A [`ReplicaNode`] combines the replica's [`LocalStore`] with its promise
//! state. The state is global to the replica, not per key: one highest
//! promised proposal number and the commands currently being accepted, keyed
//! by proposal number.
//!
//! Per round the replica moves `Promised(n) -> Accepting(n, cmd) ->
//! Committed | Refused` and then waits for the next promise. An accept leaves
//! the in-flight set once admission settles, whichever way it went.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::command::Command;
use crate::replica::{AcceptReply, PriorAccept, Promise, ProposalNumber, Refusal};
use crate::store::LocalStore;

#[derive(Debug, Default)]
struct PromiseState {
    /// Only ever moves up.
    highest_promised: ProposalNumber,
    in_flight: BTreeMap<ProposalNumber, Command>,
}

impl PromiseState {
    /// The in-flight accept with the highest proposal number.
    fn newest_in_flight(&self) -> Option<PriorAccept> {
        self.in_flight
            .last_key_value()
            .map(|(proposal, command)| PriorAccept {
                proposal: *proposal,
                command: command.clone(),
            })
    }
}

pub struct ReplicaNode {
    name: String,
    store: LocalStore,
    state: Mutex<PromiseState>,
}

impl ReplicaNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: LocalStore::new(),
            state: Mutex::new(PromiseState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn highest_promised(&self) -> ProposalNumber {
        self.state().highest_promised
    }

    /// Grants the promise if `proposal` is newer than anything promised so far.
    pub fn promise(&self, proposal: ProposalNumber) -> Promise {
        let mut state = self.state();
        if proposal <= state.highest_promised {
            debug!(
                replica = %self.name,
                proposal,
                promised = state.highest_promised,
                "refusing stale promise"
            );
            return Promise::Refused {
                promised: state.highest_promised,
            };
        }

        state.highest_promised = proposal;
        let prior = state.newest_in_flight();
        debug!(replica = %self.name, proposal, ?prior, "promised");
        Promise::Granted { prior }
    }

    /// Accepts and applies `command` unless a newer round has started or the
    /// store refuses it.
    pub fn accept(&self, proposal: ProposalNumber, command: &Command) -> AcceptReply {
        if let Err(refusal) = self.record_pending(proposal, command) {
            debug!(replica = %self.name, proposal, %refusal, "refusing accept");
            return AcceptReply::Refused(refusal);
        }

        let reply = match self.store.try_admit(command) {
            Ok(admission) => {
                admission.commit();
                info!(replica = %self.name, proposal, %command, "applied");
                AcceptReply::Done { proposal }
            }
            Err(refusal) => {
                info!(replica = %self.name, proposal, %command, %refusal, "admission refused");
                AcceptReply::Refused(refusal)
            }
        };
        self.settle(proposal, command);
        reply
    }

    /// Like [`ReplicaNode::accept`] for a command still in its wire form.
    /// Malformed commands are refused and leave the replica untouched.
    pub fn accept_encoded(&self, proposal: ProposalNumber, raw: &str) -> AcceptReply {
        match Command::decode(raw) {
            Ok(command) => self.accept(proposal, &command),
            Err(err) => {
                warn!(replica = %self.name, proposal, raw, error = %err, "dropping malformed command");
                AcceptReply::Refused(Refusal::MalformedCommand {
                    detail: err.to_string(),
                })
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.store.snapshot()
    }

    pub fn update_dictionary(&self, dictionary: BTreeMap<String, String>) {
        info!(replica = %self.name, keys = dictionary.len(), "dictionary overwritten");
        self.store.overwrite(dictionary);
    }

    /// Marks `command` as being accepted under `proposal`.
    fn record_pending(&self, proposal: ProposalNumber, command: &Command) -> Result<(), Refusal> {
        let mut state = self.state();
        if proposal < state.highest_promised {
            return Err(Refusal::StaleProposal {
                promised: state.highest_promised,
            });
        }
        state.in_flight.insert(proposal, command.clone());
        Ok(())
    }

    /// Drops the in-flight entry for `proposal` if it still holds `command`.
    /// Another accept that reused the same number keeps its own entry.
    fn settle(&self, proposal: ProposalNumber, command: &Command) {
        let mut state = self.state();
        if state.in_flight.get(&proposal) == Some(command) {
            state.in_flight.remove(&proposal);
        }
    }

    fn state(&self) -> MutexGuard<'_, PromiseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
