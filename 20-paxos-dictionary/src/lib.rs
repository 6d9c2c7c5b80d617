//! Replicated key-value dictionary.
//!
//! A fixed set of replicas each hold a full copy of the dictionary. Writes go
//! through a two-phase promise/accept round driven by a [`proposer::Coordinator`]
//! and count only once a majority applies them; reads go straight to one
//! replica. A [`reconciler::Reconciler`] runs alongside the coordinator and
//! overwrites replicas that drifted from the learned, canonical dictionary,
//! reconnecting the ones that stopped answering.
//!
//! # Modules
//!
//! - [`command`]: PUT/DELETE commands and their delimited wire form
//! - [`store`]: per-replica dictionary with per-key admission locks
//! - [`node`]: replica-side promise/accept state
//! - [`replica`]: the [`replica::Replica`] trait the coordinator talks to
//! - [`local`]: in-process replicas with simulated partitions and restarts
//! - [`message`], [`runtime`], [`transport`]: JSON-lines protocol, server and client
//! - [`cluster`]: replica endpoints, reachability and quorum size
//! - [`proposer`]: promise/accept rounds and direct reads
//! - [`learner`]: committed proposals and the canonical dictionary
//! - [`reconciler`]: heartbeat repair and reconnection
//! - [`config`], [`cli`], [`client`], [`protocol`]: settings and the interactive shell

pub mod cli;
pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod learner;
pub mod local;
pub mod message;
pub mod node;
pub mod protocol;
pub mod proposer;
pub mod reconciler;
pub mod replica;
pub mod runtime;
pub mod store;
pub mod transport;
