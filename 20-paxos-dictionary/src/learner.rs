//! Committed proposals and the canonical dictionary built from them.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

use tracing::{info, warn};

use crate::command::{Command, Operation};
use crate::replica::ProposalNumber;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearnOutcome {
    Applied,
    /// Same proposal and command seen before; nothing changed.
    Duplicate,
    /// The proposal number was already learned with a different command.
    /// The log is append-only, so the new command is dropped.
    Conflicting { recorded: Command },
}

/// Record of every proposal that reached a quorum of accepts, plus the
/// dictionary those proposals produce. The reconciler pushes this dictionary
/// to replicas that drift from it.
#[derive(Default)]
pub struct Learner {
    learned: Mutex<BTreeMap<ProposalNumber, Command>>,
    canonical: RwLock<BTreeMap<String, String>>,
}

impl Learner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn learn(&self, proposal: ProposalNumber, command: &Command) -> LearnOutcome {
        let mut learned = self.learned.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(recorded) = learned.get(&proposal) {
            if recorded == command {
                return LearnOutcome::Duplicate;
            }
            warn!(proposal, %recorded, %command, "proposal already learned with another command");
            return LearnOutcome::Conflicting {
                recorded: recorded.clone(),
            };
        }
        learned.insert(proposal, command.clone());

        // Applied while the log is still locked so log and view move together.
        let mut canonical = self.canonical.write().unwrap_or_else(PoisonError::into_inner);
        match command.operation {
            Operation::Put => {
                let value = command.value.clone().unwrap_or_default();
                canonical.insert(command.key.clone(), value);
            }
            Operation::Delete => {
                if canonical.remove(&command.key).is_none() {
                    warn!(proposal, key = %command.key, "learned delete of a key the canonical view never had");
                }
            }
        }
        info!(proposal, %command, "learned");
        LearnOutcome::Applied
    }

    pub fn canonical(&self) -> BTreeMap<String, String> {
        self.canonical
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn learned(&self) -> BTreeMap<ProposalNumber, Command> {
        self.learned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn learning_twice_is_a_no_op() {
        let learner = Learner::new();
        let command = Command::put("1000", "-20");
        assert_eq!(learner.learn(1, &command), LearnOutcome::Applied);
        let after_first = learner.canonical();

        assert_eq!(learner.learn(1, &command), LearnOutcome::Duplicate);
        assert_eq!(learner.canonical(), after_first);
        assert_eq!(learner.learned().len(), 1);
    }

    #[test]
    fn conflicting_command_for_same_number_is_dropped() {
        let learner = Learner::new();
        learner.learn(1, &Command::put("k", "a"));
        let outcome = learner.learn(1, &Command::put("k", "b"));
        assert_eq!(
            outcome,
            LearnOutcome::Conflicting {
                recorded: Command::put("k", "a")
            }
        );
        assert_eq!(learner.canonical().get("k"), Some(&"a".to_string()));
    }

    #[test]
    fn applies_put_and_delete_in_order() {
        let learner = Learner::new();
        learner.learn(1, &Command::put("a", "1"));
        learner.learn(2, &Command::put("b", "2"));
        learner.learn(3, &Command::delete("a"));
        assert_eq!(
            learner.canonical(),
            BTreeMap::from([("b".to_string(), "2".to_string())])
        );
        assert_eq!(learner.learned().keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn delete_of_unknown_key_is_recorded_but_harmless() {
        let learner = Learner::new();
        assert_eq!(learner.learn(7, &Command::delete("ghost")), LearnOutcome::Applied);
        assert!(learner.canonical().is_empty());
        assert!(learner.learned().contains_key(&7));
    }
}
