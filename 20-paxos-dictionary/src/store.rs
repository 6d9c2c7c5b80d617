//! Per-replica key-value storage and admission control.
//!
//! Every replica owns one [`LocalStore`]. Mutations never go straight into the
//! map: a command is first admitted with [`LocalStore::try_admit`], which takes
//! the key's lock and checks for conflicts, and only then applied with
//! [`Admission::commit`].
//!
//! The per-key lock is a try-lock. A second writer on the same key is refused
//! immediately with [`Refusal::KeyBusy`] instead of queueing behind the first,
//! so contention surfaces to the coordinator as an ordinary refusal.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::command::{Command, Operation};
use crate::replica::Refusal;

/// Thread-safe key-value map plus a lazily populated table of per-key locks.
///
/// BTreeMap keeps snapshots in a stable order, which makes STATUS output and
/// snapshot comparisons deterministic.
#[derive(Default)]
pub struct LocalStore {
    data: RwLock<BTreeMap<String, String>>,
    locks: LockTable,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the key's lock and checks the command against the current state.
    ///
    /// PUT is refused when the key already exists, DELETE when it does not.
    /// On refusal the lock is released before returning. On success the lock
    /// stays held by the returned [`Admission`] until it is committed or
    /// dropped.
    pub fn try_admit(&self, command: &Command) -> Result<Admission<'_>, Refusal> {
        let Some(guard) = self.locks.try_acquire(&command.key) else {
            debug!(key = %command.key, "key lock held by another writer");
            return Err(Refusal::KeyBusy);
        };
        let admission = Admission {
            store: self,
            command: command.clone(),
            _guard: guard,
        };

        let exists = self.read_data().contains_key(&command.key);
        match command.operation {
            Operation::Put if exists => Err(Refusal::KeyExists),
            Operation::Delete if !exists => Err(Refusal::KeyAbsent),
            _ => Ok(admission),
        }
        // A refused admission is dropped here, which releases the lock.
    }

    /// Lock-free with respect to the key locks; sees either the pre- or the
    /// post-commit value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.read_data().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.read_data().clone()
    }

    /// Replaces the whole map. Used by reconciliation, which bypasses
    /// admission on purpose: the canonical view always wins.
    pub fn overwrite(&self, dictionary: BTreeMap<String, String>) {
        *self.write_data() = dictionary;
    }

    pub fn len(&self) -> usize {
        self.read_data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_data().is_empty()
    }

    /// Number of keys that have ever had a lock allocated.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn read_data(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, String>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_data(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, String>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An admitted command that still holds its key's lock.
///
/// Committing applies the mutation. Dropping without committing aborts. In
/// both cases the lock is released when the admission goes away, including
/// during unwinding.
#[must_use = "an admission keeps its key locked until it is committed or dropped"]
pub struct Admission<'a> {
    store: &'a LocalStore,
    command: Command,
    _guard: OwnedMutexGuard<()>,
}

impl Admission<'_> {
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Applies the admitted mutation and releases the key's lock.
    pub fn commit(self) {
        let mut data = self.store.write_data();
        match self.command.operation {
            Operation::Put => {
                let value = self.command.value.clone().unwrap_or_default();
                data.insert(self.command.key.clone(), value);
            }
            Operation::Delete => {
                data.remove(&self.command.key);
            }
        }
    }
}

/// One try-lock per key, created on first use and kept for the lifetime of
/// the store.
#[derive(Default)]
struct LockTable {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockTable {
    fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.table();
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.try_lock_owned().ok()
    }

    fn len(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn put_then_get() {
        let store = LocalStore::new();
        store.try_admit(&Command::put("1000", "-20")).unwrap().commit();
        assert_eq!(store.get("1000"), Some("-20".to_string()));
        assert_eq!(store.get("2000"), None);
    }

    #[test]
    fn put_refused_when_key_exists() {
        let store = LocalStore::new();
        store.try_admit(&Command::put("k", "a")).unwrap().commit();
        let refusal = store.try_admit(&Command::put("k", "b")).err();
        assert_eq!(refusal, Some(Refusal::KeyExists));
        assert_eq!(store.get("k"), Some("a".to_string()));
    }

    #[test]
    fn delete_refused_when_key_absent() {
        let store = LocalStore::new();
        let refusal = store.try_admit(&Command::delete("k")).err();
        assert_eq!(refusal, Some(Refusal::KeyAbsent));
    }

    #[test]
    fn delete_removes_key() {
        let store = LocalStore::new();
        store.try_admit(&Command::put("k", "v")).unwrap().commit();
        store.try_admit(&Command::delete("k")).unwrap().commit();
        assert!(store.is_empty());
    }

    #[test]
    fn held_lock_refuses_second_writer() {
        let store = LocalStore::new();
        let first = store.try_admit(&Command::put("k", "a")).unwrap();
        let second = store.try_admit(&Command::put("k", "b")).err();
        assert_eq!(second, Some(Refusal::KeyBusy));

        // Other keys are unaffected.
        store.try_admit(&Command::put("other", "x")).unwrap().commit();

        first.commit();
        assert_eq!(store.get("k"), Some("a".to_string()));
    }

    #[test]
    fn lock_is_free_after_every_exit_path() {
        let store = LocalStore::new();

        // Refusal.
        assert!(store.try_admit(&Command::delete("k")).is_err());
        assert_eq!(store.lock_count(), 1);

        // Abort (dropped without commit).
        drop(store.try_admit(&Command::put("k", "v")).unwrap());
        assert_eq!(store.get("k"), None);

        // Commit.
        store.try_admit(&Command::put("k", "v")).unwrap().commit();

        // Same lock every time, free again afterwards.
        assert!(store.try_admit(&Command::delete("k")).is_ok());
        assert_eq!(store.lock_count(), 1);
    }

    #[test]
    fn lock_released_when_holder_panics() {
        let store = LocalStore::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _admission = store.try_admit(&Command::put("k", "v")).unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(store.try_admit(&Command::put("k", "v")).is_ok());
    }

    #[test]
    fn concurrent_puts_on_same_key_admit_exactly_one() {
        for _ in 0..50 {
            let store = Arc::new(LocalStore::new());
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|value| {
                    let store = Arc::clone(&store);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        match store.try_admit(&Command::put("k", value)) {
                            Ok(admission) => {
                                admission.commit();
                                true
                            }
                            Err(_) => false,
                        }
                    })
                })
                .collect();

            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
            assert!(store.get("k").is_some());
            assert_eq!(store.lock_count(), 1);
            assert!(store.try_admit(&Command::delete("k")).is_ok());
        }
    }

    #[test]
    fn overwrite_replaces_everything() {
        let store = LocalStore::new();
        store.try_admit(&Command::put("stale", "1")).unwrap().commit();
        store.overwrite(BTreeMap::from([("fresh".to_string(), "2".to_string())]));
        assert_eq!(store.get("stale"), None);
        assert_eq!(store.get("fresh"), Some("2".to_string()));
    }
}
