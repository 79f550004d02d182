//! The process-local registry of remote values.
//!
//! Every result of a remote call rendezvouses here, under the reference
//! id (`Rrid`) that named it in the request header. The registry also
//! tracks which workers still hold a handle to each value, so entries
//! can be reclaimed once nobody is interested anymore.

use parking_lot::Mutex;

use crate::cluster::collections::{self, HashSet, OrderedMap};
use crate::cluster::communication::channel::{Semaphore, Slot};
use crate::cluster::communication::message::{Answer, CapturedError, RemoteException, Rrid};
use crate::cluster::communication::WorkerId;
use crate::cluster::error::*;

/// One owned remote value: the rendezvous slot plus the bookkeeping
/// needed for distributed reference counting and peer-death cleanup.
struct RemoteValue<V> {
    slot: Slot<Answer<V>>,
    // present iff the slot is unbuffered; serializes remote takes
    // against the result send that completes them
    sync_lock: Option<Semaphore>,
    // ids of workers holding an outstanding handle to this value
    clients: HashSet<u32>,
    // the worker whose reply will fill the slot; 0 if produced locally
    waiting_for: u32,
}

impl<V> RemoteValue<V> {
    fn new(rid: Rrid, buffered: bool, waiting_for: WorkerId) -> Self {
        let mut clients = collections::hash_set();
        clients.insert(rid.whence);
        RemoteValue {
            slot: if buffered {
                Slot::buffered()
            } else {
                Slot::unbuffered()
            },
            sync_lock: if buffered {
                None
            } else {
                Some(Semaphore::new(1))
            },
            clients,
            waiting_for: waiting_for.into(),
        }
    }
}

/// The table of remote values owned by one process.
///
/// The table mutex is only ever held to mutate the map itself; blocking
/// operations clone the slot out and wait on it with the mutex released.
pub struct Registry<V> {
    refs: Mutex<OrderedMap<Rrid, RemoteValue<V>>>,
}

impl<V: Clone> Registry<V> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry {
            refs: Mutex::new(collections::ordered_map()),
        }
    }

    /// Creates the entry for `rid`, failing if it already exists.
    pub fn register(&self, rid: Rrid, buffered: bool) -> Result<Slot<Answer<V>>> {
        let mut refs = self.refs.lock();
        if refs.contains_key(&rid) {
            return Err("Reference id is already registered").wrapped(ErrorKind::Registry);
        }
        let rv = RemoteValue::new(rid, buffered, WorkerId::from(0u32));
        let slot = rv.slot.clone();
        refs.insert(rid, rv);
        Ok(slot)
    }

    /// Returns the slot registered under `rid`, creating a fresh
    /// buffered entry when none exists yet.
    ///
    /// `waiting_for` names the worker whose reply is expected to fill a
    /// freshly created slot; pass worker id 0 for locally produced values.
    pub fn lookup_or_register(&self, rid: Rrid, waiting_for: WorkerId) -> Slot<Answer<V>> {
        let mut refs = self.refs.lock();
        if let Some(rv) = refs.get(&rid) {
            return rv.slot.clone();
        }
        let rv = RemoteValue::new(rid, true, waiting_for);
        let slot = rv.slot.clone();
        refs.insert(rid, rv);
        slot
    }

    /// Returns the slot registered under `rid`, if any.
    pub fn lookup(&self, rid: Rrid) -> Option<Slot<Answer<V>>> {
        self.refs.lock().get(&rid).map(|rv| rv.slot.clone())
    }

    /// Stores an answer under `rid`. At most one put against any given
    /// reference ever succeeds.
    ///
    /// On an unbuffered slot this suspends the caller until the value
    /// is consumed.
    pub async fn put(&self, rid: Rrid, answer: Answer<V>) -> Result<()> {
        let slot = self.lookup_or_register(rid, WorkerId::from(0u32));
        slot.put(answer).await
    }

    /// Consumes the answer stored under `rid`, suspending while the
    /// slot is empty. The entry is removed once consumed.
    pub async fn take(&self, rid: Rrid, waiting_for: WorkerId) -> Answer<V> {
        let slot = self.lookup_or_register(rid, waiting_for);
        let answer = slot.take().await;
        self.refs.lock().remove(&rid);
        answer
    }

    /// Clones the answer stored under `rid` without consuming it,
    /// suspending while the slot is empty.
    pub async fn fetch(&self, rid: Rrid, waiting_for: WorkerId) -> Answer<V> {
        let slot = self.lookup_or_register(rid, waiting_for);
        slot.fetch().await
    }

    /// Returns the lock serializing remote takes against `rid`,
    /// if the underlying slot is unbuffered.
    pub fn sync_lock_of(&self, rid: Rrid) -> Option<Semaphore> {
        self.refs
            .lock()
            .get(&rid)
            .and_then(|rv| rv.sync_lock.clone())
    }

    /// Records that worker `wid` now holds a handle to `rid`.
    pub fn add_client(&self, rid: Rrid, wid: WorkerId) {
        let mut refs = self.refs.lock();
        if let Some(rv) = refs.get_mut(&rid) {
            rv.clients.insert(wid.into());
        }
    }

    /// Drops the handles named by `pairs`; entries whose client set
    /// empties out after their value was consumed are reclaimed.
    pub fn remove_clients(&self, pairs: &[(Rrid, WorkerId)]) {
        let mut refs = self.refs.lock();
        for (rid, wid) in pairs {
            let reclaim = match refs.get_mut(rid) {
                Some(rv) => {
                    rv.clients.remove(&u32::from(*wid));
                    rv.clients.is_empty() && rv.slot.is_consumed()
                }
                None => false,
            };
            if reclaim {
                refs.remove(rid);
            }
        }
    }

    /// Drops the entry registered under `rid`, regardless of state.
    pub fn forget(&self, rid: Rrid) {
        self.refs.lock().remove(&rid);
    }

    /// Resolves every value still waiting on worker `wid` to a
    /// `RemoteException`, unblocking their consumers. Returns how many
    /// entries were failed.
    pub fn fail_all_waiting_on(&self, wid: WorkerId) -> usize {
        let slots = {
            let mut refs = self.refs.lock();
            let mut slots = Vec::new();
            for (_, rv) in refs.iter_mut() {
                if rv.waiting_for == u32::from(wid) {
                    rv.waiting_for = 0;
                    slots.push(rv.slot.clone());
                }
            }
            slots
        };
        let mut failed = 0;
        for slot in slots {
            let e = RemoteException::new(
                wid,
                CapturedError::new(ErrorKind::Worker, "worker terminated unexpectedly"),
            );
            if slot.put_now(Answer::Exception(e)).is_ok() {
                failed += 1;
            }
        }
        failed
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.refs.lock().len()
    }

    /// Checks if the registry holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for Registry<V> {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;

    fn rid(whence: u32, id: u64) -> Rrid {
        Rrid::new(WorkerId::from(whence), id, 0)
    }

    #[test]
    fn test_no_two_live_values_share_a_rid() {
        let registry: Registry<u64> = Registry::new();
        registry.register(rid(1, 1), true).expect("First register failed");
        assert!(registry.register(rid(1, 1), true).is_err());
        // a distinct tag mints a distinct reference
        registry
            .register(Rrid::new(WorkerId::from(1u32), 1, 1), true)
            .expect("Register with distinct tag failed");
    }

    #[test]
    fn test_at_most_one_put() {
        block_on(async {
            let registry: Registry<u64> = Registry::new();
            registry.put(rid(1, 1), Answer::Value(1)).await.expect("Put failed");
            assert!(registry.put(rid(1, 1), Answer::Value(2)).await.is_err());
        });
    }

    #[test]
    fn test_take_reclaims_the_entry() {
        block_on(async {
            let registry: Registry<u64> = Registry::new();
            registry.put(rid(1, 7), Answer::Value(7)).await.expect("Put failed");
            assert_eq!(registry.len(), 1);
            match registry.take(rid(1, 7), WorkerId::from(0u32)).await {
                Answer::Value(v) => assert_eq!(v, 7),
                other => panic!("Unexpected answer: {:?}", other),
            }
            assert!(registry.is_empty());
        });
    }

    #[test]
    fn test_fetch_leaves_the_entry() {
        block_on(async {
            let registry: Registry<u64> = Registry::new();
            registry.put(rid(1, 7), Answer::Value(7)).await.expect("Put failed");
            registry.fetch(rid(1, 7), WorkerId::from(0u32)).await;
            assert_eq!(registry.len(), 1);
        });
    }

    #[test]
    fn test_client_tracking_reclaims_consumed_entries() {
        block_on(async {
            let registry: Registry<u64> = Registry::new();
            let r = rid(1, 3);
            registry.put(r, Answer::Value(3)).await.expect("Put failed");
            registry.add_client(r, WorkerId::from(2u32));

            let slot = registry.lookup(r).expect("Entry vanished");
            slot.take().await;

            // worker 1 (whence) and worker 2 still hold handles
            registry.remove_clients(&[(r, WorkerId::from(2u32))]);
            assert_eq!(registry.len(), 1);
            registry.remove_clients(&[(r, WorkerId::from(1u32))]);
            assert!(registry.is_empty());
        });
    }

    #[test]
    fn test_peer_death_fails_waiting_values() {
        block_on(async {
            let registry: Registry<u64> = Registry::new();
            let dead = WorkerId::from(9u32);
            registry.lookup_or_register(rid(1, 1), dead);
            registry.lookup_or_register(rid(1, 2), WorkerId::from(3u32));

            assert_eq!(registry.fail_all_waiting_on(dead), 1);

            match registry.take(rid(1, 1), WorkerId::from(0u32)).await {
                Answer::Exception(e) => assert_eq!(e.pid(), dead),
                other => panic!("Unexpected answer: {:?}", other),
            }
        });
    }
}
