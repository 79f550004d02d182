//! Worker records and the process-local directory of peers.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::io::AsyncWriteExt;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::cluster::collections::{self, HashMap, HashSet};
use crate::cluster::communication::channel::Event;
use crate::cluster::communication::message::Rrid;
use crate::cluster::communication::{TxStream, WorkerId};
use crate::cluster::error::*;
use crate::cluster::launch::WorkerConfig;

/// The lifecycle state of a peer worker.
///
/// `Terminating` and `Terminated` are terminal: once either is
/// observed, the only transition still allowed is
/// `Terminating -> Terminated`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum WorkerState {
    /// Known but not yet connected; lazy peers park here.
    Created = 0,
    /// A connection attempt is underway.
    Connecting = 1,
    /// Identity exchange completed; the peer is usable.
    Connected = 2,
    /// The controller decided to remove this peer.
    Terminating = 3,
    /// Streams closed, entry purged from the table.
    Terminated = 4,
    /// The peer never identified itself.
    Unknown = 5,
}

impl WorkerState {
    fn from_u8(raw: u8) -> WorkerState {
        match raw {
            0 => WorkerState::Created,
            1 => WorkerState::Connecting,
            2 => WorkerState::Connected,
            3 => WorkerState::Terminating,
            4 => WorkerState::Terminated,
            _ => WorkerState::Unknown,
        }
    }
}

/// Information reported by a worker when its join completes.
#[derive(Debug, Default, Copy, Clone)]
pub struct JoinInfo {
    pub cpu_threads: u32,
    pub ospid: u32,
}

/// A peer process in the cluster.
///
/// The worker record is the exclusive owner of the write half of its
/// stream; the read half lives in the dispatcher task. Peers refer to
/// one another by id only, never by pointer, which keeps the strongly
/// cyclic all-to-all mesh shape out of the ownership graph.
pub struct Worker {
    id: WorkerId,
    state: AtomicU8,
    version: Mutex<Option<String>>,
    config: WorkerConfig,
    tx: futures::lock::Mutex<Option<TxStream>>,
    initialized: Event,
    join_info: Mutex<JoinInfo>,
    // distributed refcount notifications, batched until the next send
    pub(crate) del_msgs: Mutex<SmallVec<[(Rrid, WorkerId); 4]>>,
    pub(crate) add_msgs: Mutex<SmallVec<[(Rrid, WorkerId); 4]>>,
}

impl Worker {
    /// Creates a new worker record in the given initial state.
    pub fn new(id: WorkerId, config: WorkerConfig, state: WorkerState) -> Arc<Worker> {
        Arc::new(Worker {
            id,
            state: AtomicU8::new(state as u8),
            version: Mutex::new(None),
            config,
            tx: futures::lock::Mutex::new(None),
            initialized: Event::new(),
            join_info: Mutex::new(JoinInfo::default()),
            del_msgs: Mutex::new(SmallVec::new()),
            add_msgs: Mutex::new(SmallVec::new()),
        })
    }

    /// Returns the id of this worker.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Returns the current lifecycle state of this worker.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically transitions this worker to `new`.
    ///
    /// Returns `false` when the transition is not allowed, i.e. the
    /// worker has already reached a terminal state.
    pub fn set_state(&self, new: WorkerState) -> bool {
        loop {
            let curr = self.state.load(Ordering::Acquire);
            match WorkerState::from_u8(curr) {
                WorkerState::Terminated => return false,
                WorkerState::Terminating if new != WorkerState::Terminated => return false,
                _ => (),
            }
            if self
                .state
                .compare_exchange(curr, new as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Attempts the transition `from -> to`, failing if the current
    /// state is any other. Used to elect the single task allowed to
    /// connect a lazy peer.
    pub fn try_transition(&self, from: WorkerState, to: WorkerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns the configuration this worker was created with.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Returns the advisory version announced by this worker, if known.
    pub fn version(&self) -> Option<String> {
        self.version.lock().clone()
    }

    /// Records the advisory version announced by this worker.
    pub fn set_version(&self, version: String) {
        *self.version.lock() = Some(version);
    }

    /// The one-shot condition signaled once this worker completed its
    /// identity exchange and is ready for traffic.
    pub fn initialized(&self) -> &Event {
        &self.initialized
    }

    /// Returns the information the worker reported on join.
    pub fn join_info(&self) -> JoinInfo {
        *self.join_info.lock()
    }

    /// Records the information the worker reported on join.
    pub fn set_join_info(&self, info: JoinInfo) {
        *self.join_info.lock() = info;
    }

    /// The mutex-guarded write half of this worker's stream. Senders
    /// lock it for the duration of exactly one frame.
    pub(crate) fn tx(&self) -> &futures::lock::Mutex<Option<TxStream>> {
        &self.tx
    }

    /// Installs the write half of a freshly established stream.
    pub(crate) async fn attach_tx(&self, stream: TxStream) {
        *self.tx.lock().await = Some(stream);
    }

    /// Closes the write half of this worker's stream, if one is
    /// attached. The read half closes when its dispatcher exits.
    pub(crate) async fn close_tx(&self) {
        let mut guard = self.tx.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.close().await;
        }
    }
}

/// The process-local directory of peers, keyed by worker id.
pub struct WorkerTable {
    workers: Mutex<HashMap<u32, Arc<Worker>>>,
    // ids of workers that have been deregistered; consulted during
    // failure handling to tell removal from genuine unknowns
    deleted: Mutex<HashSet<u32>>,
}

impl WorkerTable {
    /// Creates an empty worker table.
    pub fn new() -> Self {
        WorkerTable {
            workers: Mutex::new(collections::hash_map()),
            deleted: Mutex::new(collections::hash_set()),
        }
    }

    /// Inserts a worker into the table, asserting id uniqueness.
    pub fn register(&self, worker: Arc<Worker>) -> Result<()> {
        let mut workers = self.workers.lock();
        let id = u32::from(worker.id());
        if workers.contains_key(&id) {
            return Err("Worker id is already registered").wrapped(ErrorKind::Worker);
        }
        workers.insert(id, worker);
        Ok(())
    }

    /// Returns the worker registered under `id`, if any.
    pub fn get(&self, id: WorkerId) -> Option<Arc<Worker>> {
        self.workers.lock().get(&u32::from(id)).cloned()
    }

    /// Removes the worker registered under `id`, remembering the id in
    /// the deleted set.
    pub fn remove(&self, id: WorkerId) -> Option<Arc<Worker>> {
        let removed = self.workers.lock().remove(&u32::from(id));
        if removed.is_some() {
            self.deleted.lock().insert(u32::from(id));
        }
        removed
    }

    /// Checks whether `id` was deregistered at some point in the past.
    pub fn is_deleted(&self, id: WorkerId) -> bool {
        self.deleted.lock().contains(&u32::from(id))
    }

    /// Returns the ids of every registered worker, in ascending order.
    pub fn ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<_> = self.workers.lock().keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(WorkerId::from).collect()
    }

    /// Returns every registered worker.
    pub fn all(&self) -> Vec<Arc<Worker>> {
        self.workers.lock().values().cloned().collect()
    }
}

impl Default for WorkerTable {
    fn default() -> Self {
        WorkerTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: u32, state: WorkerState) -> Arc<Worker> {
        Worker::new(WorkerId::from(id), WorkerConfig::default(), state)
    }

    #[test]
    fn test_terminal_states_stay_terminal() {
        let w = worker(2, WorkerState::Connected);
        assert!(w.set_state(WorkerState::Terminating));
        // no coming back from a terminating worker
        assert!(!w.set_state(WorkerState::Connected));
        assert!(w.set_state(WorkerState::Terminated));
        assert!(!w.set_state(WorkerState::Connecting));
        assert_eq!(w.state(), WorkerState::Terminated);
    }

    #[test]
    fn test_lazy_connect_election() {
        let w = worker(3, WorkerState::Created);
        assert!(w.try_transition(WorkerState::Created, WorkerState::Connecting));
        // the second elector loses
        assert!(!w.try_transition(WorkerState::Created, WorkerState::Connecting));
    }

    #[test]
    fn test_table_uniqueness_and_deletion() {
        let table = WorkerTable::new();
        table.register(worker(2, WorkerState::Created)).expect("Register failed");
        assert!(table.register(worker(2, WorkerState::Created)).is_err());

        assert!(!table.is_deleted(WorkerId::from(2u32)));
        table.remove(WorkerId::from(2u32)).expect("Remove failed");
        assert!(table.is_deleted(WorkerId::from(2u32)));
        assert!(table.get(WorkerId::from(2u32)).is_none());
    }
}
