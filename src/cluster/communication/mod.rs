//! Communication primitives for `coven`: worker identity, the node
//! handle multiplexing remote calls over per-peer streams, and the
//! public RPC verbs.

#[cfg(not(feature = "expose_impl"))]
pub(crate) mod socket;

#[cfg(feature = "expose_impl")]
pub mod socket;

pub mod channel;
pub mod framing;
pub mod message;
pub mod serialize;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::Arc;

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use intmap::IntMap;
use log::{error, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::cluster::async_runtime as rt;
use crate::cluster::communication::channel::{
    new_message_channel, MessageChannelRx, MessageChannelTx,
};
use crate::cluster::communication::framing::Cookie;
use crate::cluster::communication::message::{
    Answer, CapturedError, RemoteException, Rrid, SystemMessage, Thunk, WireMessage,
};
use crate::cluster::communication::serialize::ClusterData;
use crate::cluster::dispatch::{self, ConnParams};
use crate::cluster::error::*;
use crate::cluster::executable::Executor;
use crate::cluster::launch::{ClusterManager, WorkerConfig};
use crate::cluster::registry::Registry;
use crate::cluster::supervisor::ClusterEvent;
use crate::cluster::topology::{self, Topology};
use crate::cluster::worker::{Worker, WorkerState, WorkerTable};

/// A `WorkerId` represents the id of a process in the cluster.
///
/// Id 1 is the controller; ids 2 and up are workers. Id 0 is never a
/// valid peer, and doubles as the "not yet assigned" marker of a fresh
/// worker process.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    /// The id of the controller process.
    pub const CONTROLLER: WorkerId = WorkerId(1);

    /// Checks whether this id names the controller.
    pub fn is_controller(self) -> bool {
        self == Self::CONTROLLER
    }

    pub fn targets<I>(into_iterator: I) -> impl Iterator<Item = Self>
    where
        I: IntoIterator<Item = u32>,
    {
        into_iterator.into_iter().map(Self)
    }
}

impl From<u32> for WorkerId {
    #[inline]
    fn from(id: u32) -> WorkerId {
        WorkerId(id)
    }
}

impl From<WorkerId> for u32 {
    #[inline]
    fn from(id: WorkerId) -> u32 {
        id.0
    }
}

impl From<WorkerId> for u64 {
    #[inline]
    fn from(id: WorkerId) -> u64 {
        id.0 as u64
    }
}

impl From<WorkerId> for usize {
    #[inline]
    fn from(id: WorkerId) -> usize {
        id.0 as usize
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The object-safe duplex stream connecting two peers.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> DuplexStream for T {}

/// A boxed duplex stream, as handed out by a `ClusterManager`.
pub type Duplex = Box<dyn DuplexStream>;

/// The read half of a peer stream; owned by its dispatcher task.
pub(crate) type RxStream = ReadHalf<Duplex>;

/// The write half of a peer stream; owned by its worker record.
pub(crate) type TxStream = WriteHalf<Duplex>;

// rrid tags minted by the verbs of this module
pub(crate) const TAG_CALL: u32 = 1;
pub(crate) const TAG_FETCH: u32 = 2;
pub(crate) const TAG_WAIT: u32 = 3;
pub(crate) const TAG_JOIN: u32 = 4;
pub(crate) const TAG_REF: u32 = 5;

/// A client-side handle to the eventual result of a remote call.
///
/// Futures carry ids only; resolving one goes through the node that
/// minted it. A fetched value is cached locally, so repeated fetches
/// hit the wire at most once.
pub struct Future<V> {
    home: WorkerId,
    rid: Rrid,
    v: Mutex<Option<V>>,
}

impl<V> Future<V> {
    pub(crate) fn new(home: WorkerId, rid: Rrid) -> Self {
        Future {
            home,
            rid,
            v: Mutex::new(None),
        }
    }

    /// Returns the id of the worker holding the value.
    pub fn home(&self) -> WorkerId {
        self.home
    }

    /// Returns the reference id naming the value.
    pub fn rrid(&self) -> Rrid {
        self.rid
    }

    fn cached(&self) -> Option<V>
    where
        V: Clone,
    {
        self.v.lock().clone()
    }

    fn cache(&self, v: V) {
        let mut cached = self.v.lock();
        if cached.is_none() {
            *cached = Some(v);
        }
    }
}

impl<V: Clone> Clone for Future<V> {
    fn clone(&self) -> Self {
        Future {
            home: self.home,
            rid: self.rid,
            v: Mutex::new(self.v.lock().clone()),
        }
    }
}

impl<V> fmt::Debug for Future<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Future(home: {}, rid: {:?})", self.home, self.rid)
    }
}

/// Represents the configuration used to bootstrap a `Node`.
pub struct NodeConfig {
    /// The id of this node; `WorkerId(0)` for a fresh worker that will
    /// adopt its id from the controller's join message.
    pub id: WorkerId,
    /// The shared secret admitting peers into the cluster.
    pub cookie: Cookie,
    /// Whether this node owns its OS process. Standalone nodes honor
    /// the fatal exit codes of the protocol; in-process nodes (as
    /// launched by `LocalManager`) merely shut down their tasks.
    pub standalone: bool,
}

impl NodeConfig {
    /// Configuration for the controller process of a cluster.
    pub fn controller(cookie: Cookie) -> Self {
        NodeConfig {
            id: WorkerId::CONTROLLER,
            cookie,
            standalone: true,
        }
    }

    /// Configuration for a fresh worker process awaiting its id.
    pub fn worker(cookie: Cookie) -> Self {
        NodeConfig {
            id: WorkerId(0),
            cookie,
            standalone: true,
        }
    }

    /// Marks the node as sharing its OS process with other nodes.
    pub fn in_process(mut self) -> Self {
        self.standalone = false;
        self
    }
}

/// A `Node` is one process's view of the cluster: its identity, its
/// peers, its remote values, and the machinery to call into the other
/// members. Cloning a `Node` clones a cheap handle to the same state.
pub struct Node<D: ClusterData> {
    inner: Arc<NodeInner<D>>,
}

impl<D: ClusterData> Clone for Node<D> {
    fn clone(&self) -> Self {
        Node {
            inner: self.inner.clone(),
        }
    }
}

struct NodeInner<D: ClusterData> {
    id: AtomicU32,
    cookie: Cookie,
    standalone: bool,
    manager: Box<dyn ClusterManager>,
    executor: Executor<D>,
    registry: Registry<D::Value>,
    workers: WorkerTable,
    // stream identity -> worker id, bound at identity exchange
    sock_map: Mutex<IntMap<u32>>,
    // write halves of accepted streams, parked until the peer
    // identifies itself
    pending_tx: Mutex<IntMap<TxStream>>,
    conn_counter: AtomicU64,
    ref_counter: AtomicU64,
    worker_counter: AtomicU32,
    default_pool: Mutex<Vec<WorkerId>>,
    topology: Mutex<Topology>,
    lazy: AtomicBool,
    threaded_blas: AtomicBool,
    // serializes join handshakes, so every fresh worker observes a
    // consistent membership list
    join_lock: futures::lock::Mutex<()>,
    ev_tx: MessageChannelTx<ClusterEvent>,
    ev_rx: Mutex<Option<MessageChannelRx<ClusterEvent>>>,
}

impl<D: ClusterData> Node<D> {
    // max no. of events buffered for the supervisor
    const EVENT_CHAN_BOUND: usize = 128;

    /// Bootstraps a new `Node` from its configuration, the manager
    /// that launches and connects its peers, and the executor running
    /// its service.
    pub fn new(cfg: NodeConfig, manager: Box<dyn ClusterManager>, executor: Executor<D>) -> Self {
        let (ev_tx, ev_rx) = new_message_channel(Self::EVENT_CHAN_BOUND);
        Node {
            inner: Arc::new(NodeInner {
                id: AtomicU32::new(cfg.id.into()),
                cookie: cfg.cookie,
                standalone: cfg.standalone,
                manager,
                executor,
                registry: Registry::new(),
                workers: WorkerTable::new(),
                sock_map: Mutex::new(IntMap::new()),
                pending_tx: Mutex::new(IntMap::new()),
                conn_counter: AtomicU64::new(1),
                ref_counter: AtomicU64::new(1),
                worker_counter: AtomicU32::new(2),
                default_pool: Mutex::new(Vec::new()),
                topology: Mutex::new(Topology::AllToAll),
                lazy: AtomicBool::new(false),
                threaded_blas: AtomicBool::new(false),
                join_lock: futures::lock::Mutex::new(()),
                ev_tx,
                ev_rx: Mutex::new(Some(ev_rx)),
            }),
        }
    }

    /// Returns the id of this node.
    pub fn id(&self) -> WorkerId {
        WorkerId(self.inner.id.load(Ordering::Acquire))
    }

    /// Checks whether this node is the controller of its cluster.
    pub fn is_controller(&self) -> bool {
        self.id().is_controller()
    }

    pub(crate) fn set_id(&self, id: WorkerId) {
        self.inner.id.store(id.into(), Ordering::Release);
    }

    pub(crate) fn cookie(&self) -> &Cookie {
        &self.inner.cookie
    }

    pub(crate) fn standalone(&self) -> bool {
        self.inner.standalone
    }

    pub(crate) fn manager(&self) -> &dyn ClusterManager {
        &*self.inner.manager
    }

    pub(crate) fn executor(&self) -> &Executor<D> {
        &self.inner.executor
    }

    pub(crate) fn registry(&self) -> &Registry<D::Value> {
        &self.inner.registry
    }

    pub(crate) fn workers(&self) -> &WorkerTable {
        &self.inner.workers
    }

    pub(crate) fn join_lock(&self) -> &futures::lock::Mutex<()> {
        &self.inner.join_lock
    }

    /// Returns the ids of the workers available for new work.
    pub fn default_pool(&self) -> Vec<WorkerId> {
        self.inner.default_pool.lock().clone()
    }

    pub(crate) fn pool_add(&self, wid: WorkerId) {
        let mut pool = self.inner.default_pool.lock();
        if !pool.contains(&wid) {
            pool.push(wid);
        }
    }

    pub(crate) fn pool_remove(&self, wid: WorkerId) {
        self.inner.default_pool.lock().retain(|w| *w != wid);
    }

    /// Returns the connectivity pattern of this cluster.
    pub fn topology(&self) -> Topology {
        *self.inner.topology.lock()
    }

    pub(crate) fn set_topology(&self, topology: Topology, lazy: bool) {
        *self.inner.topology.lock() = topology;
        self.inner.lazy.store(lazy, Ordering::Release);
    }

    /// Reports whether worker connections are deferred to first use.
    pub fn lazy(&self) -> bool {
        self.inner.lazy.load(Ordering::Acquire)
    }

    pub(crate) fn set_threaded_blas(&self, enabled: bool) {
        self.inner.threaded_blas.store(enabled, Ordering::Release);
    }

    /// Reports the advisory math-kernel threading knob of the cluster.
    pub fn threaded_blas(&self) -> bool {
        self.inner.threaded_blas.load(Ordering::Acquire)
    }

    /// Takes the receiving end of this node's cluster event stream.
    ///
    /// Events are droppable observability: when nobody consumes them,
    /// the node never blocks on their behalf.
    pub fn events(&self) -> Option<MessageChannelRx<ClusterEvent>> {
        self.inner.ev_rx.lock().take()
    }

    pub(crate) fn emit_event(&self, event: ClusterEvent) {
        let mut tx = self.inner.ev_tx.clone();
        let _ = tx.try_send(event);
    }

    pub(crate) fn next_ref_id(&self) -> u64 {
        self.inner.ref_counter.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.inner.conn_counter.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn next_worker_id(&self) -> WorkerId {
        WorkerId(self.inner.worker_counter.fetch_add(1, Ordering::AcqRel))
    }

    pub(crate) fn bind_conn(&self, conn: u64, wid: WorkerId) {
        let mut map = self.inner.sock_map.lock();
        map.remove(conn);
        map.insert(conn, wid.into());
    }

    pub(crate) fn conn_worker(&self, conn: u64) -> Option<WorkerId> {
        self.inner.sock_map.lock().get(conn).copied().map(WorkerId)
    }

    pub(crate) fn unbind_conn(&self, conn: u64) {
        self.inner.sock_map.lock().remove(conn);
        self.inner.pending_tx.lock().remove(conn);
    }

    pub(crate) fn stash_pending_tx(&self, conn: u64, tx: TxStream) {
        self.inner.pending_tx.lock().insert(conn, tx);
    }

    pub(crate) fn take_pending_tx(&self, conn: u64) -> Option<TxStream> {
        self.inner.pending_tx.lock().remove(conn)
    }

    /// Adopts an incoming connection: the peer is expected to open the
    /// handshake and identify itself in its first message.
    pub fn accept(&self, stream: Duplex) {
        let (rx, tx) = stream.split();
        let conn = self.next_conn_id();
        self.stash_pending_tx(conn, tx);
        let node = self.clone();
        rt::spawn(dispatch::message_loop(
            node,
            rx,
            ConnParams {
                conn,
                incoming: true,
            },
        ));
    }

    /// Binds a listening socket and accepts cluster connections on it
    /// until the node shuts down. Returns the bound address.
    #[cfg(any(feature = "socket_tokio_tcp", feature = "socket_async_std_tcp"))]
    pub async fn listen<A: Into<std::net::SocketAddr>>(&self, addr: A) -> Result<std::net::SocketAddr> {
        let listener = socket::bind(addr).await?;
        let local = listener.local_addr()?;
        let node = self.clone();
        rt::spawn(async move {
            loop {
                if let Ok(sock) = listener.accept().await {
                    node.accept(Box::new(sock));
                }
            }
        });
        Ok(local)
    }

    /// Opens an outgoing stream to peer `pid`, writes the handshake
    /// preamble, and starts a dispatcher on the read half. The caller
    /// still owes the peer an identity (`IdentifySocket` or
    /// `JoinPgrp`).
    pub(crate) fn connect_worker<'a>(
        &'a self,
        pid: WorkerId,
        cfg: &'a WorkerConfig,
    ) -> futures::future::BoxFuture<'a, Result<Arc<Worker>>> {
        Box::pin(async move {
            let worker = match self.workers().get(pid) {
                Some(w) => w,
                None => {
                    let w = Worker::new(pid, cfg.clone(), WorkerState::Connecting);
                    self.workers().register(w.clone())?;
                    w
                }
            };
            let stream = self.manager().connect(pid, cfg).await?;
            let (rx, mut tx) = stream.split();
            framing::write_handshake(&mut tx, self.cookie()).await?;
            worker.attach_tx(tx).await;
            worker.set_state(WorkerState::Connecting);
            let conn = self.next_conn_id();
            self.bind_conn(conn, pid);
            rt::spawn(dispatch::message_loop(
                self.clone(),
                rx,
                ConnParams {
                    conn,
                    incoming: false,
                },
            ));
            Ok(worker)
        })
    }

    /// Resolves a worker id to its record, waiting out an in-flight
    /// handshake and, on a lazy mesh, performing the deferred connect.
    pub(crate) async fn worker_from_id(&self, pid: WorkerId) -> Result<Arc<Worker>> {
        let worker = match self.workers().get(pid) {
            Some(w) => w,
            None if self.workers().is_deleted(pid) => {
                return Err(Error::remote(RemoteException::new(
                    pid,
                    CapturedError::new(ErrorKind::Worker, "process exited"),
                )));
            }
            None => {
                return Err("No connection to the requested worker")
                    .wrapped(ErrorKind::Communication);
            }
        };
        loop {
            match worker.state() {
                WorkerState::Connected => return Ok(worker),
                WorkerState::Unknown => {
                    return Err("Peer could not be reached").wrapped(ErrorKind::Communication);
                }
                WorkerState::Connecting => {
                    worker.initialized().wait().await;
                }
                WorkerState::Created => {
                    if worker.try_transition(WorkerState::Created, WorkerState::Connecting) {
                        // elected to run the deferred connect
                        topology::connect_lazy(self, &worker).await?;
                    } else {
                        worker.initialized().wait().await;
                    }
                }
                WorkerState::Terminating | WorkerState::Terminated => {
                    return Err(Error::remote(RemoteException::new(
                        pid,
                        CapturedError::new(ErrorKind::Worker, "process exited"),
                    )));
                }
            }
        }
    }

    /// Sends a system message to peer `pid`.
    pub(crate) async fn send_to(
        &self,
        pid: WorkerId,
        response_oid: Rrid,
        notify_oid: Rrid,
        msg: &SystemMessage<D::Operation, D::Value>,
    ) -> Result<()> {
        let worker = self.worker_from_id(pid).await?;
        self.send_system_msg(&worker, response_oid, notify_oid, msg)
            .await
    }

    /// Sends a system message on an established worker stream,
    /// flushing any batched refcount notifications first.
    pub(crate) async fn send_system_msg(
        &self,
        worker: &Arc<Worker>,
        response_oid: Rrid,
        notify_oid: Rrid,
        msg: &SystemMessage<D::Operation, D::Value>,
    ) -> Result<()> {
        self.flush_gc_msgs(worker).await?;
        self.raw_send(worker, response_oid, notify_oid, msg).await
    }

    /// Drains the batched `add_client`/`del_client` notifications of a
    /// worker into `RemoteDo` frames.
    pub(crate) async fn flush_gc_msgs(&self, worker: &Arc<Worker>) -> Result<()> {
        let adds = std::mem::take(&mut *worker.add_msgs.lock());
        let dels = std::mem::take(&mut *worker.del_msgs.lock());
        for (rid, wid) in adds {
            let msg = SystemMessage::RemoteDo(Thunk::AddClient(rid, wid));
            self.raw_send(worker, Rrid::NULL, Rrid::NULL, &msg).await?;
        }
        if !dels.is_empty() {
            let msg = SystemMessage::RemoteDo(Thunk::DelClients(dels.into_vec()));
            self.raw_send(worker, Rrid::NULL, Rrid::NULL, &msg).await?;
        }
        Ok(())
    }

    /// Serializes and writes one frame, holding the peer's write lock
    /// for exactly that long.
    pub(crate) async fn raw_send(
        &self,
        worker: &Arc<Worker>,
        response_oid: Rrid,
        notify_oid: Rrid,
        msg: &SystemMessage<D::Operation, D::Value>,
    ) -> Result<()> {
        let mut body: SmallVec<[u8; 1024]> = SmallVec::new();
        D::serialize_message(&mut body, msg)?;
        let wm = WireMessage::new(self.id(), response_oid, notify_oid, &body[..]);
        let mut guard = worker.tx().lock().await;
        match guard.as_mut() {
            Some(stream) => framing::write_frame(stream, wm.header(), wm.body()).await,
            None => {
                Err("Worker stream is not attached").wrapped(ErrorKind::Communication)
            }
        }
    }

    /// Closes every peer stream and marks the whole directory
    /// terminated. Used by in-process nodes in place of an exit code.
    pub async fn shutdown(&self) {
        for worker in self.workers().all() {
            worker.set_state(WorkerState::Terminated);
            worker.close_tx().await;
        }
    }
}

// the public RPC verbs
impl<D: ClusterData> Node<D> {
    /// Submits `op` for evaluation on worker `pid`, returning a handle
    /// to the eventual result.
    pub async fn remotecall(&self, pid: WorkerId, op: D::Operation) -> Result<Future<D::Value>> {
        let rid = Rrid::new(self.id(), self.next_ref_id(), TAG_CALL);
        if pid == self.id() {
            let slot = self.registry().register(rid, true)?;
            let pending = self.executor().submit(op);
            let myid = self.id();
            rt::spawn(async move {
                let answer = dispatch::outcome_to_answer::<D>(myid, pending.await);
                if let Err(e) = slot.put(answer).await {
                    warn!("Dropping duplicate local result: {}", e);
                }
            });
        } else {
            let msg = SystemMessage::Call(Thunk::Apply(op));
            self.send_to(pid, rid, Rrid::NULL, &msg).await?;
        }
        Ok(Future::new(pid, rid))
    }

    /// Evaluates `op` on worker `pid` and returns its value, blocking
    /// the calling task for the round trip.
    pub async fn remotecall_fetch(&self, pid: WorkerId, op: D::Operation) -> Result<D::Value> {
        if pid == self.id() {
            let pending = self.executor().submit(op);
            let answer = dispatch::outcome_to_answer::<D>(self.id(), pending.await);
            return answer_to_value(answer);
        }
        let answer = self.call_fetch_thunk(pid, Thunk::Apply(op)).await?;
        answer_to_value(answer)
    }

    /// Evaluates `op` on worker `pid`, returning a handle to the
    /// result once the evaluation has completed.
    pub async fn remotecall_wait(&self, pid: WorkerId, op: D::Operation) -> Result<Future<D::Value>> {
        if pid == self.id() {
            let fut = self.remotecall(pid, op).await?;
            self.wait(&fut).await?;
            return Ok(fut);
        }
        let id = self.next_ref_id();
        let rid = Rrid::new(self.id(), id, TAG_CALL);
        let oid = Rrid::new(self.id(), id, TAG_WAIT);
        self.registry().lookup_or_register(oid, pid);
        let msg = SystemMessage::CallWait(Thunk::Apply(op));
        if let Err(e) = self.send_to(pid, rid, oid, &msg).await {
            self.registry().forget(oid);
            return Err(e);
        }
        match self.registry().take(oid, pid).await {
            Answer::Done => Ok(Future::new(pid, rid)),
            Answer::Exception(e) => Err(Error::remote(e)),
            _ => Err("Unexpected completion answer").wrapped(ErrorKind::Communication),
        }
    }

    /// Fire-and-forget evaluation of `op` on worker `pid`; failures
    /// are only ever logged on the remote side.
    pub async fn remote_do(&self, pid: WorkerId, op: D::Operation) -> Result<()> {
        if pid == self.id() {
            let pending = self.executor().submit(op);
            rt::spawn(async move {
                if let Ok(Err(e)) = pending.await {
                    error!("Fire-and-forget operation failed: {}", e);
                }
            });
            return Ok(());
        }
        let msg = SystemMessage::RemoteDo(Thunk::Apply(op));
        self.send_to(pid, Rrid::NULL, Rrid::NULL, &msg).await
    }

    /// Mints a fresh reference owned by this node, to be filled by a
    /// `put` later on. Unbuffered references rendezvous their putter
    /// with their taker.
    pub fn make_ref(&self, buffered: bool) -> Result<Future<D::Value>> {
        let rid = Rrid::new(self.id(), self.next_ref_id(), TAG_REF);
        self.registry().register(rid, buffered)?;
        Ok(Future::new(self.id(), rid))
    }

    /// Retrieves the value of `fut`, waiting for it to be produced.
    /// The value stays in place, and is cached in the handle.
    pub async fn fetch(&self, fut: &Future<D::Value>) -> Result<D::Value> {
        if let Some(v) = fut.cached() {
            return Ok(v);
        }
        let answer = if fut.home() == self.id() {
            self.registry().fetch(fut.rrid(), WorkerId(0)).await
        } else {
            self.call_fetch_thunk(fut.home(), Thunk::FetchRef(fut.rrid()))
                .await?
        };
        let v = answer_to_value(answer)?;
        fut.cache(v.clone());
        Ok(v)
    }

    /// Consumes the value of `fut` out of its slot, waiting for it to
    /// be produced.
    pub async fn take(&self, fut: &Future<D::Value>) -> Result<D::Value> {
        let answer = if fut.home() == self.id() {
            self.registry().take(fut.rrid(), WorkerId(0)).await
        } else {
            self.call_fetch_thunk(fut.home(), Thunk::TakeRef(fut.rrid()))
                .await?
        };
        answer_to_value(answer)
    }

    /// Stores `value` into `fut`. At most one put against any given
    /// reference ever succeeds.
    pub async fn put(&self, fut: &Future<D::Value>, value: D::Value) -> Result<()> {
        if fut.home() == self.id() {
            return self
                .registry()
                .put(fut.rrid(), Answer::Value(value))
                .await;
        }
        let answer = self
            .call_fetch_thunk(fut.home(), Thunk::PutRef(fut.rrid(), value))
            .await?;
        match answer {
            Answer::Done => Ok(()),
            Answer::Exception(e) => Err(Error::remote(e)),
            _ => Err("Unexpected put answer").wrapped(ErrorKind::Communication),
        }
    }

    /// Waits until the value of `fut` has been produced, without
    /// transferring it.
    pub async fn wait(&self, fut: &Future<D::Value>) -> Result<()> {
        let answer = if fut.home() == self.id() {
            self.registry().fetch(fut.rrid(), WorkerId(0)).await
        } else {
            let oid = Rrid::new(self.id(), self.next_ref_id(), TAG_WAIT);
            self.registry().lookup_or_register(oid, fut.home());
            let msg = SystemMessage::CallWait(Thunk::FetchRef(fut.rrid()));
            if let Err(e) = self.send_to(fut.home(), Rrid::NULL, oid, &msg).await {
                self.registry().forget(oid);
                return Err(e);
            }
            self.registry().take(oid, fut.home()).await
        };
        match answer {
            Answer::Exception(e) => Err(Error::remote(e)),
            _ => Ok(()),
        }
    }

    /// Records that worker `wid` received a handle to `fut`. The
    /// notification is batched until the next frame to the owner.
    pub async fn share(&self, fut: &Future<D::Value>, wid: WorkerId) -> Result<()> {
        if fut.home() == self.id() {
            self.registry().add_client(fut.rrid(), wid);
            return Ok(());
        }
        let worker = self.worker_from_id(fut.home()).await?;
        worker.add_msgs.lock().push((fut.rrid(), wid));
        Ok(())
    }

    /// Drops this node's handle to `fut`, allowing the owner to
    /// reclaim the value once every holder has let go.
    pub async fn release(&self, fut: &Future<D::Value>) -> Result<()> {
        if fut.home() == self.id() {
            self.registry()
                .remove_clients(&[(fut.rrid(), self.id())]);
            return Ok(());
        }
        let worker = self.worker_from_id(fut.home()).await?;
        worker.del_msgs.lock().push((fut.rrid(), self.id()));
        Ok(())
    }

    /// One-shot round trip: sends a `CallFetch` and waits for the
    /// answer frame addressed back at our notify reference.
    pub(crate) async fn call_fetch_thunk(
        &self,
        pid: WorkerId,
        thunk: Thunk<D::Operation, D::Value>,
    ) -> Result<Answer<D::Value>> {
        let oid = Rrid::new(self.id(), self.next_ref_id(), TAG_FETCH);
        self.registry().lookup_or_register(oid, pid);
        let msg = SystemMessage::CallFetch(thunk);
        if let Err(e) = self.send_to(pid, Rrid::NULL, oid, &msg).await {
            self.registry().forget(oid);
            return Err(e);
        }
        Ok(self.registry().take(oid, pid).await)
    }
}

/// Maps a slot answer to the value the verbs promised their caller.
pub(crate) fn answer_to_value<V>(answer: Answer<V>) -> Result<V> {
    match answer {
        Answer::Value(v) => Ok(v),
        Answer::Exception(e) => Err(Error::remote(e)),
        Answer::Done | Answer::Joined(_) => {
            Err("Peer answered without a value").wrapped(ErrorKind::Communication)
        }
    }
}
