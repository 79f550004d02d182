//! The per-peer message dispatcher.
//!
//! One dispatcher task owns the read half of every peer stream. It
//! validates the handshake on incoming connections, parses frames,
//! routes messages to their handlers, and is the only place that
//! decides between "clean up and continue" and "take the process down"
//! when a connection goes bad. A handler failure never kills the
//! dispatcher; at worst it is reified into a `RemoteException` aimed at
//! the reference ids of the offending frame.

use log::{debug, error, info, warn};

use crate::cluster::async_runtime as rt;
use crate::cluster::communication::channel::SemaphoreGuard;
use crate::cluster::communication::framing;
use crate::cluster::communication::message::{
    Answer, CapturedError, Header, RemoteException, Rrid, SystemMessage, Thunk,
};
use crate::cluster::communication::serialize::ClusterData;
use crate::cluster::communication::{Node, RxStream, WorkerId};
use crate::cluster::error::*;
use crate::cluster::executable::Outcome;
use crate::cluster::launch::WorkerConfig;
use crate::cluster::supervisor::{self, ClusterEvent};
use crate::cluster::topology;
use crate::cluster::worker::{JoinInfo, Worker, WorkerState};

/// Identity of one dispatcher's connection.
pub(crate) struct ConnParams {
    /// Process-unique id of this stream, keying the socket-to-worker map.
    pub conn: u64,
    /// Whether the peer opened this connection, and thus owes us the
    /// handshake preamble.
    pub incoming: bool,
}

/// The reply discipline of a call verb.
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) enum Verb {
    /// Reply with the produced value.
    CallFetch,
    /// Reply with a bare completion acknowledgement.
    CallWait,
}

/// Runs the message loop of one peer stream until the connection
/// dies, then performs the failure protocol.
pub(crate) async fn message_loop<D: ClusterData>(node: Node<D>, mut rx: RxStream, params: ConnParams) {
    let err = match run_loop(&node, &mut rx, &params).await {
        Err(err) => err,
        // the loop only ever exits through an error
        Ok(()) => Error::simple(ErrorKind::Dispatch),
    };
    failed(&node, &params, err).await;
    // the read half closes here, on every exit path
    drop(rx);
}

async fn run_loop<D: ClusterData>(
    node: &Node<D>,
    rx: &mut RxStream,
    params: &ConnParams,
) -> Result<()> {
    let mut peer_version = None;
    if params.incoming {
        let (cookie, version) = framing::read_handshake(rx).await?;
        if cookie != *node.cookie() {
            return Err("Cluster cookie mismatch").wrapped(ErrorKind::CommunicationFraming);
        }
        peer_version = Some(version);
    }
    let mut first = true;
    loop {
        let header = framing::read_header(rx).await?;
        if header.length() > framing::MAX_BODY_LEN {
            return Err("Oversized message body").wrapped(ErrorKind::CommunicationFraming);
        }
        let body = framing::read_body(rx, header.length()).await?;
        match D::deserialize_message(&body[..]) {
            Ok(msg) => {
                handle_msg(node, params, &header, msg, &mut peer_version).await?;
                if first {
                    // the first message must have identified the peer;
                    // checked before touching the stream again, so an
                    // anonymous peer cannot park us on the boundary read
                    match node.conn_worker(params.conn) {
                        Some(wid) if u32::from(wid) > 0 => (),
                        _ => {
                            return Err("Peer sent traffic before identifying itself")
                                .wrapped(ErrorKind::Dispatch);
                        }
                    }
                    first = false;
                }
                framing::read_boundary(rx).await?;
            }
            Err(e) => {
                warn!("Recovering from a poisoned message body: {}", e);
                decode_failure(node, params, &header, e).await;
                framing::resync_to_boundary(rx).await?;
            }
        }
    }
}

async fn handle_msg<D: ClusterData>(
    node: &Node<D>,
    params: &ConnParams,
    header: &Header,
    msg: SystemMessage<D::Operation, D::Value>,
    peer_version: &mut Option<String>,
) -> Result<()> {
    match msg {
        SystemMessage::Call(thunk) => {
            let node = node.clone();
            let response_oid = header.response_oid();
            rt::spawn(async move {
                let (answer, _guard) = run_thunk(&node, thunk).await;
                bind_answer(&node, response_oid, answer).await;
            });
        }
        SystemMessage::CallFetch(thunk) => {
            let node = node.clone();
            let notify_oid = header.notify_oid();
            let peer = header.from();
            rt::spawn(async move {
                let outcome = run_thunk(&node, thunk).await;
                deliver_result(&node, peer, Verb::CallFetch, notify_oid, outcome).await;
            });
        }
        SystemMessage::CallWait(thunk) => {
            let node = node.clone();
            let response_oid = header.response_oid();
            let notify_oid = header.notify_oid();
            let peer = header.from();
            rt::spawn(async move {
                let (answer, guard) = run_thunk(&node, thunk).await;
                if !response_oid.is_null() {
                    bind_answer(&node, response_oid, answer.clone()).await;
                }
                deliver_result(&node, peer, Verb::CallWait, notify_oid, (answer, guard)).await;
            });
        }
        SystemMessage::RemoteDo(thunk) => {
            let node = node.clone();
            rt::spawn(async move {
                let (answer, _guard) = run_thunk(&node, thunk).await;
                if let Answer::Exception(e) = answer {
                    error!("Fire-and-forget thunk failed: {}", e);
                }
            });
        }
        SystemMessage::Result(answer) => {
            let node = node.clone();
            let response_oid = header.response_oid();
            rt::spawn(async move {
                bind_answer(&node, response_oid, answer).await;
            });
        }
        SystemMessage::IdentifySocket { from } => {
            identify_socket(node, params, from, peer_version.take()).await?;
        }
        SystemMessage::IdentifySocketAck { version } => {
            let wid = node
                .conn_worker(params.conn)
                .ok_or_else(|| Error::simple(ErrorKind::Dispatch))?;
            if let Some(worker) = node.workers().get(wid) {
                worker.set_version(version);
                worker.set_state(WorkerState::Connected);
                worker.initialized().set();
            }
        }
        SystemMessage::JoinPgrp(join) => {
            topology::handle_join(node, params.conn, header, join, peer_version.take()).await?;
        }
        SystemMessage::JoinComplete { cpu_threads, ospid } => {
            join_complete(node, params, header, cpu_threads, ospid).await?;
        }
    }
    Ok(())
}

/// Evaluates one thunk to the answer that fills a slot or crosses the
/// wire, plus the guard of a synchronized take, when one is involved.
pub(crate) async fn run_thunk<D: ClusterData>(
    node: &Node<D>,
    thunk: Thunk<D::Operation, D::Value>,
) -> (Answer<D::Value>, Option<SemaphoreGuard>) {
    match thunk {
        Thunk::Apply(op) => {
            let pending = node.executor().submit(op);
            (outcome_to_answer::<D>(node.id(), pending.await), None)
        }
        Thunk::FetchRef(rid) => (
            node.registry().fetch(rid, WorkerId::from(0u32)).await,
            None,
        ),
        Thunk::TakeRef(rid) => {
            // an unbuffered slot must not be raced by another taker
            // while its value is in flight; hold its lock until the
            // result frame is on the wire
            let guard = match node.registry().sync_lock_of(rid) {
                Some(lock) => Some(lock.acquire().await),
                None => None,
            };
            (
                node.registry().take(rid, WorkerId::from(0u32)).await,
                guard,
            )
        }
        Thunk::PutRef(rid, value) => match node.registry().put(rid, Answer::Value(value)).await {
            Ok(()) => (Answer::Done, None),
            Err(e) => (
                Answer::Exception(RemoteException::new(
                    node.id(),
                    CapturedError::new(e.kind(), e.to_string()),
                )),
                None,
            ),
        },
        Thunk::AddClient(rid, wid) => {
            node.registry().add_client(rid, wid);
            (Answer::Done, None)
        }
        Thunk::DelClients(pairs) => {
            node.registry().remove_clients(&pairs);
            (Answer::Done, None)
        }
        Thunk::Remove(wid) => {
            if node.is_controller() {
                if let Err(e) = supervisor::rmprocs(node, &[wid]).await {
                    warn!("Requested removal of worker {} failed: {}", wid, e);
                }
            } else {
                warn!("Ignoring a removal request; not the controller");
            }
            (Answer::Done, None)
        }
        Thunk::Exit => {
            info!("Orderly shutdown requested");
            if node.standalone() {
                std::process::exit(0);
            }
            node.shutdown().await;
            (Answer::Done, None)
        }
    }
}

/// Converts an executor outcome to the answer stored in a slot.
pub(crate) fn outcome_to_answer<D: ClusterData>(
    myid: WorkerId,
    outcome: std::result::Result<Outcome<D::Value>, oneshot::RecvError>,
) -> Answer<D::Value> {
    match outcome {
        Ok(Ok(value)) => Answer::Value(value),
        Ok(Err(captured)) => Answer::Exception(RemoteException::new(myid, captured)),
        Err(_) => Answer::Exception(RemoteException::new(
            myid,
            CapturedError::new(ErrorKind::Executable, "executor shut down mid-operation"),
        )),
    }
}

/// Stores an answer under a local reference, which may suspend on an
/// unbuffered slot; duplicate binds are dropped with a log line.
async fn bind_answer<D: ClusterData>(node: &Node<D>, rid: Rrid, answer: Answer<D::Value>) {
    if rid.is_null() {
        return;
    }
    if let Err(e) = node.registry().put(rid, answer).await {
        warn!("Dropping duplicate result for {:?}: {}", rid, e);
    }
}

/// Sends the outcome of a call back to its initiator, honoring the
/// verb's reply discipline: `call_fetch` (and any exception) carries
/// the raw answer, completion verbs reply with a bare `Done`.
pub(crate) async fn deliver_result<D: ClusterData>(
    node: &Node<D>,
    peer: WorkerId,
    verb: Verb,
    notify_oid: Rrid,
    (answer, guard): (Answer<D::Value>, Option<SemaphoreGuard>),
) {
    let to_send = if verb == Verb::CallFetch || answer.is_exception() {
        answer
    } else {
        Answer::Done
    };
    let msg = SystemMessage::Result(to_send);
    let res = node.send_to(peer, notify_oid, Rrid::NULL, &msg).await;
    // a synchronized take completes exactly here, value on the wire
    drop(guard);
    if let Err(e) = res {
        result_send_failure(node, peer, e).await;
    }
}

/// The policy for a result that could not be serialized or written:
/// the connection is beyond saving.
async fn result_send_failure<D: ClusterData>(node: &Node<D>, peer: WorkerId, err: Error) {
    error!("Failed to deliver a result to worker {}: {}", peer, err);
    if let Some(worker) = node.workers().get(peer) {
        worker.close_tx().await;
    }
    if node.is_controller() {
        if let Err(e) = supervisor::rmprocs(node, &[peer]).await {
            warn!("Failed to remove worker {}: {}", peer, e);
        }
    } else if peer.is_controller() {
        fatal(node, "failed to deliver a result to the controller").await;
    } else {
        // ask the controller to remove the peer on our behalf
        let msg = SystemMessage::RemoteDo(Thunk::Remove(peer));
        let _ = node
            .send_to(WorkerId::CONTROLLER, Rrid::NULL, Rrid::NULL, &msg)
            .await;
    }
}

/// Reifies a body-decode fault into a `RemoteException`, delivered to
/// whichever reference ids the poisoned frame carried.
async fn decode_failure<D: ClusterData>(
    node: &Node<D>,
    params: &ConnParams,
    header: &Header,
    err: Error,
) {
    let cause = CapturedError::new(ErrorKind::CommunicationSerialize, err.to_string());
    let exception = RemoteException::new(node.id(), cause);
    if !header.response_oid().is_null() {
        let node = node.clone();
        let rid = header.response_oid();
        let exc = exception.clone();
        rt::spawn(async move {
            bind_answer(&node, rid, Answer::Exception(exc)).await;
        });
    }
    if !header.notify_oid().is_null() {
        if let Some(peer) = node.conn_worker(params.conn) {
            let msg = SystemMessage::Result(Answer::Exception(exception));
            if let Err(e) = node
                .send_to(peer, header.notify_oid(), Rrid::NULL, &msg)
                .await
            {
                warn!("Failed to report a decode fault to worker {}: {}", peer, e);
            }
        }
    }
}

/// Creates the worker record for a peer that just introduced itself
/// on an accepted stream, and acknowledges the introduction.
async fn identify_socket<D: ClusterData>(
    node: &Node<D>,
    params: &ConnParams,
    from: WorkerId,
    peer_version: Option<String>,
) -> Result<()> {
    if u32::from(from) == 0 {
        return Err("Peer identified itself with an invalid id").wrapped(ErrorKind::Dispatch);
    }
    let tx = node
        .take_pending_tx(params.conn)
        .ok_or_else(|| Error::simple(ErrorKind::Dispatch))?;
    let worker = match node.workers().get(from) {
        // e.g. a lazy placeholder the peer happened to connect first
        Some(w) => w,
        None => {
            let w = Worker::new(from, WorkerConfig::default(), WorkerState::Connecting);
            node.workers().register(w.clone())?;
            w
        }
    };
    worker.attach_tx(tx).await;
    if let Some(version) = peer_version {
        worker.set_version(version);
    }
    node.bind_conn(params.conn, from);
    let ack = SystemMessage::IdentifySocketAck {
        version: env!("CARGO_PKG_VERSION").to_owned(),
    };
    node.raw_send(&worker, Rrid::NULL, Rrid::NULL, &ack).await?;
    worker.set_state(WorkerState::Connected);
    worker.initialized().set();
    debug!("Worker {} identified itself", from);
    Ok(())
}

/// Controller-side bookkeeping when a fresh worker reports its join
/// as complete.
async fn join_complete<D: ClusterData>(
    node: &Node<D>,
    params: &ConnParams,
    header: &Header,
    cpu_threads: u32,
    ospid: u32,
) -> Result<()> {
    let wid = node
        .conn_worker(params.conn)
        .ok_or_else(|| Error::simple(ErrorKind::Dispatch))?;
    if let Some(worker) = node.workers().get(wid) {
        worker.set_join_info(JoinInfo { cpu_threads, ospid });
        worker.set_state(WorkerState::Connected);
        worker.initialized().set();
    }
    node.pool_add(wid);
    node.emit_event(ClusterEvent::WorkerJoined(wid));
    info!("Worker {} joined the cluster", wid);
    if !header.notify_oid().is_null() {
        node.registry()
            .put(header.notify_oid(), Answer::Joined(wid))
            .await?;
    }
    Ok(())
}

/// The failure protocol of a dead or misbehaving connection.
async fn failed<D: ClusterData>(node: &Node<D>, params: &ConnParams, err: Error) {
    let bound = node.conn_worker(params.conn);
    node.unbind_conn(params.conn);
    let wid = match bound {
        Some(wid) => wid,
        None => {
            // never identified; close silently
            debug!("Closing an unidentified connection: {}", err);
            return;
        }
    };
    let worker = match node.workers().get(wid) {
        Some(w) => w,
        // already deregistered by an earlier failure or removal
        None => return,
    };
    // a peer already marked terminating (or terminated by our own
    // shutdown) is going away on purpose; no escalation for those
    let was_terminating = matches!(
        worker.state(),
        WorkerState::Terminating | WorkerState::Terminated
    );
    worker.set_state(WorkerState::Terminated);
    worker.close_tx().await;
    worker.initialized().set();

    if wid.is_controller() && !node.is_controller() {
        if was_terminating {
            info!("Controller link closed during shutdown");
            if node.standalone() {
                std::process::exit(0);
            }
            node.shutdown().await;
        } else {
            error!("Lost the connection to the controller: {}", err);
            fatal(node, "controller connection died").await;
        }
        return;
    }

    warn!("Connection to worker {} died: {}", wid, err);
    supervisor::deregister_worker(node, wid).await;
    if node.is_controller() && !was_terminating {
        // surface the failure to whoever supervises this cluster
        node.emit_event(ClusterEvent::WorkerFailed(wid, err.to_string()));
    }
}

/// Fatal error escalation: standalone processes exit with status 1,
/// in-process nodes merely shut their tasks down.
async fn fatal<D: ClusterData>(node: &Node<D>, reason: &str) {
    error!("Fatal cluster error: {}", reason);
    if node.standalone() {
        std::process::exit(1);
    }
    node.shutdown().await;
}
