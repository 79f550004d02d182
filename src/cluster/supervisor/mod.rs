//! Cluster supervision: launching workers into the group, removing
//! them in an orderly fashion, and cleaning up after the ones that
//! die on their own.

use futures::future::{self, Either};
use futures::pin_mut;
use futures_timer::Delay;
use log::{debug, error, info, warn};

use crate::cluster::communication::channel::Semaphore;
use crate::cluster::communication::message::{Answer, JoinGroup, Rrid, SystemMessage, Thunk};
use crate::cluster::communication::serialize::ClusterData;
use crate::cluster::communication::{Node, WorkerId, TAG_JOIN};
use crate::cluster::error::*;
use crate::cluster::launch::{LaunchParams, ManageOp, WorkerConfig};
use crate::cluster::topology::Topology;
use crate::cluster::worker::WorkerState;

/// Observability events published by a node as its cluster changes.
///
/// Events are best effort: a node never suspends to publish one, and
/// an unconsumed stream simply drops them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ClusterEvent {
    /// A worker completed the join protocol.
    WorkerJoined(WorkerId),
    /// A worker's connection died outside of an orderly removal.
    WorkerFailed(WorkerId, String),
    /// A worker was deregistered from the cluster.
    WorkerRemoved(WorkerId),
}

/// Launches a batch of workers and waits until every one of them has
/// joined the cluster, returning their ids.
///
/// Only the controller may add workers. Joins are serialized so each
/// fresh worker observes a consistent membership list, while stream
/// setups proceed in parallel, bounded by `params.max_parallel`.
pub async fn add_workers<D: ClusterData>(
    node: &Node<D>,
    params: LaunchParams,
) -> Result<Vec<WorkerId>> {
    if !node.is_controller() {
        return Err("Only the controller may add workers").wrapped(ErrorKind::Supervisor);
    }
    node.set_topology(params.topology, params.lazy);
    let mut cfgs = Vec::new();
    node.manager().launch(&params, &mut cfgs).await?;
    info!("Launching {} workers", cfgs.len());

    let sem = Semaphore::new(params.max_parallel.max(1));
    let joins = cfgs.iter().map(|cfg| create_worker(node, &params, cfg, &sem));
    let results = future::join_all(joins).await;

    let mut ids = Vec::with_capacity(results.len());
    for res in results {
        ids.push(res?);
    }
    Ok(ids)
}

/// Brings one launched worker into the group: connect, handshake,
/// `JoinPgrp`, and wait for the matching `JoinComplete` within the
/// configured launch timeout.
async fn create_worker<D: ClusterData>(
    node: &Node<D>,
    params: &LaunchParams,
    cfg: &WorkerConfig,
    sem: &Semaphore,
) -> Result<WorkerId> {
    let _permit = sem.acquire().await;
    let pid = node.next_worker_id();
    let worker = node.connect_worker(pid, cfg).await?;

    // joins are serialized from here on
    let _join = node.join_lock().lock().await;

    let oid = Rrid::new(node.id(), node.next_ref_id(), TAG_JOIN);
    node.registry().lookup_or_register(oid, pid);

    let mut others = Vec::new();
    if params.topology == Topology::AllToAll {
        for wid in node.default_pool() {
            if wid == pid {
                continue;
            }
            if let Some(peer) = node.workers().get(wid) {
                if let Some(addr) = &peer.config().addr {
                    others.push((wid, addr.clone()));
                }
            }
        }
    }

    let join = SystemMessage::JoinPgrp(JoinGroup {
        self_pid: pid,
        other_workers: others,
        topology: params.topology,
        lazy: params.lazy,
        enable_threaded_blas: params.enable_threaded_blas,
    });
    if let Err(e) = node.send_system_msg(&worker, Rrid::NULL, oid, &join).await {
        node.registry().forget(oid);
        deregister_worker(node, pid).await;
        return Err(e);
    }

    let take = node.registry().take(oid, pid);
    pin_mut!(take);
    let timeout = Delay::new(params.worker_timeout);
    match future::select(take, timeout).await {
        Either::Left((Answer::Joined(wid), _)) => {
            node.manager().manage(wid, cfg, ManageOp::Register);
            Ok(wid)
        }
        Either::Left((Answer::Exception(e), _)) => Err(Error::remote(e)),
        Either::Left((_, _)) => Err("Unexpected join answer").wrapped(ErrorKind::Supervisor),
        Either::Right(((), _)) => {
            error!(
                "Worker {} did not join within {:?}; treating the launch as failed",
                pid, params.worker_timeout
            );
            node.registry().forget(oid);
            let _ = node.manager().kill(pid, cfg).await;
            deregister_worker(node, pid).await;
            Err("Launched worker timed out before joining").wrapped(ErrorKind::Supervisor)
        }
    }
}

/// Orderly removal of workers from the cluster: mark them
/// terminating, ask them to exit, invoke the launcher's kill hook,
/// and deregister them. Controller only.
pub async fn rmprocs<D: ClusterData>(node: &Node<D>, pids: &[WorkerId]) -> Result<()> {
    if !node.is_controller() {
        return Err("Only the controller may remove workers").wrapped(ErrorKind::Supervisor);
    }
    for &pid in pids {
        if pid.is_controller() {
            warn!("Refusing to remove the controller");
            continue;
        }
        let worker = match node.workers().get(pid) {
            Some(w) => w,
            None => continue,
        };
        worker.set_state(WorkerState::Terminating);
        let exit = SystemMessage::RemoteDo(Thunk::Exit);
        if let Err(e) = node.send_system_msg(&worker, Rrid::NULL, Rrid::NULL, &exit).await {
            debug!("Worker {} did not take the exit request: {}", pid, e);
        }
        let _ = node.manager().kill(pid, worker.config()).await;
        deregister_worker(node, pid).await;
        info!("Worker {} removed from the cluster", pid);
    }
    Ok(())
}

/// Purges a worker from the directory: terminal state, streams
/// closed, every value still waiting on it resolved to an exception,
/// lifecycle hook notified. Idempotent.
pub async fn deregister_worker<D: ClusterData>(node: &Node<D>, wid: WorkerId) {
    let worker = match node.workers().remove(wid) {
        Some(w) => w,
        None => return,
    };
    worker.set_state(WorkerState::Terminating);
    worker.set_state(WorkerState::Terminated);
    worker.close_tx().await;
    // unblock anyone still parked on the handshake
    worker.initialized().set();

    let failed = node.registry().fail_all_waiting_on(wid);
    if failed > 0 {
        warn!(
            "Resolved {} outstanding values to exceptions after losing worker {}",
            failed, wid
        );
    }
    node.pool_remove(wid);
    node.manager().manage(wid, worker.config(), ManageOp::Deregister);
    node.emit_event(ClusterEvent::WorkerRemoved(wid));
}
