//! Cluster connectivity: the join protocol, and the connection
//! patterns established between workers.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use std::sync::Arc;
use std::thread;

use log::{info, warn};

use crate::cluster::async_runtime as rt;
use crate::cluster::communication::message::{Header, JoinGroup, Rrid, SystemMessage};
use crate::cluster::communication::serialize::ClusterData;
use crate::cluster::communication::{Node, WorkerId};
use crate::cluster::error::*;
use crate::cluster::launch::WorkerConfig;
use crate::cluster::worker::{Worker, WorkerState};

/// The connectivity pattern of a cluster.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum Topology {
    /// Every pair of workers is connected, possibly lazily.
    AllToAll,
    /// Workers only ever talk to the controller.
    MasterWorker,
    /// Worker connectivity is left to the application.
    Custom,
}

/// Handles the controller's `JoinPgrp` message on a fresh worker:
/// adopt the assigned id, record the controller as worker 1, connect
/// to (or note down) the other members, and report back.
pub(crate) async fn handle_join<D: ClusterData>(
    node: &Node<D>,
    conn: u64,
    header: &Header,
    join: JoinGroup,
    peer_version: Option<String>,
) -> Result<()> {
    // adopt the id the controller assigned us
    node.set_id(join.self_pid);
    info!("Joining the cluster as worker {}", join.self_pid);

    let tx = node
        .take_pending_tx(conn)
        .ok_or_else(|| Error::simple(ErrorKind::Topology))?;
    let controller = Worker::new(
        WorkerId::CONTROLLER,
        WorkerConfig::default(),
        WorkerState::Connected,
    );
    node.workers().register(controller.clone())?;
    controller.attach_tx(tx).await;
    if let Some(version) = peer_version {
        controller.set_version(version);
    }
    node.bind_conn(conn, WorkerId::CONTROLLER);
    controller.initialized().set();

    node.set_topology(join.topology, join.lazy);
    node.set_threaded_blas(join.enable_threaded_blas);

    for (rpid, addr) in join.other_workers {
        let cfg = WorkerConfig {
            addr: Some(addr),
            ..Default::default()
        };
        if join.lazy {
            // placeholder carrying the deferred connect address; the
            // first send to this peer performs the actual connect
            let placeholder = Worker::new(rpid, cfg, WorkerState::Created);
            if node.workers().register(placeholder).is_err() {
                warn!("Worker {} is already known; skipping placeholder", rpid);
            }
        } else {
            // install the record before the connector runs, so calls
            // racing the join park on the handshake instead of
            // reporting an unknown peer
            let peer = Worker::new(rpid, cfg.clone(), WorkerState::Connecting);
            if node.workers().register(peer).is_err() {
                warn!("Worker {} is already known; skipping connect", rpid);
                continue;
            }
            let node = node.clone();
            rt::spawn(async move {
                if let Err(e) = connect_peer(&node, rpid, &cfg).await {
                    warn!("Failed to reach worker {}: {}", rpid, e);
                }
            });
        }
    }

    let done = SystemMessage::JoinComplete {
        cpu_threads: cpu_threads(),
        ospid: std::process::id(),
    };
    node.raw_send(&controller, Rrid::NULL, header.notify_oid(), &done)
        .await
}

/// Establishes a worker-to-worker connection: open the stream, write
/// the handshake, introduce ourselves, and wait for the peer's ack.
///
/// A peer that cannot be reached is marked `Unknown`, releasing every
/// task parked on its handshake.
pub(crate) async fn connect_peer<D: ClusterData>(
    node: &Node<D>,
    pid: WorkerId,
    cfg: &WorkerConfig,
) -> Result<Arc<Worker>> {
    let res = async {
        let worker = node.connect_worker(pid, cfg).await?;
        let identify = SystemMessage::IdentifySocket { from: node.id() };
        node.raw_send(&worker, Rrid::NULL, Rrid::NULL, &identify)
            .await?;
        worker.initialized().wait().await;
        Ok(worker)
    }
    .await;
    if res.is_err() {
        if let Some(worker) = node.workers().get(pid) {
            worker.set_state(WorkerState::Unknown);
            worker.initialized().set();
        }
    }
    res
}

/// Performs the deferred connect of a lazy placeholder. The caller
/// has already won the `Created -> Connecting` election.
pub(crate) async fn connect_lazy<D: ClusterData>(node: &Node<D>, worker: &Arc<Worker>) -> Result<()> {
    let cfg = worker.config().clone();
    info!("Establishing a deferred connection to worker {}", worker.id());
    connect_peer(node, worker.id(), &cfg).await.map(|_| ())
}

fn cpu_threads() -> u32 {
    thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}
