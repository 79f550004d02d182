//! A manager for workers that were started out of band and listen on
//! TCP addresses.
//!
//! Process launch stays with the operator (an init system, a job
//! scheduler, a shell loop); this manager only knows how to reach the
//! workers. Each worker process bootstraps itself with
//! `NodeConfig::worker`, calls `Node::listen` on its advertised
//! address, and waits to be adopted by the controller.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use futures_timer::Delay;
use parking_lot::Mutex;

use crate::cluster::communication::{socket, Duplex, WorkerId};
use crate::cluster::error::*;
use crate::cluster::launch::{ClusterManager, LaunchParams, ManageOp, WorkerConfig};

/// A manager connecting to pre-started workers over TCP.
pub struct TcpManager {
    addrs: Mutex<VecDeque<SocketAddr>>,
}

impl TcpManager {
    // freshly started workers may not be listening yet
    const CONNECT_RETRIES: usize = 10;

    /// Creates a manager drawing worker addresses from `addrs`.
    pub fn new<I>(addrs: I) -> Self
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        TcpManager {
            addrs: Mutex::new(addrs.into_iter().collect()),
        }
    }
}

impl ClusterManager for TcpManager {
    fn launch<'a>(
        &'a self,
        params: &'a LaunchParams,
        out: &'a mut Vec<WorkerConfig>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut addrs = self.addrs.lock();
            if addrs.len() < params.count {
                return Err("Not enough worker addresses configured")
                    .wrapped(ErrorKind::LaunchTcp);
            }
            for _ in 0..params.count {
                let addr = addrs.pop_front().expect("Length was checked above");
                out.push(WorkerConfig {
                    addr: Some(addr.to_string()),
                    env: params.env.clone(),
                    exeflags: params.exeflags.clone(),
                });
            }
            Ok(())
        })
    }

    fn connect<'a>(
        &'a self,
        _pid: WorkerId,
        cfg: &'a WorkerConfig,
    ) -> BoxFuture<'a, Result<Duplex>> {
        Box::pin(async move {
            let addr: SocketAddr = cfg
                .addr
                .as_ref()
                .ok_or_else(|| Error::simple(ErrorKind::LaunchTcp))?
                .parse()
                .wrapped(ErrorKind::LaunchTcp)?;
            for _ in 0..Self::CONNECT_RETRIES {
                if let Ok(sock) = socket::connect(addr).await {
                    return Ok(Box::new(sock) as Duplex);
                }
                // sleep for 1 second and retry
                Delay::new(Duration::from_secs(1)).await;
            }
            Err("Worker never came up at its advertised address").wrapped(ErrorKind::LaunchTcp)
        })
    }

    fn manage(&self, _pid: WorkerId, _cfg: &WorkerConfig, _op: ManageOp) {}

    fn kill<'a>(&'a self, _pid: WorkerId, _cfg: &'a WorkerConfig) -> BoxFuture<'a, Result<()>> {
        // the exit request sent by `rmprocs` is all the shutdown a
        // remote TCP worker gets from here
        Box::pin(async { Ok(()) })
    }
}
