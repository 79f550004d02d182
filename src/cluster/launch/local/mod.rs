//! An in-process cluster manager.
//!
//! Every "worker process" is a fresh `Node` living in the current
//! address space, wired to its peers with in-memory duplex streams.
//! This is the manager behind unit tests and demos, and the reason a
//! single test binary can stand up several independent clusters at
//! once. It also keeps a log of every connection it brokered, which
//! topology tests assert on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::cluster::collections::{self, HashMap};
use crate::cluster::communication::framing::Cookie;
use crate::cluster::communication::serialize::ClusterData;
use crate::cluster::communication::socket::mem;
use crate::cluster::communication::{Duplex, Node, NodeConfig, WorkerId};
use crate::cluster::error::*;
use crate::cluster::executable::Executor;
use crate::cluster::launch::{ClusterManager, LaunchParams, ManageOp, WorkerConfig};

type ExecutorFactory<D> = Box<dyn Fn() -> Executor<D> + Send + Sync>;

/// A manager running every worker inside the current process.
pub struct LocalManager<D: ClusterData> {
    shared: Arc<LocalShared<D>>,
}

impl<D: ClusterData> Clone for LocalManager<D> {
    fn clone(&self) -> Self {
        LocalManager {
            shared: self.shared.clone(),
        }
    }
}

struct LocalShared<D: ClusterData> {
    cookie: Cookie,
    factory: ExecutorFactory<D>,
    token_counter: AtomicU64,
    // connect token -> in-process worker node
    nodes: Mutex<HashMap<String, Node<D>>>,
    // worker id -> connect token, bound by the `Register` hook
    pids: Mutex<HashMap<u32, String>>,
    // every connection brokered so far, by target id
    connects: Mutex<Vec<WorkerId>>,
}

impl<D: ClusterData> LocalManager<D> {
    /// Creates a manager whose workers run the executors produced by
    /// `factory`.
    pub fn new<F>(cookie: Cookie, factory: F) -> Self
    where
        F: Fn() -> Executor<D> + Send + Sync + 'static,
    {
        LocalManager {
            shared: Arc::new(LocalShared {
                cookie,
                factory: Box::new(factory),
                token_counter: AtomicU64::new(0),
                nodes: Mutex::new(collections::hash_map()),
                pids: Mutex::new(collections::hash_map()),
                connects: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the in-process node of a joined worker.
    pub fn worker_node(&self, pid: WorkerId) -> Option<Node<D>> {
        let token = self.shared.pids.lock().get(&u32::from(pid)).cloned()?;
        self.shared.nodes.lock().get(&token).cloned()
    }

    /// Returns how many connections have been opened to `pid` so far.
    pub fn connect_count(&self, pid: WorkerId) -> usize {
        self.shared
            .connects
            .lock()
            .iter()
            .filter(|wid| **wid == pid)
            .count()
    }
}

impl<D: ClusterData> ClusterManager for LocalManager<D> {
    fn launch<'a>(
        &'a self,
        params: &'a LaunchParams,
        out: &'a mut Vec<WorkerConfig>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for _ in 0..params.count {
                let token = format!(
                    "mem:{}",
                    self.shared.token_counter.fetch_add(1, Ordering::AcqRel)
                );
                let cfg = NodeConfig::worker(self.shared.cookie).in_process();
                let node = Node::new(cfg, Box::new(self.clone()), (self.shared.factory)());
                self.shared.nodes.lock().insert(token.clone(), node);
                out.push(WorkerConfig {
                    addr: Some(token),
                    env: params.env.clone(),
                    exeflags: params.exeflags.clone(),
                });
            }
            Ok(())
        })
    }

    fn connect<'a>(
        &'a self,
        pid: WorkerId,
        cfg: &'a WorkerConfig,
    ) -> BoxFuture<'a, Result<Duplex>> {
        Box::pin(async move {
            let token = cfg
                .addr
                .as_ref()
                .ok_or_else(|| Error::simple(ErrorKind::LaunchLocal))?;
            let target = self
                .shared
                .nodes
                .lock()
                .get(token)
                .cloned()
                .ok_or_else(|| Error::simple(ErrorKind::LaunchLocal))?;
            self.shared.connects.lock().push(pid);
            let (ours, theirs) = mem::duplex();
            target.accept(Box::new(theirs));
            Ok(Box::new(ours) as Duplex)
        })
    }

    fn manage(&self, pid: WorkerId, cfg: &WorkerConfig, op: ManageOp) {
        match op {
            ManageOp::Register => {
                if let Some(token) = &cfg.addr {
                    self.shared.pids.lock().insert(pid.into(), token.clone());
                }
            }
            ManageOp::Deregister => {
                self.shared.pids.lock().remove(&u32::from(pid));
            }
            ManageOp::Interrupt | ManageOp::Finalize => (),
        }
    }

    fn kill<'a>(&'a self, pid: WorkerId, cfg: &'a WorkerConfig) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let node = match &cfg.addr {
                Some(token) => self.shared.nodes.lock().remove(token),
                None => None,
            };
            if let Some(node) = node {
                node.shutdown().await;
            }
            self.shared.pids.lock().remove(&u32::from(pid));
            Ok(())
        })
    }
}
