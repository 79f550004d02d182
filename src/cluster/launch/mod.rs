//! Launching new workers into a cluster.
//!
//! The actual process-launch mechanism stays behind the
//! `ClusterManager` trait: the core only ever asks a manager for duplex
//! streams and lifecycle hooks, never for command lines or sockets.

pub mod local;

#[cfg(any(feature = "socket_tokio_tcp", feature = "socket_async_std_tcp"))]
pub mod tcp;

use std::env;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::cluster::collections::{self, HashMap};
use crate::cluster::communication::{Duplex, WorkerId};
use crate::cluster::error::*;
use crate::cluster::topology::Topology;

/// Name of the environment variable bounding, in seconds, how long the
/// controller waits for a freshly launched worker to join.
pub const WORKER_TIMEOUT_ENV: &str = "COVEN_WORKER_TIMEOUT";

/// The default join timeout, when the environment does not override it.
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle notifications delivered to a `ClusterManager`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ManageOp {
    /// The worker joined the cluster.
    Register,
    /// The worker left the cluster.
    Deregister,
    /// The user requested the worker be interrupted.
    Interrupt,
    /// The cluster is shutting down.
    Finalize,
}

/// Per-worker launch output: everything a peer needs to reach the
/// worker later on.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Manager-interpreted connect address.
    pub addr: Option<String>,
    /// Extra environment entries for the worker process.
    pub env: HashMap<String, String>,
    /// Extra flags passed to the worker executable.
    pub exeflags: Vec<String>,
}

/// Parameters for one batch of worker launches.
#[derive(Debug, Clone)]
pub struct LaunchParams {
    /// How many workers to launch.
    pub count: usize,
    /// The connectivity pattern to establish between workers.
    pub topology: Topology,
    /// Defer worker-to-worker connections to first use.
    pub lazy: bool,
    /// Advisory knob for math kernels on the workers.
    pub enable_threaded_blas: bool,
    /// Upper bound on concurrent connection setups.
    pub max_parallel: usize,
    /// How long to wait for a launched worker to join.
    pub worker_timeout: Duration,
    /// Extra environment entries for every worker process.
    pub env: HashMap<String, String>,
    /// Extra flags passed to every worker executable.
    pub exeflags: Vec<String>,
}

impl LaunchParams {
    /// Returns the launch parameters for `count` workers, with every
    /// other knob at its default.
    pub fn workers(count: usize) -> Self {
        LaunchParams {
            count,
            topology: Topology::AllToAll,
            lazy: false,
            enable_threaded_blas: false,
            max_parallel: 10,
            worker_timeout: worker_timeout_from_env(),
            env: collections::hash_map(),
            exeflags: Vec::new(),
        }
    }

    /// Selects the connectivity pattern.
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Defers worker-to-worker connections to first use.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }
}

impl Default for LaunchParams {
    fn default() -> Self {
        LaunchParams::workers(1)
    }
}

fn worker_timeout_from_env() -> Duration {
    env::var(WORKER_TIMEOUT_ENV)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_WORKER_TIMEOUT)
}

/// The launch mechanism bootstrapping worker processes.
///
/// Implementations own everything the core treats as opaque: command
/// construction, address bookkeeping, and the transport behind the
/// duplex streams they hand out.
pub trait ClusterManager: Send + Sync + 'static {
    /// Launches the workers requested by `params`, appending one
    /// `WorkerConfig` per spawned worker.
    fn launch<'a>(
        &'a self,
        params: &'a LaunchParams,
        out: &'a mut Vec<WorkerConfig>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Opens a duplex stream to the worker described by `cfg`.
    fn connect<'a>(&'a self, pid: WorkerId, cfg: &'a WorkerConfig)
        -> BoxFuture<'a, Result<Duplex>>;

    /// Lifecycle hook, called as workers come and go.
    fn manage(&self, pid: WorkerId, cfg: &WorkerConfig, op: ManageOp);

    /// Requests the orderly shutdown of a worker.
    fn kill<'a>(&'a self, pid: WorkerId, cfg: &'a WorkerConfig) -> BoxFuture<'a, Result<()>>;
}
