//! Abstractions over different async runtimes in the Rust ecosystem.
//!
//! The chosen runtime is installed globally during the init of the
//! library; tasks spawned by the communication and supervision layers all
//! land on the same executor.

#[cfg(feature = "async_runtime_tokio")]
mod tokio;

#[cfg(feature = "async_runtime_async_std")]
mod async_std;

use std::future::Future;

#[cfg(feature = "async_runtime_tokio")]
use self::tokio as imp;

#[cfg(feature = "async_runtime_async_std")]
use self::async_std as imp;

use crate::cluster::error::*;
use crate::cluster::globals::Global;

static RUNTIME: Global<imp::Runtime> = Global::new();

/// A handle to a task spawned into the async runtime.
pub type JoinHandle<T> = imp::JoinHandle<T>;

/// This function initializes the async runtime.
///
/// It should be called once before the rest of this crate is used.
///
/// # Safety
/// Must not race with `drop` or any task spawn.
pub unsafe fn init(num_threads: usize) -> Result<()> {
    let rt = imp::init(num_threads).simple_msg(ErrorKind::AsyncRuntime, "Failed to build runtime")?;
    RUNTIME.set(rt);
    Ok(())
}

/// This function drops the async runtime.
///
/// # Safety
/// Must not race with `init` or any task spawn.
pub unsafe fn drop() -> Result<()> {
    RUNTIME.unset();
    Ok(())
}

/// Spawns a new task `F` into the async runtime's thread pool.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match RUNTIME.get() {
        Some(rt) => rt.spawn(future),
        None => panic!("Async runtime wasn't initialized"),
    }
}

/// Blocks on a task `F` until it completes.
pub fn block_on<F: Future>(future: F) -> F::Output {
    match RUNTIME.get() {
        Some(rt) => rt.block_on(future),
        None => panic!("Async runtime wasn't initialized"),
    }
}
