use std::future::Future;

pub type JoinHandle<T> = ::async_std::task::JoinHandle<T>;

// async-std ships a global executor, so there is nothing to build
pub struct Runtime;

pub fn init(_num_threads: usize) -> Result<Runtime, ()> {
    Ok(Runtime)
}

impl Runtime {
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        ::async_std::task::spawn(future)
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        ::async_std::task::block_on(future)
    }
}
