//! A thread pool abstraction, used by the call engine to run user
//! operations away from the async runtime's reactor threads.

#[cfg(feature = "threadpool_crossbeam")]
mod imp {
    pub use ::threadpool_crossbeam_channel::Builder;
    pub use ::threadpool_crossbeam_channel::ThreadPool;
}

/// A thread pool, dedicated to running CPU intensive work.
#[derive(Clone)]
pub struct ThreadPool {
    inner: imp::ThreadPool,
}

impl ThreadPool {
    /// Runs the given job on one of the pool's threads.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.execute(job);
    }

    /// Blocks until every job queued so far has finished.
    pub fn join(&self) {
        self.inner.join();
    }
}

/// Helps build a `ThreadPool`.
#[derive(Default)]
pub struct Builder {
    num_threads: Option<usize>,
}

impl Builder {
    /// Returns a new `Builder`, with default parameters.
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Configures the number of threads used by the pool.
    ///
    /// When left unset, the pool sizes itself after the number of
    /// available CPUs.
    pub fn num_threads(mut self, num_threads: usize) -> Builder {
        self.num_threads = Some(num_threads);
        self
    }

    /// Builds the new `ThreadPool`.
    pub fn build(self) -> ThreadPool {
        let mut builder = imp::Builder::new().thread_name("coven-exec".into());
        if let Some(n) = self.num_threads {
            builder = builder.num_threads(n);
        }
        ThreadPool {
            inner: builder.build(),
        }
    }
}
