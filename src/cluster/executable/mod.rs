//! Call-engine business logic: user services, and the executor that
//! evaluates their operations.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::cluster::communication::message::CapturedError;
use crate::cluster::communication::serialize::ClusterData;
use crate::cluster::error::*;
use crate::cluster::threadpool::ThreadPool;

/// Operation type of the `Service`.
pub type Operation<S> = <<S as Service>::Data as ClusterData>::Operation;

/// Value type of the `Service`.
pub type Value<S> = <<S as Service>::Data as ClusterData>::Value;

/// A user defined `Service`.
///
/// Application logic is implemented by this trait: every `Apply` thunk
/// arriving at a worker is evaluated by its service.
pub trait Service: Send + Sync + 'static {
    /// The data types exchanged by the cluster, along with their
    /// serialization routines.
    type Data: ClusterData;

    /// Evaluates one operation, producing a value.
    ///
    /// Implementations may be called from many pool threads at once.
    fn execute(&self, op: Operation<Self>) -> Result<Value<Self>>;
}

/// The outcome of one evaluation, as delivered to the dispatcher.
pub type Outcome<V> = std::result::Result<V, CapturedError>;

/// Evaluates service operations on a dedicated thread pool, keeping
/// them off the async runtime's reactor threads.
pub struct Executor<D: ClusterData> {
    run: Arc<dyn Fn(D::Operation) -> Result<D::Value> + Send + Sync>,
    pool: ThreadPool,
}

impl<D: ClusterData> Clone for Executor<D> {
    fn clone(&self) -> Self {
        Executor {
            run: self.run.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<D: ClusterData> Executor<D> {
    /// Wraps a service and a thread pool into an `Executor`.
    pub fn new<S>(service: S, pool: ThreadPool) -> Self
    where
        S: Service<Data = D>,
    {
        let service = Arc::new(service);
        Executor {
            run: Arc::new(move |op| service.execute(op)),
            pool,
        }
    }

    /// Submits one operation for evaluation, returning the channel the
    /// outcome arrives on.
    ///
    /// Failures never propagate past this boundary: both `Err` returns
    /// and panics inside the service are reified into a
    /// `CapturedError`, ready to cross the wire.
    pub fn submit(&self, op: D::Operation) -> oneshot::Receiver<Outcome<D::Value>> {
        let (tx, rx) = oneshot::channel();
        let run = self.run.clone();
        self.pool.execute(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| run(op))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CapturedError::new(e.kind(), e.to_string())
                    .with_backtrace(Backtrace::force_capture().to_string())),
                Err(payload) => Err(captured_panic(payload)),
            };
            let _ = tx.send(outcome);
        });
        rx
    }
}

fn captured_panic(payload: Box<dyn Any + Send>) -> CapturedError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    };
    CapturedError::new(ErrorKind::Executable, message)
        .with_backtrace(Backtrace::force_capture().to_string())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;
    use crate::cluster::communication::message::SystemMessage;
    use crate::cluster::threadpool;

    #[cfg_attr(feature = "serialize_serde", derive(serde::Serialize, serde::Deserialize))]
    enum MathOp {
        Add(i64, i64),
        Fail,
        Panic,
    }

    struct MathData;

    impl ClusterData for MathData {
        type Operation = MathOp;
        type Value = i64;

        fn serialize_message<W: Write>(
            w: W,
            m: &SystemMessage<MathOp, i64>,
        ) -> Result<()> {
            bincode::serialize_into(w, m).wrapped(ErrorKind::CommunicationSerialize)
        }

        fn deserialize_message<R: Read>(r: R) -> Result<SystemMessage<MathOp, i64>> {
            bincode::deserialize_from(r).wrapped(ErrorKind::CommunicationSerialize)
        }
    }

    struct MathService;

    impl Service for MathService {
        type Data = MathData;

        fn execute(&self, op: MathOp) -> Result<i64> {
            match op {
                MathOp::Add(a, b) => Ok(a + b),
                MathOp::Fail => Err("arithmetic fell over").wrapped(ErrorKind::Executable),
                MathOp::Panic => panic!("boom"),
            }
        }
    }

    fn executor() -> Executor<MathData> {
        let pool = threadpool::Builder::new().num_threads(1).build();
        Executor::new(MathService, pool)
    }

    #[test]
    fn test_successful_evaluation() {
        let exec = executor();
        let rx = exec.submit(MathOp::Add(40, 2));
        assert_eq!(rx.recv().expect("Executor vanished").expect("Op failed"), 42);
    }

    #[test]
    fn test_error_is_captured() {
        let exec = executor();
        let rx = exec.submit(MathOp::Fail);
        let captured = rx.recv().expect("Executor vanished").unwrap_err();
        assert!(captured.message().contains("arithmetic fell over"));
    }

    #[test]
    fn test_panic_is_captured() {
        let exec = executor();
        let rx = exec.submit(MathOp::Panic);
        let captured = rx.recv().expect("Executor vanished").unwrap_err();
        assert_eq!(captured.kind(), ErrorKind::Executable);
        assert!(captured.message().contains("boom"));
    }
}
