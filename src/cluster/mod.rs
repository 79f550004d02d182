//! This module contains the implementation details of `coven`.
//!
//! Most of the library is directly usable; a few transport internals
//! are only exported with the feature flag `expose_impl` enabled.

pub mod async_runtime;
pub mod collections;
pub mod communication;
pub mod dispatch;
pub mod error;
pub mod executable;
pub mod globals;
pub mod launch;
pub mod registry;
pub mod supervisor;
pub mod threadpool;
pub mod topology;
pub mod worker;

use std::ops::Drop;

use error::*;
use globals::Flag;

static INITIALIZED: Flag = Flag::new();

/// Configure the init process of the library.
pub struct InitConfig {
    /// Number of threads used by the async runtime.
    pub async_threads: usize,
}

/// Handle to the global data.
///
/// When dropped, the data is deinitialized.
pub struct InitGuard;

/// Initializes global data.
///
/// Should always be called before other methods, otherwise runtime
/// panics may ensue.
///
/// # Safety
/// Must not race with any other use of the library.
pub unsafe fn init(c: InitConfig) -> Result<Option<InitGuard>> {
    if INITIALIZED.test() {
        return Ok(None);
    }
    async_runtime::init(c.async_threads)?;
    communication::socket::init()?;
    INITIALIZED.set();
    Ok(Some(InitGuard))
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        unsafe { drop().unwrap() }
    }
}

unsafe fn drop() -> Result<()> {
    INITIALIZED.unset();
    async_runtime::drop()?;
    communication::socket::drop()?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::{Read, Write};
    use std::thread;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::communication::framing::Cookie;
    use super::communication::message::SystemMessage;
    use super::communication::serialize::ClusterData;
    use super::communication::{Node, NodeConfig, WorkerId};
    use super::error::*;
    use super::executable::{Executor, Service};
    use super::launch::local::LocalManager;
    use super::launch::LaunchParams;
    use super::supervisor;
    use super::threadpool;
    use super::topology::Topology;
    use super::{init, InitConfig};

    #[derive(Clone, Serialize, Deserialize)]
    pub enum TestOp {
        Echo(i64),
        Add(i64, i64),
        Sum(i64, i64),
        Boom,
        Block,
    }

    pub struct TestData;

    impl ClusterData for TestData {
        type Operation = TestOp;
        type Value = i64;

        fn serialize_message<W: Write>(w: W, m: &SystemMessage<TestOp, i64>) -> Result<()> {
            bincode::serialize_into(w, m).wrapped(ErrorKind::CommunicationSerialize)
        }

        fn deserialize_message<R: Read>(r: R) -> Result<SystemMessage<TestOp, i64>> {
            bincode::deserialize_from(r).wrapped(ErrorKind::CommunicationSerialize)
        }
    }

    pub struct TestService;

    impl Service for TestService {
        type Data = TestData;

        fn execute(&self, op: TestOp) -> Result<i64> {
            match op {
                TestOp::Echo(v) => Ok(v),
                TestOp::Add(a, b) => Ok(a + b),
                TestOp::Sum(lo, hi) => Ok((lo..=hi).sum()),
                TestOp::Boom => Err("boom").wrapped(ErrorKind::Executable),
                TestOp::Block => {
                    thread::sleep(Duration::from_secs(3600));
                    Ok(0)
                }
            }
        }
    }

    /// Brings the global runtime up exactly once per test binary.
    pub fn runtime() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let conf = InitConfig { async_threads: 4 };
            if let Some(guard) = unsafe { init(conf) }.expect("Library init failed") {
                // tests share the runtime for the whole binary's lifetime
                std::mem::forget(guard);
            }
        });
    }

    pub fn executor() -> Executor<TestData> {
        let pool = threadpool::Builder::new().num_threads(2).build();
        Executor::new(TestService, pool)
    }

    /// Stands up an in-process cluster: a controller plus `workers`
    /// workers, joined one at a time for a deterministic id order.
    pub async fn local_cluster(
        workers: usize,
        topology: Topology,
        lazy: bool,
    ) -> (Node<TestData>, LocalManager<TestData>, Vec<WorkerId>) {
        let cookie = Cookie::random();
        let manager = LocalManager::new(cookie, executor);
        let node = Node::new(
            NodeConfig::controller(cookie).in_process(),
            Box::new(manager.clone()),
            executor(),
        );
        let mut ids = Vec::new();
        for _ in 0..workers {
            let params = LaunchParams::workers(1).topology(topology).lazy(lazy);
            let mut joined = supervisor::add_workers(&node, params)
                .await
                .expect("Worker launch failed");
            ids.append(&mut joined);
        }
        (node, manager, ids)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_timer::Delay;

    use super::async_runtime as rt;
    use super::communication::framing::{self, Cookie};
    use super::communication::message::{
        Answer, Header, Rrid, SystemMessage, Thunk, WireMessage,
    };
    use super::communication::serialize::ClusterData;
    use super::communication::socket::mem::{self, MemStream};
    use super::communication::{Future, Node, NodeConfig, WorkerId};
    use super::error::ErrorKind;
    use super::fixtures::*;
    use super::launch::local::LocalManager;
    use super::supervisor::{self, ClusterEvent};
    use super::topology::Topology;

    #[test]
    fn test_echo_roundtrip() {
        runtime();
        rt::block_on(async {
            let (node, _manager, ids) = local_cluster(1, Topology::AllToAll, false).await;
            let v = node
                .remotecall_fetch(ids[0], TestOp::Add(41, 1))
                .await
                .expect("Round trip failed");
            assert_eq!(v, 42);

            // identity law: fetching an echoed value returns it verbatim
            let v = node
                .remotecall_fetch(ids[0], TestOp::Echo(7))
                .await
                .expect("Echo failed");
            assert_eq!(v, 7);
        });
    }

    #[test]
    fn test_exception_surfaces_with_origin() {
        runtime();
        rt::block_on(async {
            let (node, _manager, ids) = local_cluster(1, Topology::AllToAll, false).await;
            let err = node
                .remotecall_fetch(ids[0], TestOp::Boom)
                .await
                .expect_err("A failing op must surface an error");
            let remote = err.remote_cause().expect("Expected a remote exception");
            assert_eq!(remote.pid(), ids[0]);
            assert!(remote.cause().message().contains("boom"));
        });
    }

    #[test]
    fn test_future_fetch_and_wait() {
        runtime();
        rt::block_on(async {
            let (node, _manager, ids) = local_cluster(1, Topology::AllToAll, false).await;

            let fut = node
                .remotecall(ids[0], TestOp::Add(1, 2))
                .await
                .expect("Submit failed");
            assert_eq!(node.fetch(&fut).await.expect("Fetch failed"), 3);
            // second fetch is served from the handle's cache
            assert_eq!(node.fetch(&fut).await.expect("Cached fetch failed"), 3);

            let fut = node
                .remotecall_wait(ids[0], TestOp::Echo(9))
                .await
                .expect("Wait failed");
            assert_eq!(node.take(&fut).await.expect("Take failed"), 9);
        });
    }

    #[test]
    fn test_take_reclaims_remote_entry() {
        runtime();
        rt::block_on(async {
            let (node, manager, ids) = local_cluster(1, Topology::AllToAll, false).await;
            let peer = manager.worker_node(ids[0]).expect("Worker node missing");

            let fut = node
                .remotecall(ids[0], TestOp::Echo(4))
                .await
                .expect("Submit failed");
            assert_eq!(node.take(&fut).await.expect("Take failed"), 4);
            assert!(peer.registry().is_empty());
        });
    }

    #[test]
    fn test_distributed_sum() {
        runtime();
        rt::block_on(async {
            let (node, _manager, ids) = local_cluster(2, Topology::AllToAll, false).await;
            // split 1..=100 across the pool and reduce with +
            let mut futs = Vec::new();
            let ranges = [(1, 50), (51, 100)];
            for (wid, (lo, hi)) in ids.iter().zip(ranges) {
                futs.push(
                    node.remotecall(*wid, TestOp::Sum(lo, hi))
                        .await
                        .expect("Submit failed"),
                );
            }
            let mut total = 0;
            for fut in &futs {
                total += node.fetch(fut).await.expect("Fetch failed");
            }
            assert_eq!(total, (1..=100).sum::<i64>());
        });
    }

    #[test]
    fn test_peer_death_resolves_outstanding_calls() {
        runtime();
        rt::block_on(async {
            let (node, manager, ids) = local_cluster(1, Topology::AllToAll, false).await;
            let wid = ids[0];
            let mut events = node.events().expect("Event stream already taken");

            // park a call on the worker, then crash it
            let pending = {
                let node = node.clone();
                let (tx, rx) = oneshot::channel();
                rt::spawn(async move {
                    let _ = tx.send(node.remotecall_fetch(wid, TestOp::Block).await);
                });
                rx
            };
            Delay::new(Duration::from_millis(100)).await;
            manager
                .worker_node(wid)
                .expect("Worker node missing")
                .shutdown()
                .await;

            // the controller observes the failure...
            loop {
                match events.recv().await.expect("Event stream died") {
                    ClusterEvent::WorkerRemoved(w) if w == wid => break,
                    _ => (),
                }
            }

            // ...the in-flight call resolves to an exception...
            let err = pending
                .await
                .expect("Caller task died")
                .expect_err("A dead peer must fail the call");
            assert_eq!(err.remote_cause().expect("Expected an exception").pid(), wid);

            // ...and later lookups fail fast instead of hanging
            let fut: Future<i64> = Future::new(wid, Rrid::new(wid, 99, 1));
            let err = node
                .fetch(&fut)
                .await
                .expect_err("Fetching from a dead peer must fail");
            assert_eq!(err.remote_cause().expect("Expected an exception").pid(), wid);
        });
    }

    #[test]
    fn test_master_worker_topology_isolates_workers() {
        runtime();
        rt::block_on(async {
            let (node, manager, ids) = local_cluster(3, Topology::MasterWorker, false).await;
            let (w2, w3) = (ids[0], ids[1]);

            // the controller reaches every worker
            let v = node
                .remotecall_fetch(w3, TestOp::Echo(1))
                .await
                .expect("Controller call failed");
            assert_eq!(v, 1);

            // workers have no route to one another
            let w2_node = manager.worker_node(w2).expect("Worker node missing");
            assert!(w2_node.remotecall_fetch(w3, TestOp::Echo(1)).await.is_err());
        });
    }

    #[test]
    fn test_lazy_mesh_connects_on_first_use() {
        runtime();
        rt::block_on(async {
            let (_node, manager, ids) = local_cluster(2, Topology::AllToAll, true).await;
            // the second worker joined last and carries a placeholder
            // for the first; nobody has connected them yet
            let (early, late) = (ids[0], ids[1]);
            assert_eq!(manager.connect_count(early), 1);

            let late_node = manager.worker_node(late).expect("Worker node missing");
            let v = late_node
                .remotecall_fetch(early, TestOp::Echo(5))
                .await
                .expect("Lazy call failed");
            assert_eq!(v, 5);
            assert_eq!(manager.connect_count(early), 2);

            // the connection is reused from here on
            let v = late_node
                .remotecall_fetch(early, TestOp::Add(2, 3))
                .await
                .expect("Second lazy call failed");
            assert_eq!(v, 5);
            assert_eq!(manager.connect_count(early), 2);
        });
    }

    #[test]
    fn test_eager_mesh_connects_workers() {
        runtime();
        rt::block_on(async {
            let (_node, manager, ids) = local_cluster(2, Topology::AllToAll, false).await;
            let (early, late) = (ids[0], ids[1]);
            let late_node = manager.worker_node(late).expect("Worker node missing");
            let v = late_node
                .remotecall_fetch(early, TestOp::Add(20, 1))
                .await
                .expect("Worker-to-worker call failed");
            assert_eq!(v, 21);
        });
    }

    #[test]
    fn test_synchronized_take_rendezvous() {
        runtime();
        rt::block_on(async {
            let (node, manager, ids) = local_cluster(1, Topology::AllToAll, false).await;
            let peer = manager.worker_node(ids[0]).expect("Worker node missing");

            // the worker owns an unbuffered reference
            let fut = peer.make_ref(false).expect("Mint failed");
            let handle: Future<i64> = Future::new(fut.home(), fut.rrid());

            let taken = {
                let node = node.clone();
                let (tx, rx) = oneshot::channel();
                rt::spawn(async move {
                    let _ = tx.send(node.take(&handle).await);
                });
                rx
            };
            Delay::new(Duration::from_millis(50)).await;

            // the put rendezvouses with the remote take
            peer.put(&fut, 5).await.expect("Rendezvous put failed");
            let v = taken
                .await
                .expect("Taker task died")
                .expect("Remote take failed");
            assert_eq!(v, 5);
        });
    }

    #[test]
    fn test_orderly_removal() {
        runtime();
        rt::block_on(async {
            let (node, _manager, ids) = local_cluster(2, Topology::AllToAll, false).await;
            supervisor::rmprocs(&node, &[ids[0]])
                .await
                .expect("Removal failed");
            assert_eq!(node.default_pool(), vec![ids[1]]);
            assert!(node
                .remotecall_fetch(ids[0], TestOp::Echo(1))
                .await
                .is_err());
            // the surviving worker is unaffected
            let v = node
                .remotecall_fetch(ids[1], TestOp::Echo(2))
                .await
                .expect("Survivor call failed");
            assert_eq!(v, 2);
        });
    }

    async fn send_frame(
        wire: &mut MemStream,
        from: WorkerId,
        response_oid: Rrid,
        notify_oid: Rrid,
        msg: &SystemMessage<TestOp, i64>,
    ) {
        let mut body = Vec::new();
        TestData::serialize_message(&mut body, msg).expect("Serialize failed");
        let wm = WireMessage::new(from, response_oid, notify_oid, &body);
        framing::write_frame(wire, wm.header(), wm.body())
            .await
            .expect("Frame write failed");
    }

    async fn recv_frame(wire: &mut MemStream) -> (Header, SystemMessage<TestOp, i64>) {
        let header = framing::read_header(wire).await.expect("Header read failed");
        let body = framing::read_body(wire, header.length())
            .await
            .expect("Body read failed");
        let msg = TestData::deserialize_message(&body[..]).expect("Deserialize failed");
        framing::read_boundary(wire).await.expect("Boundary read failed");
        (header, msg)
    }

    #[test]
    fn test_framing_recovery_after_poisoned_body() {
        runtime();
        rt::block_on(async {
            let cookie = Cookie::random();
            let manager: LocalManager<TestData> = LocalManager::new(cookie, executor);
            let node = Node::new(
                NodeConfig::controller(cookie).in_process(),
                Box::new(manager),
                executor(),
            );

            // we play worker 7 on a hand-driven wire
            let me = WorkerId::from(7u32);
            let (mut wire, theirs) = mem::duplex();
            node.accept(Box::new(theirs));
            framing::write_handshake(&mut wire, &cookie)
                .await
                .expect("Handshake failed");
            send_frame(
                &mut wire,
                me,
                Rrid::NULL,
                Rrid::NULL,
                &SystemMessage::IdentifySocket { from: me },
            )
            .await;
            match recv_frame(&mut wire).await {
                (_, SystemMessage::IdentifySocketAck { .. }) => (),
                _ => panic!("Expected an identify ack"),
            }

            // a healthy round trip
            let oid1 = Rrid::new(me, 1, 2);
            send_frame(
                &mut wire,
                me,
                Rrid::NULL,
                oid1,
                &SystemMessage::CallFetch(Thunk::Apply(TestOp::Echo(11))),
            )
            .await;
            match recv_frame(&mut wire).await {
                (header, SystemMessage::Result(Answer::Value(11))) => {
                    assert_eq!(header.response_oid(), oid1);
                }
                (_, msg) => panic!("Unexpected reply: {:?}", msg_kind(&msg)),
            }

            // a poisoned body aimed at a notify reference
            let oid2 = Rrid::new(me, 2, 2);
            let wm = WireMessage::new(me, Rrid::NULL, oid2, b"garba");
            framing::write_frame(&mut wire, wm.header(), wm.body())
                .await
                .expect("Poisoned frame write failed");
            match recv_frame(&mut wire).await {
                (header, SystemMessage::Result(Answer::Exception(e))) => {
                    assert_eq!(header.response_oid(), oid2);
                    assert_eq!(e.cause().kind(), ErrorKind::CommunicationSerialize);
                }
                (_, msg) => panic!("Unexpected reply: {:?}", msg_kind(&msg)),
            }

            // the dispatcher never desynchronized
            let oid3 = Rrid::new(me, 3, 2);
            send_frame(
                &mut wire,
                me,
                Rrid::NULL,
                oid3,
                &SystemMessage::CallFetch(Thunk::Apply(TestOp::Echo(12))),
            )
            .await;
            match recv_frame(&mut wire).await {
                (header, SystemMessage::Result(Answer::Value(12))) => {
                    assert_eq!(header.response_oid(), oid3);
                }
                (_, msg) => panic!("Unexpected reply: {:?}", msg_kind(&msg)),
            }
        });
    }

    #[test]
    fn test_cookie_mismatch_closes_the_connection() {
        runtime();
        rt::block_on(async {
            let cookie = Cookie::random();
            let manager: LocalManager<TestData> = LocalManager::new(cookie, executor);
            let node = Node::new(
                NodeConfig::controller(cookie).in_process(),
                Box::new(manager),
                executor(),
            );

            let (mut wire, theirs) = mem::duplex();
            node.accept(Box::new(theirs));
            framing::write_handshake(&mut wire, &Cookie::random())
                .await
                .expect("Handshake write failed");

            // the node closes the stream without a single reply frame
            use futures::io::AsyncReadExt;
            let mut buf = [0; 1];
            let n = wire.read(&mut buf).await.expect("Read failed");
            assert_eq!(n, 0);
        });
    }

    fn msg_kind(msg: &SystemMessage<TestOp, i64>) -> &'static str {
        match msg {
            SystemMessage::Call(_) => "Call",
            SystemMessage::CallFetch(_) => "CallFetch",
            SystemMessage::CallWait(_) => "CallWait",
            SystemMessage::RemoteDo(_) => "RemoteDo",
            SystemMessage::Result(_) => "Result",
            SystemMessage::IdentifySocket { .. } => "IdentifySocket",
            SystemMessage::IdentifySocketAck { .. } => "IdentifySocketAck",
            SystemMessage::JoinPgrp(_) => "JoinPgrp",
            SystemMessage::JoinComplete { .. } => "JoinComplete",
        }
    }
}
