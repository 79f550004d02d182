mod common;

use common::*;

use coven::cluster::async_runtime as rt;
use coven::cluster::communication::framing::Cookie;
use coven::cluster::communication::{Node, NodeConfig};
use coven::cluster::launch::local::LocalManager;
use coven::cluster::launch::LaunchParams;
use coven::cluster::supervisor;
use coven::cluster::{init, InitConfig};

fn main() {
    env_logger::init();
    let conf = InitConfig {
        async_threads: num_cpus::get(),
    };
    let _guard = unsafe { init(conf).unwrap() };
    rt::block_on(async_main());
}

async fn async_main() {
    let cookie = Cookie::random();
    let manager = LocalManager::new(cookie, calc_executor);
    let node = Node::new(
        NodeConfig::controller(cookie).in_process(),
        Box::new(manager),
        calc_executor(),
    );

    let ids = supervisor::add_workers(&node, LaunchParams::workers(2))
        .await
        .unwrap();
    println!("Cluster up, workers: {:?}", ids);

    for wid in &ids {
        let v = node.remotecall_fetch(*wid, CalcOp::Double(21)).await.unwrap();
        println!("Worker {} doubled 21 into {}", wid, v);
    }

    // scatter a sum over the pool and reduce the partial results
    let futs = vec![
        node.remotecall(ids[0], CalcOp::Sum(1, 50)).await.unwrap(),
        node.remotecall(ids[1], CalcOp::Sum(51, 100)).await.unwrap(),
    ];
    let mut total = 0;
    for fut in &futs {
        total += node.fetch(fut).await.unwrap();
    }
    println!("Sum over 1..=100 = {}", total);

    supervisor::rmprocs(&node, &ids).await.unwrap();
    println!("Workers removed, bye");
}
