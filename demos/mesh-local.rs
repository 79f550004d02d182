mod common;

use common::*;

use coven::cluster::async_runtime as rt;
use coven::cluster::communication::framing::Cookie;
use coven::cluster::communication::{Node, NodeConfig};
use coven::cluster::launch::local::LocalManager;
use coven::cluster::launch::LaunchParams;
use coven::cluster::supervisor;
use coven::cluster::topology::Topology;
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
        Box::new(manager.clone()),
        calc_executor(),
    );

    // a lazy mesh: worker links come up on first use
    let params = LaunchParams::workers(3)
        .topology(Topology::AllToAll)
        .lazy(true);
    let ids = supervisor::add_workers(&node, params).await.unwrap();
    println!("Cluster up, workers: {:?}", ids);
    for wid in &ids {
        println!("Connections to {} so far: {}", wid, manager.connect_count(*wid));
    }

    // drive a call from the last worker to the first; this is the
    // moment their connection is actually established
    let last = manager.worker_node(ids[2]).unwrap();
    let v = last
        .remotecall_fetch(ids[0], CalcOp::Double(4))
        .await
        .unwrap();
    println!("Worker {} asked {} to double 4: {}", ids[2], ids[0], v);
    println!(
        "Connections to {} after first use: {}",
        ids[0],
        manager.connect_count(ids[0])
    );

    supervisor::rmprocs(&node, &ids).await.unwrap();
    println!("Workers removed, bye");
}
