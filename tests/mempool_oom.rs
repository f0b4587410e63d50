// tests/mempool_oom.rs

//! Out-of-memory propagation through the distributed memory pool: once the
//! cluster has no node left with room for another shard lease, `allocate`
//! surfaces the failure to its caller rather than hanging or panicking.
//! Per-shard fill/mark-full/rotate/resurrect behavior has its own unit
//! tests colocated in `mempool::tests`; this exercises the path above that,
//! through a real controller connection.

mod common;

use nuproc::invocation::registry::{CtorId, register_constructor};

#[derive(serde::Serialize, serde::Deserialize)]
struct Cell(i64);

const CTOR: CtorId = CtorId(92_001);

#[tokio::test]
async fn allocate_fails_once_the_cluster_has_no_shard_capacity_left() {
    register_constructor::<Cell, i64, _>(CTOR, Cell);

    let shard_capacity_kb = 4;
    let controller_addr = common::spawn_controller(50).await;
    let node = common::spawn_node(controller_addr, |c| {
        c.default_proclet_capacity_kb = shard_capacity_kb;
        // Room for exactly two shard leases cluster-wide.
        c.runtime_heap_kb = shard_capacity_kb * 2;
    })
    .await;

    let args = nuproc::rpc::wire::archive_encode(&0i64).unwrap();

    let first = node.mempool.allocate::<Cell>(&node, CTOR, args.clone()).await;
    assert!(first.is_ok(), "first shard lease should succeed");

    let second = node.mempool.allocate::<Cell>(&node, CTOR, args.clone()).await;
    assert!(second.is_ok(), "second shard lease should succeed");

    let third = node.mempool.allocate::<Cell>(&node, CTOR, args).await;
    assert!(
        third.is_err(),
        "a third shard lease should be refused once the cluster is out of capacity"
    );
}
