// tests/migration_and_cache.rs

//! End-to-end coverage for the migration protocol and the stale-cache
//! recovery path it creates on every caller that cached the old home.

mod common;

use nuproc::handles::make_proclet;
use nuproc::invocation;
use nuproc::invocation::registry::{CtorId, MethodId, register_codec, register_constructor, register_method};
use nuproc::migration::Migrator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Deserialize)]
struct Counter(i64);

const CTOR: CtorId = CtorId(91_001);
const INCR: MethodId = MethodId(91_002);

fn register_counter() {
    register_constructor::<Counter, i64, _>(CTOR, Counter);
    register_method::<Counter, i64, i64, _>(INCR, |c, delta| {
        c.0 += delta;
        Ok(c.0)
    });
    register_codec::<Counter>(CTOR);
}

/// A method call sequence spanning a forced migration ends with the same
/// total the calls would have produced had the proclet never moved, and the
/// proclet lands on exactly the node the migrator chose.
#[tokio::test]
async fn counter_state_survives_a_forced_migration() {
    register_counter();

    let controller_addr = common::spawn_controller(50).await;
    let node_a = common::spawn_node(controller_addr, |_| {}).await;
    let node_b = common::spawn_node(controller_addr, |_| {}).await;

    let args = nuproc::rpc::wire::archive_encode(&0i64).unwrap();
    let handle = make_proclet(&node_a, CTOR, args, false, None, Some(node_a.self_ip))
        .await
        .unwrap();
    let id = handle.id();
    assert!(node_a.registry.contains(id));

    for _ in 0..5 {
        let v: i64 = invocation::run(&node_a, id, INCR, 1i64).await.unwrap();
        assert!(v > 0);
    }

    let migrator = Migrator::new(Arc::clone(&node_a));
    migrator.migrate(id, 4096).await.unwrap();

    assert!(!node_a.registry.contains(id));
    assert!(node_b.registry.contains(id));

    let mut final_value = 0i64;
    for _ in 0..5 {
        final_value = invocation::run(&node_a, id, INCR, 1i64).await.unwrap();
    }

    assert_eq!(final_value, 10);
}

/// A caller whose cache still points at the pre-migration home gets a
/// `wrong-client` on its first attempt and the client manager transparently
/// retries against the controller's current location.
#[tokio::test]
async fn stale_client_cache_recovers_after_migration() {
    register_counter();

    let controller_addr = common::spawn_controller(50).await;
    let node_a = common::spawn_node(controller_addr, |_| {}).await;
    let _node_b = common::spawn_node(controller_addr, |_| {}).await;
    let client = common::spawn_client(controller_addr).await;

    let args = nuproc::rpc::wire::archive_encode(&0i64).unwrap();
    let handle = make_proclet(&node_a, CTOR, args, false, None, Some(node_a.self_ip))
        .await
        .unwrap();
    let id = handle.id();

    // Client resolves and caches the pre-migration home.
    let v: i64 = invocation::run(&client, id, INCR, 2i64).await.unwrap();
    assert_eq!(v, 2);

    let migrator = Migrator::new(Arc::clone(&node_a));
    migrator.migrate(id, 4096).await.unwrap();

    // Client's cache still says node_a; the call must still succeed.
    let v: i64 = invocation::run(&client, id, INCR, 3i64).await.unwrap();
    assert_eq!(v, 5);
}
