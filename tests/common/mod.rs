// tests/common/mod.rs

//! Shared harness for the integration tests: a real controller plus any
//! number of nodes, all bound to ephemeral loopback ports and wired through
//! the crate's actual TCP transport rather than an in-memory stub — the
//! same shape the teacher uses for its own multi-connection integration
//! tests, generalized from one server to a controller plus several nodes.

#![allow(dead_code)]

use nuproc::config::Config;
use nuproc::controller::{Controller, ControllerClient};
use nuproc::runtime::RuntimeContext;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Starts a controller on an ephemeral port and leaks its shutdown sender:
/// test binaries are short-lived processes, so the accept loop simply runs
/// until the process exits.
pub async fn spawn_controller(id_reuse_delay_ms: u64) -> SocketAddr {
    let controller = Arc::new(Controller::new(Duration::from_millis(id_reuse_delay_ms)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(nuproc::controller::service::run(listener, controller, shutdown_rx));
    std::mem::forget(shutdown_tx);
    addr
}

/// Starts one node against `controller_addr` on an ephemeral port, registers
/// it with the controller, and returns its shared context once the proclet
/// server is accepting connections.
pub async fn spawn_node(
    controller_addr: SocketAddr,
    configure: impl FnOnce(&mut Config),
) -> Arc<RuntimeContext> {
    let mut config = Config::default();
    config.controller_addr = controller_addr;
    configure(&mut config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bind_addr = listener.local_addr().unwrap();
    config.bind_addr = bind_addr;

    let controller = Arc::new(ControllerClient::new(controller_addr));
    controller
        .register_node(bind_addr, config.runtime_heap_kb * 1024, config.num_kthreads)
        .await
        .unwrap();

    let ctx = RuntimeContext::new(config, bind_addr, controller);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server_ctx = Arc::clone(&ctx);
    tokio::spawn(nuproc::rpc::server::run(listener, server_ctx, shutdown_rx));
    std::mem::forget(shutdown_tx);

    ctx
}

/// A bare client context: registered with no controller-side node entry and
/// running no proclet server of its own, used to originate calls the way an
/// external caller would (and to hold its own, independently stale, id->ip
/// cache).
pub async fn spawn_client(controller_addr: SocketAddr) -> Arc<RuntimeContext> {
    let mut config = Config::default();
    config.controller_addr = controller_addr;
    let self_ip: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let controller = Arc::new(ControllerClient::new(controller_addr));
    RuntimeContext::new(config, self_ip, controller)
}
