// src/runtime/boot.rs

//! Node boot sequence (spec §6's `runtime_main_init`), split into the same
//! three phases as the teacher's `server::{initialization, spawner,
//! connection_loop}`: load config + bind + build context, spawn background
//! tasks, then run the accept loop until shutdown.

use super::RuntimeContext;
use crate::config::Config;
use crate::controller::ControllerClient;
use crate::error::NuResult;
use crate::pressure::{CpuPressureHandler, MemoryPressureHandler};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

mod initialization {
    use super::*;

    /// Loads config, installs tracing, registers with the controller, binds
    /// the proclet server's listener, and builds the shared context.
    pub async fn setup(config: Config) -> NuResult<(Arc<RuntimeContext>, TcpListener)> {
        let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

        let controller = Arc::new(ControllerClient::new(config.controller_addr));
        let self_ip = config.bind_addr;
        controller
            .register_node(self_ip, config.runtime_heap_kb * 1024, config.num_kthreads)
            .await?;

        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(%self_ip, kthreads = config.num_kthreads, "node listening");

        let ctx = RuntimeContext::new(config, self_ip, controller);
        Ok((ctx, listener))
    }
}

mod spawner {
    use super::*;

    /// Starts every long-lived background task: the two pressure handlers
    /// and the distributed mem pool's background prober. The per-kthread
    /// cooperative schedulers themselves are driven inline by the accept
    /// loop's tasks rather than as separate OS threads (see DESIGN.md).
    pub fn spawn_all(
        ctx: &Arc<RuntimeContext>,
        shutdown_tx: &broadcast::Sender<()>,
        tasks: &mut JoinSet<()>,
    ) {
        let mem_handler = MemoryPressureHandler::new(Arc::clone(ctx));
        let mem_shutdown = shutdown_tx.subscribe();
        tasks.spawn(async move { mem_handler.run(mem_shutdown).await });

        let cpu_handler = CpuPressureHandler::new(Arc::clone(ctx));
        let cpu_shutdown = shutdown_tx.subscribe();
        tasks.spawn(async move { cpu_handler.run(cpu_shutdown).await });

        let pool = Arc::clone(&ctx.mempool);
        let probe_interval = Duration::from_millis(ctx.config.mempool_probe_interval_ms);
        let probe_size = ctx.config.default_proclet_capacity_kb * 1024;
        tasks.spawn(async move { pool.run_background_probe(probe_size, probe_interval).await });

        info!("all background tasks spawned");
    }
}

mod connection_loop {
    use super::*;

    /// Runs the proclet server's accept loop until shutdown fires.
    pub async fn run(listener: TcpListener, ctx: Arc<RuntimeContext>, shutdown: broadcast::Receiver<()>) {
        crate::rpc::server::run(listener, ctx, shutdown).await;
    }
}

/// Single entry point for a node process (spec §6, "Process boundary").
/// Boots every subsystem, then hands control to `main_fn` until it returns;
/// on return (or error), every background task is signaled to shut down and
/// joined before `runtime_main_init` itself returns.
pub async fn runtime_main_init<F, Fut>(cfg_path: &str, main_fn: F) -> NuResult<()>
where
    F: FnOnce(Arc<RuntimeContext>) -> Fut,
    Fut: Future<Output = NuResult<()>>,
{
    let config = Config::from_file(cfg_path)?;
    let (ctx, listener) = initialization::setup(config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut tasks = JoinSet::new();
    spawner::spawn_all(&ctx, &shutdown_tx, &mut tasks);

    let conn_ctx = Arc::clone(&ctx);
    let conn_shutdown = shutdown_tx.subscribe();
    tasks.spawn(async move { connection_loop::run(listener, conn_ctx, conn_shutdown).await });

    let result = main_fn(Arc::clone(&ctx)).await;

    let _ = shutdown_tx.send(());
    while tasks.join_next().await.is_some() {}
    result
}
