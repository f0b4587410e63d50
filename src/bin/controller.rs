// src/bin/controller.rs

//! The `nuproc-controller` binary: the central authority for id allocation,
//! id->ip resolution, and per-node capacity accounting (spec §4.2). A
//! second runtime mode in the same shape as the teacher's `--warden` split
//! in `main.rs`, with its own config file and log filter.

use nuproc::config::Config;
use nuproc::controller::Controller;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("nuproc-controller {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
        .unwrap_or("controller.toml");

    let config = Config::from_file(config_path)?;

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    info!("starting nuproc controller");

    let controller = Arc::new(Controller::new(Duration::from_millis(config.id_reuse_delay_ms)));
    let listener = TcpListener::bind(config.controller_addr).await?;
    info!(addr = %config.controller_addr, "controller listening");

    let (shutdown_tx, _) = broadcast::channel(1);
    let shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = nuproc::controller::service::run(listener, controller, shutdown_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down controller");
            let _ = shutdown_tx.send(());
        }
    }

    Ok(())
}
