// src/bin/node.rs

//! The `nuproc-node` binary: boots one node's proclet server, pressure
//! handlers, and mem pool prober, then idles until shutdown.

use std::env;
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("nuproc-node {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
        .unwrap_or("config.toml");

    let result = nuproc::runtime::boot::runtime_main_init(config_path, |_ctx| async move {
        tokio::signal::ctrl_c().await.ok();
        Ok(())
    })
    .await;

    if let Err(e) = &result {
        error!("node runtime error: {e}");
    }
    result.map_err(Into::into)
}
