// src/config.rs

//! Manages node configuration: loading, defaults, and validation.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Runtime configuration for a single node, loaded from a TOML file via
/// `runtime_main_init`. Mirrors the shape of a production node config: every
/// knob has a sane default so a minimal file (or none at all, in tests) is
/// enough to boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address this node listens on for the proclet server (incoming RPCs).
    pub bind_addr: SocketAddr,
    /// Address of the central controller.
    pub controller_addr: SocketAddr,
    /// Number of kthreads (OS threads, each running one cooperative
    /// scheduler) this node starts.
    pub num_kthreads: usize,
    /// Size of this node's per-runtime slab, in KiB. Allocations made by the
    /// runtime itself (not while executing inside a proclet) come from here.
    pub runtime_heap_kb: usize,
    /// Default capacity for a proclet's slab when none is given explicitly
    /// to `make_proclet`, in KiB.
    pub default_proclet_capacity_kb: usize,
    /// Memory pressure trips when this node's resident proclet bytes exceed
    /// this threshold.
    pub memory_pressure_bytes: usize,
    /// CPU pressure trips after congestion is sustained for this long.
    pub cpu_pressure_duration_ms: u64,
    /// How often the pressure handlers sample state.
    pub pressure_sample_interval_ms: u64,
    /// How often the distributed mempool's background prober revisits full
    /// shards.
    pub mempool_probe_interval_ms: u64,
    /// Delay before the controller is willing to reassign a destroyed
    /// proclet's id (see DESIGN.md, Open Question #2).
    pub id_reuse_delay_ms: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9100".parse().unwrap(),
            controller_addr: "127.0.0.1:9000".parse().unwrap(),
            num_kthreads: 4,
            runtime_heap_kb: 16 * 1024,
            default_proclet_capacity_kb: 4 * 1024,
            memory_pressure_bytes: 512 * 1024 * 1024,
            cpu_pressure_duration_ms: 500,
            pressure_sample_interval_ms: 100,
            mempool_probe_interval_ms: 200,
            id_reuse_delay_ms: 5_000,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file, falling back to defaults for
    /// any field the file omits.
    pub fn from_file(path: &str) -> Result<Self, crate::error::NuError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .build()?;
        let cfg: Config = settings.try_deserialize().unwrap_or_default();
        Ok(cfg)
    }
}
