// src/pressure/mod.rs

//! Memory and CPU pressure handlers (spec §4.10). Grounded on the
//! teacher's `EvictionManager` (`core/tasks/eviction.rs`): a long-lived
//! task woken on an interval, sampling state, producing a (possibly
//! empty) migration batch, with an unproductive-attempt backoff.

use crate::migration::Migrator;
use crate::proclet::ProcletId;
use crate::runtime::RuntimeContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const MAX_UNPRODUCTIVE_ATTEMPTS: u64 = 600;
const VICTIMS_PER_CYCLE: usize = 4;

/// Selects proclets by highest absolute size and migrates them until this
/// node's resident bytes drop back under the configured threshold.
pub struct MemoryPressureHandler {
    ctx: Arc<RuntimeContext>,
}

impl MemoryPressureHandler {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let threshold = self.ctx.config.memory_pressure_bytes;
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.ctx.config.pressure_sample_interval_ms));
        let mut unproductive = 0u64;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let resident = self.resident_bytes();
                    if resident <= threshold {
                        if unproductive > 0 {
                            info!("memory usage back under threshold, resuming normal checks");
                            unproductive = 0;
                        }
                        continue;
                    }
                    if unproductive >= MAX_UNPRODUCTIVE_ATTEMPTS {
                        continue;
                    }
                    let freed = self.migrate_largest().await;
                    if freed == 0 {
                        unproductive += 1;
                        debug!(unproductive, "memory pressure cycle unproductive");
                    } else {
                        unproductive = 0;
                    }
                }
                _ = shutdown.recv() => {
                    info!("memory pressure handler shutting down");
                    return;
                }
            }
        }
    }

    fn resident_bytes(&self) -> usize {
        self.ctx
            .registry
            .ids()
            .iter()
            .filter_map(|id| self.ctx.registry.get(*id))
            .map(|e| e.header.slab.used())
            .sum()
    }

    /// Ranks victims by resident slab usage, highest first, and migrates
    /// up to `VICTIMS_PER_CYCLE` of them. Returns total bytes freed.
    async fn migrate_largest(&self) -> usize {
        let mut candidates: Vec<(ProcletId, usize)> = self
            .ctx
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| {
                let entry = self.ctx.registry.get(id)?;
                if entry.header.is_pinned() {
                    return None;
                }
                Some((id, entry.header.slab.used()))
            })
            .collect();
        candidates.sort_by_key(|(_, size)| std::cmp::Reverse(*size));

        let migrator = Migrator::new(Arc::clone(&self.ctx));
        let mut freed = 0usize;
        for (id, size) in candidates.into_iter().take(VICTIMS_PER_CYCLE) {
            match migrator.migrate(id, size).await {
                Ok(()) => freed += size,
                Err(e) => debug!(%id, "memory-pressure migration skipped: {e}"),
            }
        }
        freed
    }
}

/// Selects proclets by highest recent monitor cycles once CPU congestion
/// has been sustained past `cpu_pressure_duration_ms`.
pub struct CpuPressureHandler {
    ctx: Arc<RuntimeContext>,
}

impl CpuPressureHandler {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let trip_after = Duration::from_millis(self.ctx.config.cpu_pressure_duration_ms);
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.ctx.config.pressure_sample_interval_ms));
        let mut congested_since: Option<tokio::time::Instant> = None;
        let mut unproductive = 0u64;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let congested = self.ctx.scheduler.total_queued() > self.congestion_threshold();
                    if !congested {
                        congested_since = None;
                        unproductive = 0;
                        continue;
                    }
                    let since = *congested_since.get_or_insert_with(tokio::time::Instant::now);
                    if since.elapsed() < trip_after {
                        continue;
                    }
                    if unproductive >= MAX_UNPRODUCTIVE_ATTEMPTS {
                        continue;
                    }
                    let migrated = self.migrate_hottest().await;
                    if migrated == 0 {
                        unproductive += 1;
                    } else {
                        unproductive = 0;
                        warn!(migrated, "migrated proclets off a congested node");
                    }
                }
                _ = shutdown.recv() => {
                    info!("cpu pressure handler shutting down");
                    return;
                }
            }
        }
    }

    fn congestion_threshold(&self) -> usize {
        self.ctx.scheduler.num_kthreads() * 64
    }

    async fn migrate_hottest(&self) -> usize {
        let mut candidates: Vec<(ProcletId, u64)> = self
            .ctx
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| {
                let entry = self.ctx.registry.get(id)?;
                if entry.header.is_pinned() {
                    return None;
                }
                Some((id, entry.header.monitor_cycles()))
            })
            .collect();
        candidates.sort_by_key(|(_, cycles)| std::cmp::Reverse(*cycles));

        let migrator = Migrator::new(Arc::clone(&self.ctx));
        let mut count = 0usize;
        for (id, _cycles) in candidates.into_iter().take(VICTIMS_PER_CYCLE) {
            let demand = self
                .ctx
                .registry
                .get(id)
                .map(|e| e.header.slab.capacity())
                .unwrap_or(0);
            if migrator.migrate(id, demand).await.is_ok() {
                count += 1;
            }
        }
        count
    }
}
