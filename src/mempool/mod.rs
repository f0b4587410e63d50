// src/mempool/mod.rs

//! The distributed memory pool (spec §4.7): a fixed number of lanes, each
//! caching a "current" free shard, rotating in a fresh one when the
//! current shard can't satisfy a demand, plus a background prober that
//! resurrects shards marked full once they again have room.
//!
//! Grounded on the teacher's per-destination connection pool
//! (`rpc::client_manager::ConnectionPool`): a fixed set of slots, each
//! lazily filled and rotated on exhaustion, here generalized from "a slot
//! holds a connection" to "a slot holds a capacity-tracking shard".

mod shard;

pub use shard::Shard;

use crate::controller::ControllerClient;
use crate::error::{NuError, NuResult};
use crate::handles::{RemUniquePtr, make_proclet_unique};
use crate::invocation::registry::CtorId;
use crate::proclet::{NodeIp, ProcletId, ProcletRegistry};
use crate::rpc::RpcClientManager;
use crate::runtime::RuntimeContext;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const NUM_LANES: usize = 8;
const MAX_ROTATIONS: u32 = 4;

/// A handle to a pool-allocated object. In addition to tearing down the
/// remote object, dropping (or [`PoolHandle::reset_async`]-ing) this
/// credits the bytes it held back to its shard, so a later allocation can
/// reuse the space without waiting for the background prober.
pub struct PoolHandle<T> {
    inner: Option<RemUniquePtr<T>>,
    pool: Arc<DistributedMemPool>,
    shard_id: ProcletId,
    bytes: usize,
}

impl<T> PoolHandle<T> {
    pub fn target(&self) -> ProcletId {
        self.inner.as_ref().expect("live until drop").target()
    }

    /// Explicit, awaited teardown — see [`RemUniquePtr::reset_async`].
    pub async fn reset_async(mut self) -> NuResult<()> {
        let inner = self.inner.take().expect("live until drop");
        self.pool.credit(self.shard_id, self.bytes);
        inner.reset_async().await
    }
}

impl<T> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        if self.inner.take().is_some() {
            self.pool.credit(self.shard_id, self.bytes);
        }
    }
}

struct Lane {
    current: Mutex<Option<ProcletId>>,
}

/// Per-node distributed mem pool. One instance lives on
/// [`RuntimeContext`]; every `allocate` call picks a lane (round robin)
/// and tries that lane's current shard before rotating.
pub struct DistributedMemPool {
    registry: Arc<ProcletRegistry>,
    controller: Arc<ControllerClient>,
    #[allow(dead_code)]
    rpc: Arc<RpcClientManager>,
    self_ip: NodeIp,
    shard_capacity_bytes: usize,
    lanes: Vec<Lane>,
    shards: DashMap<ProcletId, Arc<Shard>>,
    full_shards: Mutex<HashSet<ProcletId>>,
    next_lane: AtomicUsize,
}

impl DistributedMemPool {
    pub fn new(
        registry: Arc<ProcletRegistry>,
        controller: Arc<ControllerClient>,
        rpc: Arc<RpcClientManager>,
        self_ip: NodeIp,
        shard_capacity_bytes: usize,
    ) -> Self {
        let lanes = (0..NUM_LANES)
            .map(|_| Lane {
                current: Mutex::new(None),
            })
            .collect();
        Self {
            registry,
            controller,
            rpc,
            self_ip,
            shard_capacity_bytes,
            lanes,
            shards: DashMap::new(),
            full_shards: Mutex::new(HashSet::new()),
            next_lane: AtomicUsize::new(0),
        }
    }

    fn pick_lane(&self) -> usize {
        self.next_lane.fetch_add(1, Ordering::Relaxed) % self.lanes.len()
    }

    /// Leases a fresh shard's id + home node from the controller — the
    /// same authoritative-placement call a real proclet construction
    /// uses, so shard capacity is accounted against the same per-node
    /// free-memory counters.
    async fn new_shard(&self) -> NuResult<Arc<Shard>> {
        let (id, home_ip) = self
            .controller
            .allocate_proclet(self.shard_capacity_bytes, None)
            .await?;
        debug!(%id, %home_ip, "mem pool leased a fresh shard");
        let shard = Arc::new(Shard::new(id, self.shard_capacity_bytes));
        self.shards.insert(id, Arc::clone(&shard));
        Ok(shard)
    }

    fn mark_full(&self, id: ProcletId) {
        self.full_shards.lock().insert(id);
    }

    fn is_full(&self, id: ProcletId) -> bool {
        self.full_shards.lock().contains(&id)
    }

    fn credit(&self, shard_id: ProcletId, bytes: usize) {
        if let Some(shard) = self.shards.get(&shard_id) {
            shard.credit(bytes);
        }
    }

    async fn current_shard(&self, lane: usize) -> NuResult<Arc<Shard>> {
        let existing = *self.lanes[lane].current.lock();
        if let Some(id) = existing {
            if !self.is_full(id) {
                if let Some(shard) = self.shards.get(&id) {
                    return Ok(Arc::clone(&shard));
                }
            }
        }
        let shard = self.new_shard().await?;
        *self.lanes[lane].current.lock() = Some(shard.id);
        Ok(shard)
    }

    /// Allocates a `T` built from `ctor`/`args`, sized by `mem::size_of`
    /// for shard-budget purposes. Steps 1–3 of spec §4.7's algorithm:
    /// read the lane's current shard, reserve against it (rotating in a
    /// new one on failure), retrying up to [`MAX_ROTATIONS`] times before
    /// surfacing out-of-memory.
    pub async fn allocate<T: Send + 'static>(
        self: &Arc<Self>,
        ctx: &Arc<RuntimeContext>,
        ctor: CtorId,
        args: Vec<u8>,
    ) -> NuResult<PoolHandle<T>> {
        let bytes = std::mem::size_of::<T>().max(1);
        let lane = self.pick_lane();
        for attempt in 0..MAX_ROTATIONS {
            let shard = self.current_shard(lane).await?;
            if shard.try_reserve(bytes) {
                match make_proclet_unique::<T>(ctx, ctor, args.clone(), bytes, None).await {
                    Ok(inner) => {
                        return Ok(PoolHandle {
                            inner: Some(inner),
                            pool: Arc::clone(self),
                            shard_id: shard.id,
                            bytes,
                        });
                    }
                    Err(e) => {
                        shard.credit(bytes);
                        return Err(e);
                    }
                }
            }
            debug!(attempt, shard = %shard.id, "shard exhausted, rotating");
            self.mark_full(shard.id);
            *self.lanes[lane].current.lock() = None;
        }
        warn!(lanes = self.lanes.len(), "mem pool exhausted all rotation attempts");
        Err(NuError::OutOfMemory(ProcletId::NULL))
    }

    /// The background probe: every `interval`, re-tests each shard marked
    /// full with [`Shard::has_space_for`] and un-marks any that can again
    /// satisfy `probe_size` — step 4 of spec §4.7's algorithm.
    pub async fn run_background_probe(self: Arc<Self>, probe_size: usize, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let candidates: Vec<ProcletId> = self.full_shards.lock().iter().copied().collect();
            let mut resurrected = 0;
            for id in candidates {
                if let Some(shard) = self.shards.get(&id) {
                    if shard.has_space_for(probe_size) {
                        self.full_shards.lock().remove(&id);
                        resurrected += 1;
                    }
                }
            }
            if resurrected > 0 {
                info!(resurrected, resident = self.registry.len(), self_ip = %self.self_ip, "mem pool resurrected full shards");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_ctx() -> Arc<RuntimeContext> {
        let controller = Arc::new(ControllerClient::new("127.0.0.1:19500".parse().unwrap()));
        RuntimeContext::new(Config::default(), "127.0.0.1:19600".parse().unwrap(), controller)
    }

    #[test]
    fn shard_rotation_marks_full_shards() {
        let pool_ctx = test_ctx();
        let pool = &pool_ctx.mempool;
        assert_eq!(pool.full_shards.lock().len(), 0);
        let id = ProcletId(123);
        pool.shards.insert(id, Arc::new(Shard::new(id, 8)));
        pool.mark_full(id);
        assert!(pool.is_full(id));
    }

    #[tokio::test]
    async fn credit_reclaims_shard_capacity() {
        let ctx = test_ctx();
        let pool = Arc::clone(&ctx.mempool);
        let id = ProcletId(55);
        let shard = Arc::new(Shard::new(id, 16));
        assert!(shard.try_reserve(16));
        pool.shards.insert(id, Arc::clone(&shard));
        pool.credit(id, 16);
        assert_eq!(shard.used(), 0);
    }
}
