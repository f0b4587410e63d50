// src/runtime/mod.rs

//! The explicit runtime context threaded through every entry point, and the
//! boot sequence (`runtime_main_init`).
//!
//! The original source keeps its runtime as a thread-local + process-wide
//! singleton (see DESIGN NOTES, "Global runtime singleton"). Rather than
//! reproduce that as a `static`, every subsystem here takes an
//! `Arc<RuntimeContext>` (or a narrower reference into it); the one
//! thread-local that remains (`proclet::slab::CURRENT_SLAB_CAPACITY`) is
//! purely the "which slab is installed right now" scope, not the runtime
//! itself.

pub mod boot;

use crate::config::Config;
use crate::controller::ControllerClient;
use crate::error::NuResult;
use crate::mempool::DistributedMemPool;
use crate::proclet::{NodeIp, ProcletId, ProcletRegistry};
use crate::rpc::RpcClientManager;
use crate::scheduler::Scheduler;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// All shared, node-wide state. Wrapped in `Arc` and passed to every
/// background task, connection handler, and invocation.
pub struct RuntimeContext {
    pub config: Config,
    pub self_ip: NodeIp,
    pub registry: Arc<ProcletRegistry>,
    pub controller: Arc<ControllerClient>,
    pub rpc: Arc<RpcClientManager>,
    pub scheduler: Arc<Scheduler>,
    pub mempool: Arc<DistributedMemPool>,
    /// Pending `run_async` callbacks awaiting a cross-node delivery (see
    /// `rpc::CallbackDelivery` and `future` module).
    pending_callbacks: DashMap<u64, oneshot::Sender<NuResult<Vec<u8>>>>,
    next_callback_id: AtomicU64,
}

impl RuntimeContext {
    pub fn new(
        config: Config,
        self_ip: NodeIp,
        controller: Arc<ControllerClient>,
    ) -> Arc<Self> {
        let registry = Arc::new(ProcletRegistry::new());
        let rpc = Arc::new(RpcClientManager::new(Arc::clone(&controller)));
        let scheduler = Arc::new(Scheduler::new(config.num_kthreads));
        let mempool = Arc::new(DistributedMemPool::new(
            Arc::clone(&registry),
            Arc::clone(&controller),
            Arc::clone(&rpc),
            self_ip,
            config.default_proclet_capacity_kb * 1024,
        ));
        Arc::new(Self {
            config,
            self_ip,
            registry,
            controller,
            rpc,
            scheduler,
            mempool,
            pending_callbacks: DashMap::new(),
            next_callback_id: AtomicU64::new(1),
        })
    }

    pub fn register_callback(&self) -> (u64, oneshot::Receiver<NuResult<Vec<u8>>>) {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_callbacks.insert(id, tx);
        (id, rx)
    }

    pub fn fulfill_callback(&self, id: u64, result: NuResult<Vec<u8>>) {
        if let Some((_, tx)) = self.pending_callbacks.remove(&id) {
            let _ = tx.send(result);
        }
    }

    /// Resolves `id` to its home node if it is resident here, used by the
    /// invocation fast-path check.
    pub fn is_resident(&self, id: ProcletId) -> bool {
        self.registry.contains(id)
    }
}
