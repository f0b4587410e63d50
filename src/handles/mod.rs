// src/handles/mod.rs

//! Typed, user-facing handles over proclets (spec §4.6, and the DESIGN
//! NOTES resolution of "deep template inheritance in the source": a small
//! set of handle variants carrying only a compile-time phantom witness over
//! a single internal, erased `ProcletId` target).
//!
//! Copies are synchronous (the callee must observe the increment before the
//! old handle is usable again); drops are not awaited, so they spawn a
//! detached task that performs the remote decrement/destroy in the
//! background, matching spec §4.6's "drops may be issued asynchronously".

use crate::error::{NuError, NuResult};
use crate::proclet::ProcletId;
use crate::runtime::RuntimeContext;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

fn spawn_detached_delta(ctx: Arc<RuntimeContext>, id: ProcletId, delta: i64) {
    tokio::spawn(async move {
        if let Err(e) = ctx.rpc.refcount_delta(id, delta).await {
            warn!(%id, delta, "detached refcount delta failed: {e}");
        }
    });
}

fn spawn_detached_destroy(ctx: Arc<RuntimeContext>, id: ProcletId) {
    tokio::spawn(async move {
        if let Err(e) = ctx.rpc.destroy(id).await {
            warn!(%id, "detached destroy failed: {e}");
        }
    });
}

/// A strong, reference-counted handle to a proclet of type `T`. Copying
/// (via [`Proclet::duplicate`]) increments the target's refcount
/// synchronously; dropping decrements it on a detached task.
pub struct Proclet<T> {
    ctx: Arc<RuntimeContext>,
    id: ProcletId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Proclet<T> {
    /// Wraps an existing, already-refcounted id. Used by `make_proclet` and
    /// by deserializing a handle that crossed the wire (the serialized
    /// handle implicitly carries one unit of refcount, matching the
    /// "closure results may return owning handles" path of scenario 1).
    pub(crate) fn from_parts(ctx: Arc<RuntimeContext>, id: ProcletId) -> Self {
        Self {
            ctx,
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> ProcletId {
        self.id
    }

    pub fn downgrade(&self) -> WeakProclet<T> {
        WeakProclet {
            ctx: Arc::clone(&self.ctx),
            id: self.id,
            _marker: PhantomData,
        }
    }

    /// Increments the remote refcount and returns a second strong handle.
    /// Awaited by the caller: the spec requires the callee observe the
    /// increment before the original handle is usable again.
    pub async fn duplicate(&self) -> NuResult<Self> {
        self.ctx.rpc.refcount_delta(self.id, 1).await?;
        Ok(Self {
            ctx: Arc::clone(&self.ctx),
            id: self.id,
            _marker: PhantomData,
        })
    }
}

impl<T> Drop for Proclet<T> {
    fn drop(&mut self) {
        spawn_detached_delta(Arc::clone(&self.ctx), self.id, -1);
    }
}

/// A non-owning handle. Never touches the refcount; upgrading re-resolves
/// the target and fails (rather than producing garbage) if it has been
/// destroyed (invariant #5).
pub struct WeakProclet<T> {
    ctx: Arc<RuntimeContext>,
    id: ProcletId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for WeakProclet<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> WeakProclet<T> {
    pub fn id(&self) -> ProcletId {
        self.id
    }

    /// Resolves the target and, if still live, takes out a strong handle on
    /// it. Fails with `DestroyedTarget` rather than returning a handle to a
    /// no-longer-resident id.
    pub async fn upgrade(&self) -> NuResult<Proclet<T>> {
        self.ctx.controller.resolve_proclet(self.id).await?;
        self.ctx.rpc.refcount_delta(self.id, 1).await?;
        Ok(Proclet::from_parts(Arc::clone(&self.ctx), self.id))
    }
}

/// An unmanaged remote pointer: no refcounting, no ownership. Dereferencing
/// is the caller's responsibility (see invariant about raw pointers only
/// being valid while not in transit); this crate expresses that by routing
/// every access back through [`crate::invocation::run`] rather than
/// offering a literal memory dereference.
pub struct RemRawPtr<T> {
    ctx: Arc<RuntimeContext>,
    target: ProcletId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RemRawPtr<T> {
    pub(crate) fn from_parts(ctx: Arc<RuntimeContext>, target: ProcletId) -> Self {
        Self {
            ctx,
            target,
            _marker: PhantomData,
        }
    }

    pub fn target(&self) -> ProcletId {
        self.target
    }

    pub fn as_weak(&self) -> WeakProclet<T> {
        WeakProclet {
            ctx: Arc::clone(&self.ctx),
            id: self.target,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for RemRawPtr<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            target: self.target,
            _marker: PhantomData,
        }
    }
}

/// Exclusive ownership of a remote object: destroys its target on drop.
/// Scenario 1 ("drop the handle; the remote vector's destructor runs
/// exactly once") is this type: the `Drop` impl only ever runs once because
/// `RemUniquePtr` is neither `Copy` nor `Clone`.
pub struct RemUniquePtr<T> {
    ctx: Arc<RuntimeContext>,
    target: ProcletId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RemUniquePtr<T> {
    pub(crate) fn from_parts(ctx: Arc<RuntimeContext>, target: ProcletId) -> Self {
        Self {
            ctx,
            target,
            _marker: PhantomData,
        }
    }

    pub fn target(&self) -> ProcletId {
        self.target
    }

    /// Explicit, awaited teardown. Prefer this over letting the value drop
    /// when the caller is already in an async context and wants to observe
    /// destruction completing (and any error from it) rather than firing a
    /// detached task.
    pub async fn reset_async(self) -> NuResult<()> {
        let result = self.ctx.rpc.destroy(self.target).await;
        // The destroy above already ran; skip the (redundant, detached)
        // one `Drop` would otherwise schedule.
        std::mem::forget(self);
        result
    }
}

impl<T> Drop for RemUniquePtr<T> {
    fn drop(&mut self) {
        spawn_detached_destroy(Arc::clone(&self.ctx), self.target);
    }
}

/// Reference-counted on the remote side: copies fan out a remote-side
/// refcount increment the same way [`Proclet::duplicate`] does. Distinct
/// from `Proclet<T>` only in that it typically reaches an object living
/// inside a distributed-mem-pool shard rather than a top-level proclet;
/// the handle shape (and refcount protocol) is identical either way.
pub struct RemSharedPtr<T> {
    ctx: Arc<RuntimeContext>,
    target: ProcletId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RemSharedPtr<T> {
    pub(crate) fn from_parts(ctx: Arc<RuntimeContext>, target: ProcletId) -> Self {
        Self {
            ctx,
            target,
            _marker: PhantomData,
        }
    }

    pub fn target(&self) -> ProcletId {
        self.target
    }

    pub async fn duplicate(&self) -> NuResult<Self> {
        self.ctx.rpc.refcount_delta(self.target, 1).await?;
        Ok(Self {
            ctx: Arc::clone(&self.ctx),
            target: self.target,
            _marker: PhantomData,
        })
    }

    pub fn as_weak(&self) -> WeakProclet<T> {
        WeakProclet {
            ctx: Arc::clone(&self.ctx),
            id: self.target,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for RemSharedPtr<T> {
    fn drop(&mut self) {
        spawn_detached_delta(Arc::clone(&self.ctx), self.target, -1);
    }
}

/// Asks the controller for an id + destination, then issues a construct
/// call (local fast path or remote RPC) — the common body behind
/// [`make_proclet`] and the distributed mem pool's own pooled
/// construction. Per spec §3's "Proclet: created by `make_proclet`...".
pub(crate) async fn allocate_and_construct(
    ctx: &Arc<RuntimeContext>,
    ctor: crate::invocation::registry::CtorId,
    args: Vec<u8>,
    pinned: bool,
    capacity_bytes: usize,
    ip_hint: Option<crate::proclet::NodeIp>,
) -> NuResult<ProcletId> {
    let (id, home_ip) = ctx
        .controller
        .allocate_proclet(capacity_bytes, ip_hint)
        .await?;
    if home_ip == ctx.self_ip {
        let header = Arc::new(crate::proclet::ProcletHeader::new(
            capacity_bytes,
            ctx.self_ip,
            pinned,
        ));
        if header.slab.allocate(args.len()).is_none() {
            return Err(NuError::OutOfMemory(id));
        }
        let object = crate::invocation::registry::construct(ctor, &args)?;
        ctx.registry
            .insert(id, Arc::new(crate::proclet::ProcletEntry::new(header, object, ctor)));
    } else {
        let req = crate::rpc::ConstructRequest {
            id,
            ctor: ctor.0,
            capacity_bytes,
            pinned,
            args,
        };
        ctx.rpc.construct(home_ip, &req).await?;
    }
    ctx.rpc.update_cache(id, home_ip);
    Ok(id)
}

/// Allocates a fresh proclet hosting a `T` built by `ctor`/`args`.
pub async fn make_proclet<T: Send + 'static>(
    ctx: &Arc<RuntimeContext>,
    ctor: crate::invocation::registry::CtorId,
    args: Vec<u8>,
    pinned: bool,
    capacity_bytes: Option<usize>,
    ip_hint: Option<crate::proclet::NodeIp>,
) -> NuResult<Proclet<T>> {
    let capacity_bytes = capacity_bytes.unwrap_or(ctx.config.default_proclet_capacity_kb * 1024);
    let id = allocate_and_construct(ctx, ctor, args, pinned, capacity_bytes, ip_hint).await?;
    Ok(Proclet::from_parts(Arc::clone(ctx), id))
}

/// Allocates a fresh proclet hosting a `T`, returning exclusive ownership
/// instead of a refcounted strong handle — used by the distributed mem
/// pool, whose shards hand out objects nothing else holds a reference to
/// yet.
pub(crate) async fn make_proclet_unique<T: Send + 'static>(
    ctx: &Arc<RuntimeContext>,
    ctor: crate::invocation::registry::CtorId,
    args: Vec<u8>,
    capacity_bytes: usize,
    ip_hint: Option<crate::proclet::NodeIp>,
) -> NuResult<RemUniquePtr<T>> {
    let id = allocate_and_construct(ctx, ctor, args, false, capacity_bytes, ip_hint).await?;
    Ok(RemUniquePtr::from_parts(Arc::clone(ctx), id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::controller::{Controller, ControllerClient};
    use crate::invocation::registry::{CtorId, register_constructor};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    struct Obj(#[allow(dead_code)] i64);

    /// One controller plus one node, both on ephemeral loopback ports, so
    /// `make_proclet`/`make_proclet_unique` exercise the full
    /// allocate-then-construct path over a real connection.
    async fn harness() -> Arc<RuntimeContext> {
        let controller = Arc::new(Controller::new(Duration::from_millis(50)));
        let c_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let c_addr = c_listener.local_addr().unwrap();
        let (c_tx, c_rx) = broadcast::channel(1);
        tokio::spawn(crate::controller::service::run(c_listener, controller, c_rx));
        std::mem::forget(c_tx);

        let n_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let n_addr = n_listener.local_addr().unwrap();
        let mut config = Config::default();
        config.controller_addr = c_addr;
        config.bind_addr = n_addr;

        let controller_client = Arc::new(ControllerClient::new(c_addr));
        controller_client
            .register_node(n_addr, config.runtime_heap_kb * 1024, config.num_kthreads)
            .await
            .unwrap();

        let ctx = RuntimeContext::new(config, n_addr, controller_client);
        let (n_tx, n_rx) = broadcast::channel(1);
        let server_ctx = Arc::clone(&ctx);
        tokio::spawn(crate::rpc::server::run(n_listener, server_ctx, n_rx));
        std::mem::forget(n_tx);
        ctx
    }

    #[tokio::test]
    async fn duplicate_increments_refcount_before_resuming_caller() {
        const CTOR: CtorId = CtorId(81_001);
        register_constructor::<Obj, i64, _>(CTOR, Obj);

        let ctx = harness().await;
        let args = crate::rpc::wire::archive_encode(&7i64).unwrap();
        let handle: Proclet<Obj> = make_proclet(&ctx, CTOR, args, false, None, None)
            .await
            .unwrap();
        let id = handle.id();
        let entry = ctx.registry.get(id).unwrap();
        assert_eq!(entry.header.ref_count(), 1);

        let dup = handle.duplicate().await.unwrap();
        assert_eq!(entry.header.ref_count(), 2);

        drop(dup);
        drop(handle);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(
            !ctx.registry.contains(id),
            "refcount should have reached zero and destroyed the proclet"
        );
    }

    #[tokio::test]
    async fn unique_handle_destroys_its_target_exactly_once_on_drop() {
        const CTOR: CtorId = CtorId(81_101);
        register_constructor::<Obj, i64, _>(CTOR, Obj);

        let ctx = harness().await;
        let args = crate::rpc::wire::archive_encode(&3i64).unwrap();
        let unique: RemUniquePtr<Obj> = make_proclet_unique(&ctx, CTOR, args, 4096, None)
            .await
            .unwrap();
        let id = unique.target();
        assert!(ctx.registry.contains(id));

        drop(unique);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!ctx.registry.contains(id));
    }
}

