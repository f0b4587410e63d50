// src/invocation/mod.rs

//! The invocation path (spec §4.4): `run` takes the fast local path when the
//! target proclet is resident and not mid-migration, else falls to the slow
//! RPC path through [`crate::rpc::RpcClientManager`]. `run_async` wraps
//! either path in a spawned task and hands the caller a
//! [`crate::future::Future`] immediately.
//!
//! State machine, matching spec §4.4 exactly:
//! `start -> args-copied -> executing -> returned -> caller-resumed`, with
//! the branch `executing -> serializing-move -> migrated -> caller-resumed`
//! taken when a migration lands between guard acquisition and return (here:
//! the guard's `Drop` always runs before the caller is resumed, so the
//! branch is folded into "guard held across the call, dropped after").

pub mod registry;

use crate::error::{NuError, NuResult};
use crate::future::{Future as NuFuture, Promise};
use crate::proclet::slab::SlabGuard;
use crate::proclet::{ProcletId, ProcletStatus};
use crate::rpc::wire::{archive_decode, archive_encode};
use crate::runtime::RuntimeContext;
use registry::{MethodId, invoke_method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, trace};

/// Runs `method` against `target` with args `A`, returning `R`. Takes the
/// fast path (direct call under a migration guard) when `target` is
/// resident here and not paused for migration; otherwise falls to the slow
/// path (serialize, dispatch over RPC, the client manager's own
/// wrong-client retry).
pub async fn run<A, R>(
    ctx: &Arc<RuntimeContext>,
    target: ProcletId,
    method: MethodId,
    args: A,
) -> NuResult<R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    if let Some(bytes) = try_fast_path(ctx, target, method, &args)? {
        return archive_decode(&bytes);
    }
    debug!(%target, "invocation taking the slow (RPC) path");
    let arg_bytes = archive_encode(&args)?;
    let result_bytes = ctx
        .rpc
        .proclet_call(target, method.0, ctx.self_ip, arg_bytes)
        .await?;
    archive_decode(&result_bytes)
}

/// Attempts the fast local path. Returns `Ok(None)` (not `Err`) when the
/// proclet isn't resident, isn't `Present`, or a migration guard can't be
/// acquired — all three mean "take the slow path", not failure. Returns
/// `Err` only for a genuine failure inside the call itself.
fn try_fast_path<A: Serialize>(
    ctx: &Arc<RuntimeContext>,
    target: ProcletId,
    method: MethodId,
    args: &A,
) -> NuResult<Option<Vec<u8>>> {
    let Some(entry) = ctx.registry.get(target) else {
        return Ok(None);
    };
    if entry.header.status() != ProcletStatus::Present {
        return Ok(None);
    }
    let Some(guard) = entry.try_acquire_guard() else {
        return Ok(None);
    };
    // Args cross the slab boundary by copy (archive-encode into owned
    // bytes) even on the fast path: the caller's stack may belong to a
    // different proclet's slab than the callee's.
    let _slab = SlabGuard::enter(&entry.header.slab);
    let arg_bytes = archive_encode(args)?;
    let Some(arg_token) = entry.header.slab.allocate(arg_bytes.len()) else {
        return Err(NuError::OutOfMemory(target));
    };
    let result = {
        let mut obj = entry.object.lock();
        invoke_method(method, obj.as_mut(), &arg_bytes)
    };
    entry.header.slab.free(arg_token);
    entry.header.record_local_call();
    // Guard drops here, after the call body and before the caller resumes —
    // the "caller-resumed" state of the machine never overlaps a pause.
    drop(guard);
    trace!(%target, "fast path invocation");
    Ok(Some(result?))
}

/// Schedules `method` against `target` and returns a future immediately
/// rather than blocking the calling task on the round trip. The work itself
/// still goes through [`run`] (fast or slow path, whichever applies); the
/// only difference observable to the caller is that the call proceeds on a
/// spawned task.
pub fn run_async<A, R>(
    ctx: Arc<RuntimeContext>,
    target: ProcletId,
    method: MethodId,
    args: A,
) -> NuFuture<R>
where
    A: Serialize + Send + 'static,
    R: DeserializeOwned + Send + 'static,
{
    let (promise, future) = NuFuture::pair();
    tokio::spawn(async move {
        let result = run::<A, R>(&ctx, target, method, args).await;
        fulfill(promise, result);
    });
    future
}

fn fulfill<R>(promise: Promise<R>, result: NuResult<R>) {
    promise.fulfill(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::controller::ControllerClient;
    use crate::proclet::{ProcletEntry, ProcletHeader};
    use registry::{CtorId, construct, register_constructor, register_method};
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Counter(i64);

    fn test_ctx() -> Arc<RuntimeContext> {
        let controller = Arc::new(ControllerClient::new("127.0.0.1:19000".parse().unwrap()));
        RuntimeContext::new(Config::default(), "127.0.0.1:19100".parse().unwrap(), controller)
    }

    #[tokio::test]
    async fn fast_path_invokes_resident_proclet_directly() {
        const CTOR: CtorId = CtorId(42001);
        const ADD: MethodId = MethodId(42002);
        register_constructor::<Counter, i64, _>(CTOR, Counter);
        register_method::<Counter, i64, i64, _>(ADD, |c, delta| {
            c.0 += delta;
            Ok(c.0)
        });

        let ctx = test_ctx();
        let id = ProcletId(7);
        let args = archive_encode(&10i64).unwrap();
        let obj = construct(CTOR, &args).unwrap();
        let header = Arc::new(ProcletHeader::new(4096, ctx.self_ip, false));
        ctx.registry.insert(id, Arc::new(ProcletEntry::new(header, obj, CTOR)));

        let result: i64 = run(&ctx, id, ADD, 5i64).await.unwrap();
        assert_eq!(result, 15);
    }

    #[tokio::test]
    async fn run_async_resolves_through_the_future() {
        const CTOR: CtorId = CtorId(42101);
        const GET: MethodId = MethodId(42102);
        register_constructor::<Counter, i64, _>(CTOR, Counter);
        register_method::<Counter, (), i64, _>(GET, |c, ()| Ok(c.0));

        let ctx = test_ctx();
        let id = ProcletId(8);
        let args = archive_encode(&99i64).unwrap();
        let obj = construct(CTOR, &args).unwrap();
        let header = Arc::new(ProcletHeader::new(4096, ctx.self_ip, false));
        ctx.registry.insert(id, Arc::new(ProcletEntry::new(header, obj, CTOR)));

        let fut = run_async::<(), i64>(Arc::clone(&ctx), id, GET, ());
        assert_eq!(fut.await.unwrap(), 99);
    }
}
