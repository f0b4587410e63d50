// src/rpc/server.rs

//! The proclet server: dispatches incoming RPCs against this node's
//! resident proclets (spec §4.3's counterpart on the receiving end).

use super::wire::{self, FrameKind, StatusCode};
use super::{CallbackDelivery, ConstructRequest, DestroyRequest, ProcletCallRequest, RefcountDeltaRequest};
use crate::invocation::registry as method_registry;
use crate::migration;
use crate::proclet::{ProcletEntry, ProcletHeader, ProcletStatus};
use crate::runtime::RuntimeContext;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

pub struct ProcletServer;

async fn handle_connection(stream: TcpStream, ctx: Arc<RuntimeContext>) {
    let mut conn = wire::from_accepted(stream);
    loop {
        let (kind, raw) = match wire::read_request_raw(&mut conn).await {
            Ok(v) => v,
            Err(_) => return,
        };
        let (status, reply): (StatusCode, Vec<u8>) = match kind {
            FrameKind::ProcletCall => handle_proclet_call(&ctx, &raw).await,
            FrameKind::Construct => handle_construct(&ctx, &raw),
            FrameKind::Destroy => handle_destroy(&ctx, &raw).await,
            FrameKind::RefcountDelta => handle_refcount_delta(&ctx, &raw),
            FrameKind::MigrationStream => migration::handle_incoming_stream(&ctx, &raw).await,
            FrameKind::RegisterCallback => handle_callback_delivery(&ctx, &raw),
        };
        if wire::write_reply(&mut conn, status, &reply).await.is_err() {
            return;
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, (StatusCode, Vec<u8>)> {
    wire::archive_decode(bytes).map_err(|e| (StatusCode::Exception, e.to_string().into_bytes()))
}

async fn handle_proclet_call(ctx: &Arc<RuntimeContext>, bytes: &[u8]) -> (StatusCode, Vec<u8>) {
    let req: ProcletCallRequest = match decode(bytes) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(entry) = ctx.registry.get(req.target) else {
        return (StatusCode::WrongClient, Vec::new());
    };
    match entry.header.status() {
        ProcletStatus::Present => {}
        ProcletStatus::MigratingOut | ProcletStatus::MigratingIn => {
            // Held at the old home until quiesce completes is the caller's
            // job (it retries); from the server's perspective this node no
            // longer authoritatively owns the proclet for new calls.
            return (StatusCode::WrongClient, Vec::new());
        }
        ProcletStatus::Destroying | ProcletStatus::Absent => {
            return (StatusCode::Destroyed, Vec::new());
        }
    }
    let Some(_guard) = entry.try_acquire_guard() else {
        return (StatusCode::WrongClient, Vec::new());
    };
    let _slab_guard = crate::proclet::slab::SlabGuard::enter(&entry.header.slab);
    let Some(arg_token) = entry.header.slab.allocate(req.args.len()) else {
        return (StatusCode::OutOfMemory, Vec::new());
    };
    let result = {
        let mut obj = entry.object.lock();
        method_registry::invoke_method(
            method_registry::MethodId(req.method),
            obj.as_mut(),
            &req.args,
        )
    };
    entry.header.slab.free(arg_token);
    entry.header.record_local_call();
    entry
        .header
        .record_remote_call(req.caller_ip, req.args.len() as u64);
    match result {
        Ok(bytes) => (StatusCode::Ok, bytes),
        Err(e) => (StatusCode::Exception, e.to_string().into_bytes()),
    }
}

fn handle_construct(ctx: &Arc<RuntimeContext>, bytes: &[u8]) -> (StatusCode, Vec<u8>) {
    let req: ConstructRequest = match decode(bytes) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let header = Arc::new(ProcletHeader::new(req.capacity_bytes, ctx.self_ip, req.pinned));
    if header.slab.allocate(req.args.len()).is_none() {
        return (StatusCode::OutOfMemory, Vec::new());
    }
    let object = match method_registry::construct(method_registry::CtorId(req.ctor), &req.args) {
        Ok(obj) => obj,
        Err(_) => return (StatusCode::OutOfMemory, Vec::new()),
    };
    let entry = Arc::new(ProcletEntry::new(header, object, method_registry::CtorId(req.ctor)));
    ctx.registry.insert(req.id, entry);
    debug!(%req.id, "constructed proclet");
    (StatusCode::Ok, Vec::new())
}

async fn handle_destroy(ctx: &Arc<RuntimeContext>, bytes: &[u8]) -> (StatusCode, Vec<u8>) {
    let req: DestroyRequest = match decode(bytes) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(entry) = ctx.registry.remove(req.id) {
        entry.header.set_status(ProcletStatus::Absent);
    }
    if let Err(e) = ctx.controller.destroy_proclet(req.id).await {
        warn!(%req.id, "failed to notify controller of destroy: {e}");
    }
    (StatusCode::Ok, Vec::new())
}

fn handle_refcount_delta(ctx: &Arc<RuntimeContext>, bytes: &[u8]) -> (StatusCode, Vec<u8>) {
    let req: RefcountDeltaRequest = match decode(bytes) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(entry) = ctx.registry.get(req.id) else {
        return (StatusCode::WrongClient, Vec::new());
    };
    let new_count = if req.delta >= 0 {
        (0..req.delta).for_each(|_| {
            entry.header.incr_ref();
        });
        entry.header.ref_count()
    } else {
        (0..req.delta.abs()).for_each(|_| {
            entry.header.decr_ref();
        });
        entry.header.ref_count()
    };
    if new_count <= 0 {
        entry.header.set_status(ProcletStatus::Destroying);
        ctx.registry.remove(req.id);
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            if let Err(e) = ctx.controller.destroy_proclet(req.id).await {
                error!(%req.id, "failed to notify controller of destroy-by-refcount: {e}");
            }
        });
    }
    (StatusCode::Ok, Vec::new())
}

fn handle_callback_delivery(ctx: &Arc<RuntimeContext>, bytes: &[u8]) -> (StatusCode, Vec<u8>) {
    let delivery: CallbackDelivery = match decode(bytes) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let result = if delivery.is_exception {
        Err(crate::error::NuError::ClosureException(
            String::from_utf8_lossy(&delivery.payload).into_owned(),
        ))
    } else {
        Ok(delivery.payload)
    };
    ctx.fulfill_callback(delivery.callback_id, result);
    (StatusCode::Ok, Vec::new())
}

/// Runs the proclet server's accept loop until `shutdown` fires. One task
/// per connection, looping over request/reply frames.
pub async fn run(listener: TcpListener, ctx: Arc<RuntimeContext>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "proclet server accepted connection");
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(handle_connection(stream, ctx));
                    }
                    Err(e) => warn!("proclet server accept error: {e}"),
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}
