// src/migration/mod.rs

//! The migration protocol (spec §4.5): pause → snapshot → ship → install →
//! commit → redirect. Grounded on the teacher's `EvictionManager` pattern
//! for the caller side (a long-lived task reacting to pressure, see
//! `pressure`) and on `rpc::wire`'s framed archive for the stream itself.

mod snapshot;

pub use snapshot::MigrationStream;

use crate::error::{NuError, NuResult};
use crate::proclet::{ProcletEntry, ProcletHeader, ProcletId, ProcletStatus};
use crate::runtime::RuntimeContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Drives one proclet's migration from this node to a destination reserved
/// through the controller. One `Migrator::migrate` call is steps 1–7 of
/// spec §4.5 end to end.
pub struct Migrator {
    ctx: Arc<RuntimeContext>,
}

impl Migrator {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }

    /// Migrates `target` off this node. `pinned` proclets and proclets
    /// with no reserved destination abort at step 1, returning
    /// `NuError::Pinned` / `NuError::NoDestination` respectively — neither
    /// is treated as a bug, both are normal "nothing to do" outcomes for
    /// the pressure handler's caller.
    pub async fn migrate(&self, target: ProcletId, resource_demand_bytes: usize) -> NuResult<()> {
        let Some(entry) = self.ctx.registry.get(target) else {
            return Err(NuError::DestroyedTarget(target));
        };
        if entry.header.is_pinned() {
            return Err(NuError::Pinned(target));
        }

        // 1. Select destination.
        let (guard_token, dest_ip) = match self
            .ctx
            .controller
            .acquire_migration_dest(false, resource_demand_bytes, Some(self.ctx.self_ip))
            .await
        {
            Ok(v) => v,
            Err(e) => {
                debug!(%target, "migration aborted, no destination: {e}");
                return Err(e);
            }
        };

        let result = self.run_migration(target, &entry, dest_ip).await;

        if result.is_err() {
            // Migration failed after reserving capacity: release the
            // reservation so it isn't leaked (spec §4.2: "the guard must
            // be released if migration aborts").
            if let Err(e) = self.ctx.controller.release_migration_dest(guard_token).await {
                warn!(%target, "failed to release migration-dest guard after abort: {e}");
            }
        }
        result
    }

    async fn run_migration(
        &self,
        target: ProcletId,
        entry: &Arc<ProcletEntry>,
        dest_ip: crate::proclet::NodeIp,
    ) -> NuResult<()> {
        // 2. Quiesce: broadcast pause, then wait for outstanding guards
        // (threads currently executing inside the proclet) to drain.
        entry.request_pause();
        entry.header.set_status(ProcletStatus::MigratingOut);
        self.ctx.scheduler.request_pause(target);
        self.wait_for_quiesce(entry).await;

        // 3. Snapshot: header metadata + object bytes via the codec
        // registry, plus whatever continuations the scheduler had queued
        // for this proclet.
        let stream = snapshot::capture(entry, target)?;
        let queued = self.ctx.scheduler.take_migrating(target);
        debug!(%target, queued = queued.len(), "captured snapshot, queued continuations dropped at source");

        // 4. Ship.
        let bytes = stream.encode()?;
        if let Err(e) = self.ctx.rpc.send_migration_stream(dest_ip, bytes).await {
            warn!(%target, "ship failed, restarting in place: {e}");
            entry.header.set_status(ProcletStatus::Present);
            entry.clear_pause();
            self.ctx.scheduler.clear_pause();
            return Err(e);
        }

        // 5 & 6 happen on the destination inside `handle_incoming_stream`,
        // which calls `controller.update_location` itself before replying.
        // 7. Redirect: remove locally so subsequent RPCs miss and fall to
        // re-resolution, which will now find the new home.
        self.ctx.registry.remove(target);
        info!(%target, %dest_ip, "migration committed");
        Ok(())
    }

    async fn wait_for_quiesce(&self, entry: &Arc<ProcletEntry>) {
        loop {
            if entry.outstanding_guards() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_micros(50)).await;
        }
    }
}

/// The destination side of step 5 ("install") and step 6 ("commit"),
/// invoked by the proclet server when a `migration-stream` frame arrives.
pub async fn handle_incoming_stream(ctx: &Arc<RuntimeContext>, bytes: &[u8]) -> (crate::rpc::wire::StatusCode, Vec<u8>) {
    use crate::rpc::wire::StatusCode;

    // `send_migration_stream` ships the already-encoded stream as a plain
    // `Vec<u8>` request body, which the frame layer archive-encodes again;
    // unwrap that outer layer before decoding the stream itself.
    let outer: Vec<u8> = match crate::rpc::wire::archive_decode(bytes) {
        Ok(v) => v,
        Err(e) => return (StatusCode::Exception, e.to_string().into_bytes()),
    };
    let stream: MigrationStream = match crate::rpc::wire::archive_decode(&outer) {
        Ok(v) => v,
        Err(e) => return (StatusCode::Exception, e.to_string().into_bytes()),
    };
    let target = stream.proclet_id;
    let object = match crate::invocation::registry::restore_object(stream.ctor, &stream.object_bytes) {
        Ok(v) => v,
        Err(e) => return (StatusCode::Exception, e.to_string().into_bytes()),
    };
    let header = Arc::new(ProcletHeader::new(stream.capacity_bytes, ctx.self_ip, stream.pinned));
    header.ref_cnt.store(stream.ref_count, std::sync::atomic::Ordering::Release);
    header.set_status(ProcletStatus::Present);
    let entry = Arc::new(ProcletEntry::new(header, object, stream.ctor));
    ctx.registry.insert(target, entry);

    if let Err(e) = ctx.controller.update_location(target, ctx.self_ip).await {
        warn!(%target, "failed to update location after install: {e}");
        return (StatusCode::Exception, e.to_string().into_bytes());
    }
    ctx.rpc.update_cache(target, ctx.self_ip);
    info!(%target, "proclet installed after migration");
    (StatusCode::Ok, Vec::new())
}
