// src/rpc/client_manager.rs

//! Caches `id -> ip` with invalidation and pools connections per
//! destination (spec §4.3). On a `wrong-client` reply the cache entry is
//! invalidated and the call retries after re-resolving via the controller.

use super::wire::{self, FrameKind, NuConn, StatusCode};
use crate::controller::ControllerClient;
use crate::error::{NuError, NuResult};
use crate::proclet::{NodeIp, ProcletId};
use crate::sync::RcuHashMap;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 4;

struct ConnectionPool {
    idle: AsyncMutex<Vec<NuConn>>,
}

impl ConnectionPool {
    fn new() -> Self {
        Self {
            idle: AsyncMutex::new(Vec::new()),
        }
    }
}

/// Caches the id->ip directory and pools TCP connections per destination.
/// Every node owns exactly one of these.
pub struct RpcClientManager {
    cache: RcuHashMap<ProcletId, NodeIp>,
    pools: DashMap<NodeIp, Arc<ConnectionPool>>,
    controller: Arc<ControllerClient>,
}

impl RpcClientManager {
    pub fn new(controller: Arc<ControllerClient>) -> Self {
        Self {
            cache: RcuHashMap::new(),
            pools: DashMap::new(),
            controller,
        }
    }

    /// Called after `allocate_proclet` and after receiving authoritative
    /// hints in replies.
    pub fn update_cache(&self, id: ProcletId, ip: NodeIp) {
        self.cache.insert(id, ip);
    }

    fn invalidate(&self, id: ProcletId) {
        self.cache.remove(&id);
    }

    /// Obtains the destination ip for `id`, consulting the controller on a
    /// cache miss.
    async fn resolve(&self, id: ProcletId) -> NuResult<NodeIp> {
        if let Some(ip) = self.cache.get(&id) {
            return Ok(ip);
        }
        let ip = self.controller.resolve_proclet(id).await?;
        self.update_cache(id, ip);
        Ok(ip)
    }

    fn pool_for(&self, ip: NodeIp) -> Arc<ConnectionPool> {
        Arc::clone(
            self.pools
                .entry(ip)
                .or_insert_with(|| Arc::new(ConnectionPool::new()))
                .value(),
        )
    }

    async fn checkout(&self, ip: NodeIp) -> NuResult<NuConn> {
        let pool = self.pool_for(ip);
        let mut idle = pool.idle.lock().await;
        if let Some(conn) = idle.pop() {
            return Ok(conn);
        }
        drop(idle);
        wire::connect(ip).await
    }

    async fn checkin(&self, ip: NodeIp, conn: NuConn) {
        let pool = self.pool_for(ip);
        pool.idle.lock().await.push(conn);
    }

    /// Sends one request frame and awaits one reply frame against `ip`,
    /// without any retry/cache logic — the primitive every higher-level
    /// send builds on.
    async fn send_once<Req, Resp>(
        &self,
        ip: NodeIp,
        kind: FrameKind,
        req: &Req,
    ) -> NuResult<(StatusCode, Resp)>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut conn = self.checkout(ip).await?;
        let result = async {
            wire::write_request(&mut conn, kind, req).await?;
            wire::read_reply::<Resp>(&mut conn).await
        }
        .await;
        match result {
            Ok(ok) => {
                self.checkin(ip, conn).await;
                Ok(ok)
            }
            Err(e) => Err(e),
        }
    }

    /// Dispatches a `proclet-call` frame, retrying internally on
    /// `wrong-client` until `MAX_RETRIES` is exhausted. The three
    /// non-retryable failure kinds (`out-of-memory`, `destroyed-target`,
    /// `closure-exception`) are surfaced to the caller.
    pub async fn proclet_call(
        &self,
        target: ProcletId,
        method: u64,
        caller_ip: NodeIp,
        args: Vec<u8>,
    ) -> NuResult<Vec<u8>> {
        let req = super::ProcletCallRequest {
            target,
            method,
            caller_ip,
            args,
        };
        for attempt in 0..MAX_RETRIES {
            let ip = self.resolve(target).await?;
            let (status, payload): (StatusCode, Vec<u8>) =
                self.send_once(ip, FrameKind::ProcletCall, &req).await?;
            match status {
                StatusCode::Ok => return Ok(payload),
                StatusCode::WrongClient => {
                    debug!(%target, attempt, "wrong-client, re-resolving");
                    self.invalidate(target);
                    continue;
                }
                StatusCode::OutOfMemory => return Err(NuError::OutOfMemory(target)),
                StatusCode::Destroyed => return Err(NuError::DestroyedTarget(target)),
                StatusCode::Exception => {
                    let msg = String::from_utf8_lossy(&payload).into_owned();
                    return Err(NuError::ClosureException(msg));
                }
            }
        }
        warn!(%target, "exhausted wrong-client retries");
        Err(NuError::DestroyedTarget(target))
    }

    pub async fn construct(&self, ip: NodeIp, req: &super::ConstructRequest) -> NuResult<()> {
        let (status, _payload): (StatusCode, Vec<u8>) =
            self.send_once(ip, FrameKind::Construct, req).await?;
        self.update_cache(req.id, ip);
        match status {
            StatusCode::Ok => Ok(()),
            StatusCode::OutOfMemory => Err(NuError::OutOfMemory(req.id)),
            _ => Err(NuError::Internal("unexpected construct reply".into())),
        }
    }

    pub async fn destroy(&self, id: ProcletId) -> NuResult<()> {
        let ip = self.resolve(id).await?;
        let req = super::DestroyRequest { id };
        let (_status, _payload): (StatusCode, Vec<u8>) =
            self.send_once(ip, FrameKind::Destroy, &req).await?;
        self.invalidate(id);
        Ok(())
    }

    /// Copies must be synchronous: the caller awaits this so the callee
    /// observes the increment before the old handle is usable again.
    pub async fn refcount_delta(&self, id: ProcletId, delta: i64) -> NuResult<()> {
        let ip = self.resolve(id).await?;
        let req = super::RefcountDeltaRequest { id, delta };
        let (_status, _payload): (StatusCode, Vec<u8>) =
            self.send_once(ip, FrameKind::RefcountDelta, &req).await?;
        Ok(())
    }

    pub async fn deliver_callback(
        &self,
        ip: NodeIp,
        delivery: super::CallbackDelivery,
    ) -> NuResult<()> {
        let (_status, _payload): (StatusCode, Vec<u8>) = self
            .send_once(ip, FrameKind::RegisterCallback, &delivery)
            .await?;
        Ok(())
    }

    pub async fn send_migration_stream(&self, ip: NodeIp, bytes: Vec<u8>) -> NuResult<()> {
        let (_status, _payload): (StatusCode, Vec<u8>) =
            self.send_once(ip, FrameKind::MigrationStream, &bytes).await?;
        Ok(())
    }
}
