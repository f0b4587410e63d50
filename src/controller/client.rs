// src/controller/client.rs

//! The client-side stub to the central controller (spec §4.2). Held behind
//! an internal mutex so concurrent `allocate`s on one node don't race each
//! other over the same connection, mirroring `core/cluster/client.rs`'s
//! single-connection request/response idiom.

use super::{ControllerErrorKind, ControllerRequest, ControllerResponse, MigrationGuardToken};
use crate::error::{NuError, NuResult};
use crate::proclet::{NodeIp, ProcletId};
use crate::rpc::wire::{self, FrameKind, NuConn};
use tokio::sync::Mutex;
use tracing::debug;

pub struct ControllerClient {
    addr: NodeIp,
    conn: Mutex<Option<NuConn>>,
}

impl ControllerClient {
    pub fn new(addr: NodeIp) -> Self {
        Self {
            addr,
            conn: Mutex::new(None),
        }
    }

    async fn call(&self, req: ControllerRequest) -> NuResult<ControllerResponse> {
        let mut guard = self.conn.lock().await;
        let mut last_err = None;
        for attempt in 0..2u32 {
            if guard.is_none() {
                *guard = Some(wire::connect(self.addr).await?);
            }
            let conn = guard.as_mut().unwrap();
            let roundtrip = async {
                wire::write_request(conn, FrameKind::ProcletCall, &req).await?;
                wire::read_reply::<ControllerResponse>(conn).await
            }
            .await;
            match roundtrip {
                Ok((_, resp)) => return Ok(resp),
                Err(e) => {
                    debug!("controller roundtrip failed ({e}), attempt {attempt}");
                    *guard = None;
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| NuError::Io("controller unreachable".into())))
    }

    pub async fn register_node(&self, ip: NodeIp, capacity_bytes: usize, cores: usize) -> NuResult<()> {
        self.call(ControllerRequest::RegisterNode { ip, capacity_bytes, cores })
            .await?;
        Ok(())
    }

    pub async fn allocate_proclet(
        &self,
        capacity_bytes: usize,
        ip_hint: Option<NodeIp>,
    ) -> NuResult<(ProcletId, NodeIp)> {
        match self
            .call(ControllerRequest::AllocateProclet { capacity_bytes, ip_hint })
            .await?
        {
            ControllerResponse::Allocated { id, home_ip } => Ok((id, home_ip)),
            ControllerResponse::Error(ControllerErrorKind::OutOfCapacity) => {
                Err(NuError::ControllerOutOfCapacity)
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn resolve_proclet(&self, id: ProcletId) -> NuResult<NodeIp> {
        match self.call(ControllerRequest::ResolveProclet { id }).await? {
            ControllerResponse::Resolved { ip } => Ok(ip),
            ControllerResponse::Error(ControllerErrorKind::DestroyedTarget) => {
                Err(NuError::DestroyedTarget(id))
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn acquire_migration_dest(
        &self,
        pinned: bool,
        resource_demand_bytes: usize,
        exclude: Option<NodeIp>,
    ) -> NuResult<(MigrationGuardToken, NodeIp)> {
        match self
            .call(ControllerRequest::AcquireMigrationDest {
                pinned,
                resource_demand_bytes,
                exclude,
            })
            .await?
        {
            ControllerResponse::MigrationDest { guard, ip } => Ok((guard, ip)),
            ControllerResponse::Error(ControllerErrorKind::NoDestination) => {
                Err(NuError::NoDestination)
            }
            ControllerResponse::Error(ControllerErrorKind::Pinned) => {
                Err(NuError::Internal("acquire_migration_dest called on pinned proclet".into()))
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn release_migration_dest(&self, guard: MigrationGuardToken) -> NuResult<()> {
        self.call(ControllerRequest::ReleaseMigrationDest { guard })
            .await?;
        Ok(())
    }

    pub async fn update_location(&self, id: ProcletId, new_ip: NodeIp) -> NuResult<()> {
        self.call(ControllerRequest::UpdateLocation { id, new_ip })
            .await?;
        Ok(())
    }

    pub async fn destroy_proclet(&self, id: ProcletId) -> NuResult<()> {
        self.call(ControllerRequest::DestroyProclet { id }).await?;
        Ok(())
    }
}

fn unexpected(resp: ControllerResponse) -> NuError {
    NuError::UnrecognizedReply(match resp {
        ControllerResponse::Error(_) => 255,
        _ => 254,
    })
}
