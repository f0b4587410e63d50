// src/controller/service.rs

//! Server-side controller state and accept loop. The controller is the
//! single logical authority for id allocation, id->ip resolution, and
//! per-node capacity accounting (spec §4.2). It is off the data path once
//! clients have cached ids.

use super::{ControllerErrorKind, ControllerRequest, ControllerResponse, MigrationGuardToken};
use crate::proclet::{AddressPlan, NodeIp, ProcletId};
use crate::rpc::wire::{self, FrameKind};
use crate::sync::RcuHashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct NodeCapacity {
    pub free_bytes: usize,
    pub cores: usize,
}

struct DestroyedEntry {
    id: ProcletId,
    destroyed_at: Instant,
}

/// Central, in-memory authority: id allocation, id->ip directory, and
/// per-node capacity accounting. Not durable (spec Non-goals): a controller
/// restart loses all of this.
pub struct Controller {
    address_plan: AddressPlan,
    locations: RcuHashMap<ProcletId, NodeIp>,
    nodes: Mutex<std::collections::HashMap<NodeIp, NodeCapacity>>,
    migration_guards: Mutex<std::collections::HashMap<u64, (NodeIp, usize)>>,
    next_guard: AtomicU64,
    /// Destroyed ids become eligible for reuse after `id_reuse_delay`
    /// (Open Question #2 in spec §9 — resolved here: "yes, lazily, after a
    /// fixed configurable delay").
    destroyed: Mutex<VecDeque<DestroyedEntry>>,
    id_reuse_delay: Duration,
}

impl Controller {
    pub fn new(id_reuse_delay: Duration) -> Self {
        Self {
            address_plan: AddressPlan::new(),
            locations: RcuHashMap::new(),
            nodes: Mutex::new(std::collections::HashMap::new()),
            migration_guards: Mutex::new(std::collections::HashMap::new()),
            next_guard: AtomicU64::new(1),
            destroyed: Mutex::new(VecDeque::new()),
            id_reuse_delay,
        }
    }

    pub fn register_node(&self, ip: NodeIp, capacity_bytes: usize, cores: usize) {
        self.nodes
            .lock()
            .insert(ip, NodeCapacity { free_bytes: capacity_bytes, cores });
        info!(%ip, capacity_bytes, cores, "node registered with controller");
    }

    fn reclaim_expired_ids(&self) {
        let mut destroyed = self.destroyed.lock();
        let now = Instant::now();
        while let Some(front) = destroyed.front() {
            if now.duration_since(front.destroyed_at) >= self.id_reuse_delay {
                destroyed.pop_front();
            } else {
                break;
            }
        }
    }

    /// Picks a home node with enough free memory; `ip_hint`, when present
    /// and with capacity, is preferred.
    fn pick_home(&self, capacity_bytes: usize, ip_hint: Option<NodeIp>) -> Option<NodeIp> {
        let nodes = self.nodes.lock();
        if let Some(hint) = ip_hint
            && nodes
                .get(&hint)
                .is_some_and(|c| c.free_bytes >= capacity_bytes)
        {
            return Some(hint);
        }
        nodes
            .iter()
            .filter(|(_, c)| c.free_bytes >= capacity_bytes)
            .max_by_key(|(_, c)| c.free_bytes)
            .map(|(ip, _)| *ip)
    }

    pub fn allocate_proclet(
        &self,
        capacity_bytes: usize,
        ip_hint: Option<NodeIp>,
    ) -> Result<(ProcletId, NodeIp), ControllerErrorKind> {
        self.reclaim_expired_ids();
        let Some(home) = self.pick_home(capacity_bytes, ip_hint) else {
            return Err(ControllerErrorKind::OutOfCapacity);
        };
        let id = self.address_plan.allocate();
        self.locations.insert(id, home);
        if let Some(cap) = self.nodes.lock().get_mut(&home) {
            cap.free_bytes = cap.free_bytes.saturating_sub(capacity_bytes);
        }
        debug!(%id, %home, "allocated proclet");
        Ok((id, home))
    }

    pub fn resolve_proclet(&self, id: ProcletId) -> Result<NodeIp, ControllerErrorKind> {
        self.locations
            .get(&id)
            .ok_or(ControllerErrorKind::DestroyedTarget)
    }

    pub fn acquire_migration_dest(
        &self,
        pinned: bool,
        resource_demand_bytes: usize,
        exclude: Option<NodeIp>,
    ) -> Result<(MigrationGuardToken, NodeIp), ControllerErrorKind> {
        if pinned {
            return Err(ControllerErrorKind::Pinned);
        }
        let dest = {
            let nodes = self.nodes.lock();
            nodes
                .iter()
                .filter(|(ip, c)| {
                    Some(**ip) != exclude && c.free_bytes >= resource_demand_bytes
                })
                .max_by_key(|(_, c)| c.free_bytes)
                .map(|(ip, _)| *ip)
        };
        let Some(dest) = dest else {
            return Err(ControllerErrorKind::NoDestination);
        };
        if let Some(cap) = self.nodes.lock().get_mut(&dest) {
            cap.free_bytes = cap.free_bytes.saturating_sub(resource_demand_bytes);
        }
        let guard_id = self.next_guard.fetch_add(1, Ordering::Relaxed);
        self.migration_guards
            .lock()
            .insert(guard_id, (dest, resource_demand_bytes));
        Ok((MigrationGuardToken(guard_id), dest))
    }

    pub fn release_migration_dest(&self, guard: MigrationGuardToken) {
        if let Some((ip, bytes)) = self.migration_guards.lock().remove(&guard.0)
            && let Some(cap) = self.nodes.lock().get_mut(&ip)
        {
            cap.free_bytes += bytes;
        }
    }

    pub fn update_location(&self, id: ProcletId, new_ip: NodeIp) {
        self.locations.insert(id, new_ip);
        debug!(%id, %new_ip, "location updated");
    }

    pub fn destroy_proclet(&self, id: ProcletId) {
        self.locations.remove(&id);
        self.destroyed.lock().push_back(DestroyedEntry {
            id,
            destroyed_at: Instant::now(),
        });
        debug!(%id, "proclet destroyed, id scheduled for delayed reuse");
    }
}

async fn handle_connection(stream: TcpStream, controller: Arc<Controller>) {
    let mut conn = wire::from_accepted(stream);
    loop {
        let (_kind, req): (FrameKind, ControllerRequest) = match wire::read_request(&mut conn).await
        {
            Ok(v) => v,
            Err(_) => return,
        };
        let resp = dispatch(&controller, req);
        if wire::write_reply(&mut conn, crate::rpc::wire::StatusCode::Ok, &resp)
            .await
            .is_err()
        {
            return;
        }
    }
}

fn dispatch(controller: &Controller, req: ControllerRequest) -> ControllerResponse {
    match req {
        ControllerRequest::RegisterNode { ip, capacity_bytes, cores } => {
            controller.register_node(ip, capacity_bytes, cores);
            ControllerResponse::Ack
        }
        ControllerRequest::AllocateProclet { capacity_bytes, ip_hint } => {
            match controller.allocate_proclet(capacity_bytes, ip_hint) {
                Ok((id, home_ip)) => ControllerResponse::Allocated { id, home_ip },
                Err(e) => ControllerResponse::Error(e),
            }
        }
        ControllerRequest::ResolveProclet { id } => match controller.resolve_proclet(id) {
            Ok(ip) => ControllerResponse::Resolved { ip },
            Err(e) => ControllerResponse::Error(e),
        },
        ControllerRequest::AcquireMigrationDest { pinned, resource_demand_bytes, exclude } => {
            match controller.acquire_migration_dest(pinned, resource_demand_bytes, exclude) {
                Ok((guard, ip)) => ControllerResponse::MigrationDest { guard, ip },
                Err(e) => ControllerResponse::Error(e),
            }
        }
        ControllerRequest::ReleaseMigrationDest { guard } => {
            controller.release_migration_dest(guard);
            ControllerResponse::Ack
        }
        ControllerRequest::UpdateLocation { id, new_ip } => {
            controller.update_location(id, new_ip);
            ControllerResponse::Ack
        }
        ControllerRequest::DestroyProclet { id } => {
            controller.destroy_proclet(id);
            ControllerResponse::Ack
        }
    }
}

/// Runs the controller's accept loop until `shutdown` fires. Each
/// connection is served by one task looping over request/reply frames,
/// matching the teacher's per-connection task-per-client model.
pub async fn run(
    listener: TcpListener,
    controller: Arc<Controller>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "controller accepted connection");
                        let controller = Arc::clone(&controller);
                        tokio::spawn(handle_connection(stream, controller));
                    }
                    Err(e) => warn!("controller accept error: {e}"),
                }
            }
            _ = shutdown.recv() => {
                info!("controller shutting down");
                return;
            }
        }
    }
}
