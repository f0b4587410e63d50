// src/controller/mod.rs

//! The controller protocol: request/response pairs for `allocate_proclet`,
//! `resolve_proclet`, `acquire_migration_dest`, `update_location`, and
//! `destroy_proclet` (spec §4.2/§6), plus node registration so the
//! controller can track per-node free memory/core counters.

pub mod client;
pub mod service;

pub use client::ControllerClient;
pub use service::{Controller, NodeCapacity};

use crate::proclet::{NodeIp, ProcletId};
use serde::{Deserialize, Serialize};

/// An opaque capability returned by `acquire_migration_dest`. Must be
/// handed back to `release_migration_dest` if the migration it was reserved
/// for never ships, so the controller's capacity accounting stays correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationGuardToken(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControllerRequest {
    RegisterNode {
        ip: NodeIp,
        capacity_bytes: usize,
        cores: usize,
    },
    AllocateProclet {
        capacity_bytes: usize,
        ip_hint: Option<NodeIp>,
    },
    ResolveProclet {
        id: ProcletId,
    },
    AcquireMigrationDest {
        pinned: bool,
        resource_demand_bytes: usize,
        exclude: Option<NodeIp>,
    },
    ReleaseMigrationDest {
        guard: MigrationGuardToken,
    },
    UpdateLocation {
        id: ProcletId,
        new_ip: NodeIp,
    },
    DestroyProclet {
        id: ProcletId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControllerResponse {
    Allocated {
        id: ProcletId,
        home_ip: NodeIp,
    },
    Resolved {
        ip: NodeIp,
    },
    MigrationDest {
        guard: MigrationGuardToken,
        ip: NodeIp,
    },
    Ack,
    Error(ControllerErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerErrorKind {
    OutOfCapacity,
    NoDestination,
    DestroyedTarget,
    Pinned,
}
