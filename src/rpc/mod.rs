// src/rpc/mod.rs

//! The data-plane wire protocol, the RPC client manager, and the proclet
//! server that dispatches incoming RPCs (spec §4.3, §6).

pub mod client_manager;
pub mod server;
pub mod wire;

pub use client_manager::RpcClientManager;
pub use server::ProcletServer;

use crate::proclet::{NodeIp, ProcletId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcletCallRequest {
    pub target: ProcletId,
    pub method: u64,
    pub caller_ip: NodeIp,
    pub args: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstructRequest {
    pub id: ProcletId,
    pub ctor: u64,
    pub capacity_bytes: usize,
    pub pinned: bool,
    pub args: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub id: ProcletId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefcountDeltaRequest {
    pub id: ProcletId,
    pub delta: i64,
}

/// Delivers a previously-registered async callback's result back to the
/// node that issued `run_async` (the "register-callback" frame kind of
/// spec §6 — see `invocation::registry` doc comment and `future` module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackDelivery {
    pub callback_id: u64,
    pub payload: Vec<u8>,
    pub is_exception: bool,
}
