// src/proclet/mod.rs

//! Proclet identity, the address plan, and the per-node proclet registry.

mod header;
mod registry;
pub mod slab;

pub use header::{ProcletHeader, ProcletStatus, RemoteCallStats};
pub use registry::{ProcletEntry, ProcletRegistry};

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// The address of a node in the cluster. The core never resolves DNS; every
/// node is addressed by its listening socket address.
pub type NodeIp = SocketAddr;

/// A cluster-unique identifier for a proclet, derived from a power-of-two
/// slot in a reserved high virtual-address window.
///
/// A real deployment maps the same id to the same virtual base address on
/// every node so that raw pointers into a proclet's heap stay valid across
/// migrations. This crate cannot reserve literal process address space from
/// safe Rust, so `ProcletId` plays the role of "canonical base address": the
/// bijection the spec requires is realized by using the id as the sole key
/// into every node's `ProcletRegistry`, rather than as a literal pointer
/// value. See DESIGN.md, Open Question resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcletId(pub u64);

impl ProcletId {
    /// The reserved null id. Never allocated by [`AddressPlan`].
    pub const NULL: ProcletId = ProcletId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ProcletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proclet#{:#x}", self.0)
    }
}

/// Base of the reserved high virtual-address window proclet slots are carved
/// from. Chosen to sit well above any ordinary heap/stack mapping.
const ADDRESS_WINDOW_BASE: u64 = 0x7f00_0000_0000;

/// Hands out cluster-unique [`ProcletId`]s from the reserved address window.
/// Owned solely by the controller: it is the single logical authority for
/// the bijection between ids and (simulated) canonical addresses.
#[derive(Debug, Default)]
pub struct AddressPlan {
    next_slot: AtomicU64,
}

impl AddressPlan {
    pub fn new() -> Self {
        Self {
            next_slot: AtomicU64::new(1),
        }
    }

    /// Allocates the next free slot and returns its canonical id. Slot size
    /// is power-of-two; `capacity_kb` is rounded up to the next power of two
    /// number of slots it would occupy, matching the spec's "one power-of-
    /// two slot per proclet heap" address plan.
    pub fn allocate(&self) -> ProcletId {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        ProcletId(ADDRESS_WINDOW_BASE + slot * 0x1_0000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_nonzero() {
        let plan = AddressPlan::new();
        let a = plan.allocate();
        let b = plan.allocate();
        assert_ne!(a, b);
        assert!(!a.is_null());
        assert!(!b.is_null());
    }

    #[test]
    fn null_id_is_never_allocated() {
        let plan = AddressPlan::new();
        for _ in 0..100 {
            assert_ne!(plan.allocate(), ProcletId::NULL);
        }
    }
}
