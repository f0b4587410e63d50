// src/proclet/registry.rs

//! The per-node table of resident proclets, and the migration guard that
//! protects a proclet against concurrent migration while a call is inside it.

use super::{ProcletHeader, ProcletId, ProcletStatus};
use crate::invocation::registry::CtorId;
use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A resident proclet: its header plus the type-erased user object living
/// in its arena. The object is boxed behind `dyn Any + Send` rather than a
/// concrete generic parameter because the registry must hold proclets of
/// many different `T` side by side; handles downcast back to `T` at the
/// invocation boundary (see `invocation::run`).
pub struct ProcletEntry {
    pub header: Arc<ProcletHeader>,
    pub object: parking_lot::Mutex<Box<dyn Any + Send>>,
    /// The ctor this object was built from — the migrator's key into the
    /// snapshot/restore codec registry (`invocation::registry`).
    pub ctor: CtorId,
    /// Number of outstanding migration guards. While nonzero, the migrator
    /// cannot advance this proclet past quiesce; a pause request simply
    /// waits for the count to drop to zero (invariant #3).
    active_guards: AtomicUsize,
    /// Set by the migrator while a pause request targets this proclet;
    /// new guard acquisitions fail fast so they fall to the slow (RPC,
    /// re-resolve) path instead of racing the snapshot.
    pause_requested: std::sync::atomic::AtomicBool,
}

impl ProcletEntry {
    pub fn new(header: Arc<ProcletHeader>, object: Box<dyn Any + Send>, ctor: CtorId) -> Self {
        Self {
            header,
            object: parking_lot::Mutex::new(object),
            ctor,
            active_guards: AtomicUsize::new(0),
            pause_requested: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Invariant #3: a thread running inside a proclet holds an implicit
    /// ownership guard that prevents migration until it suspends or
    /// returns. Fails (returns `None`) if the proclet is not `Present` or a
    /// pause request is already in flight for it — the fast path in
    /// `invocation::run` treats that as "take the slow path instead".
    pub fn try_acquire_guard(self: &Arc<Self>) -> Option<MigrationGuard> {
        if self.header.status() != ProcletStatus::Present {
            return None;
        }
        if self.pause_requested.load(Ordering::Acquire) {
            return None;
        }
        self.active_guards.fetch_add(1, Ordering::AcqRel);
        // Re-check after incrementing: a pause request may have landed
        // between the check above and the increment.
        if self.pause_requested.load(Ordering::Acquire) {
            self.active_guards.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(MigrationGuard {
            entry: Arc::clone(self),
        })
    }

    pub fn outstanding_guards(&self) -> usize {
        self.active_guards.load(Ordering::Acquire)
    }

    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::Release);
    }

    pub fn clear_pause(&self) {
        self.pause_requested.store(false, Ordering::Release);
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::Acquire)
    }
}

/// A scoped acquisition on a proclet that prevents its migration for the
/// guard's lifetime. Dropping it is the "suspend or return" event the
/// migrator's quiesce step waits for.
pub struct MigrationGuard {
    entry: Arc<ProcletEntry>,
}

impl Drop for MigrationGuard {
    fn drop(&mut self) {
        self.entry.active_guards.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The per-node table of resident proclets. A node may host any number of
/// proclets; this is the destination of every `construct`/`destroy` RPC and
/// the source of every fast-path dispatch.
#[derive(Default)]
pub struct ProcletRegistry {
    entries: DashMap<ProcletId, Arc<ProcletEntry>>,
}

impl ProcletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: ProcletId, entry: Arc<ProcletEntry>) {
        self.entries.insert(id, entry);
    }

    pub fn get(&self, id: ProcletId) -> Option<Arc<ProcletEntry>> {
        self.entries.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, id: ProcletId) -> Option<Arc<ProcletEntry>> {
        self.entries.remove(&id).map(|(_, v)| v)
    }

    pub fn contains(&self, id: ProcletId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All resident ids, used by the pressure handler when ranking victims.
    pub fn ids(&self) -> Vec<ProcletId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proclet::ProcletHeader;

    fn entry() -> Arc<ProcletEntry> {
        let header = Arc::new(ProcletHeader::new(
            4096,
            "127.0.0.1:9100".parse().unwrap(),
            false,
        ));
        Arc::new(ProcletEntry::new(header, Box::new(0i32), CtorId(0)))
    }

    #[test]
    fn guard_blocks_pause_and_pause_blocks_guard() {
        let e = entry();
        let g1 = e.try_acquire_guard().expect("should acquire");
        assert_eq!(e.outstanding_guards(), 1);
        e.request_pause();
        assert!(
            e.try_acquire_guard().is_none(),
            "new guards must fail once paused"
        );
        drop(g1);
        assert_eq!(e.outstanding_guards(), 0);
        e.clear_pause();
        assert!(e.try_acquire_guard().is_some());
    }
}
