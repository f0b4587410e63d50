// src/proclet/header.rs

//! The proclet header: the metadata co-located with every proclet's arena.

use super::NodeIp;
use super::slab::Slab;
use crate::sync::ReadSkewedLock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Lifecycle state of a proclet, per spec §3. Transitions are driven by the
/// proclet server (construct/destroy) and the migrator (the three
/// migrating/destroying states).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcletStatus {
    Absent,
    Present,
    MigratingOut,
    MigratingIn,
    Destroying,
}

/// Per-destination call counters, keyed by the remote node. Read by the
/// pressure handler and exposed for diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoteCallStats {
    pub count: u64,
    pub bytes: u64,
}

/// Metadata co-located at the base of each proclet's reserved region.
///
/// Everything here is accessed concurrently by: threads executing inside
/// the proclet (bump `local_call_cnt`, run under the RCU hooks), the
/// scheduler's cycle accounting (bumps `monitor_cycles` on every
/// cooperative switch), the migrator (flips `status`, drains
/// `pending_threads`), and the RPC server (bumps `ref_cnt`).
#[derive(Debug)]
pub struct ProcletHeader {
    pub status: Mutex<ProcletStatus>,
    pub ref_cnt: AtomicI64,
    pub slab: Slab,
    pub owner_ip: RwLock<NodeIp>,
    /// Guards `local_call_cnt`/`remote_call_map`; the "spin_lock guarding
    /// internal metrics" of the spec. `parking_lot::Mutex` is the idiomatic
    /// stand-in for a userspace spinlock here: uncontended locks never
    /// park a thread.
    metrics: Mutex<Metrics>,
    /// Threads (by task id) scheduled against, or currently running inside,
    /// this proclet. The migrator drains this set during quiesce.
    pub pending_threads: Mutex<std::collections::HashSet<u64>>,
    pub monitor_cycles: AtomicU64,
    pub pinned: AtomicBool,
    /// Read-skewed lock draining readers before migration (§4.9); also the
    /// lock a proclet's own hash-map-backed state would be built on.
    pub rcu: ReadSkewedLock,
}

#[derive(Debug, Default)]
struct Metrics {
    local_call_cnt: u64,
    remote_call_map: HashMap<NodeIp, RemoteCallStats>,
}

impl ProcletHeader {
    pub fn new(capacity_bytes: usize, owner_ip: NodeIp, pinned: bool) -> Self {
        Self {
            status: Mutex::new(ProcletStatus::Present),
            ref_cnt: AtomicI64::new(1),
            slab: Slab::new(capacity_bytes),
            owner_ip: RwLock::new(owner_ip),
            metrics: Mutex::new(Metrics::default()),
            pending_threads: Mutex::new(std::collections::HashSet::new()),
            monitor_cycles: AtomicU64::new(0),
            pinned: AtomicBool::new(pinned),
            rcu: ReadSkewedLock::new(),
        }
    }

    pub fn status(&self) -> ProcletStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, s: ProcletStatus) {
        *self.status.lock() = s;
    }

    pub fn owner_ip(&self) -> NodeIp {
        *self.owner_ip.read().unwrap()
    }

    pub fn set_owner_ip(&self, ip: NodeIp) {
        *self.owner_ip.write().unwrap() = ip;
    }

    /// Invariant #2: reachable strong handles keep `ref_cnt >= 1`. Returns
    /// the post-increment value.
    pub fn incr_ref(&self) -> i64 {
        self.ref_cnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the post-decrement value; the caller destroys the proclet
    /// when this reaches 0.
    pub fn decr_ref(&self) -> i64 {
        self.ref_cnt.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn ref_count(&self) -> i64 {
        self.ref_cnt.load(Ordering::Acquire)
    }

    pub fn record_local_call(&self) {
        self.metrics.lock().local_call_cnt += 1;
    }

    pub fn record_remote_call(&self, from: NodeIp, bytes: u64) {
        let mut m = self.metrics.lock();
        let entry = m.remote_call_map.entry(from).or_default();
        entry.count += 1;
        entry.bytes += bytes;
    }

    pub fn local_call_cnt(&self) -> u64 {
        self.metrics.lock().local_call_cnt
    }

    pub fn remote_call_snapshot(&self) -> HashMap<NodeIp, RemoteCallStats> {
        self.metrics.lock().remote_call_map.clone()
    }

    /// Adds to the per-proclet cycle counter; called by the scheduler on
    /// every cooperative switch away from a thread owned by this proclet.
    pub fn add_monitor_cycles(&self, cycles: u64) {
        self.monitor_cycles.fetch_add(cycles, Ordering::Relaxed);
    }

    pub fn monitor_cycles(&self) -> u64 {
        self.monitor_cycles.load(Ordering::Relaxed)
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    pub fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::Release);
    }
}
