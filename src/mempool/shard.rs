// src/mempool/shard.rs

//! A capacity-tracking shard: the distributed mem pool's unit of "a heap
//! with room" (spec §4.7). Leases a cluster-wide id + home node from the
//! controller so shard accounting is authoritative the same way proclet
//! placement is, then tracks its own byte budget locally with the same
//! compare-exchange loop [`crate::proclet::slab::Slab`] uses for a single
//! proclet's arena.

use crate::proclet::ProcletId;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct Shard {
    pub id: ProcletId,
    capacity: usize,
    used: AtomicUsize,
}

impl Shard {
    pub fn new(id: ProcletId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            used: AtomicUsize::new(0),
        }
    }

    /// Reserves `n` bytes from the shard's budget. Returns `false` (never
    /// panics) when doing so would exceed capacity — the "null" of
    /// spec §4.1 applied to a shard instead of a single proclet's slab.
    pub fn try_reserve(&self, n: usize) -> bool {
        loop {
            let cur = self.used.load(Ordering::Acquire);
            let next = match cur.checked_add(n) {
                Some(v) if v <= self.capacity => v,
                _ => return false,
            };
            if self
                .used
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn credit(&self, n: usize) {
        self.used.fetch_sub(n.min(self.used.load(Ordering::Acquire)), Ordering::AcqRel);
    }

    /// Probes allocability without retaining the reservation — used by the
    /// mem pool's background prober to decide whether a "full" shard can
    /// again satisfy a demanded size.
    pub fn has_space_for(&self, n: usize) -> bool {
        if self.try_reserve(n) {
            self.credit(n);
            true
        } else {
            false
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_respects_capacity_and_credit_reclaims_it() {
        let shard = Shard::new(ProcletId(1), 100);
        assert!(shard.try_reserve(60));
        assert!(!shard.try_reserve(60));
        shard.credit(60);
        assert!(shard.try_reserve(60));
    }

    #[test]
    fn has_space_for_does_not_retain_the_probe() {
        let shard = Shard::new(ProcletId(1), 10);
        assert!(shard.has_space_for(10));
        assert_eq!(shard.used(), 0);
    }
}
