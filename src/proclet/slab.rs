// src/proclet/slab.rs

//! The per-proclet slab allocator and the "current slab" scope guard.
//!
//! Each proclet owns a slab parameterized by a byte capacity. A real
//! deployment carves this out of the proclet's reserved virtual-address
//! slot; here the slab tracks a byte budget that every construct call and
//! argument copy debits against, which preserves the observable contract
//! (`allocate` returns null on exhaustion, never aborts) without requiring
//! unsafe raw memory management. See DESIGN.md.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A token representing one outstanding allocation from a [`Slab`]. Dropping
/// it without calling [`Slab::free`] leaks the reservation, mirroring a
/// real bump/free-list allocator where a caller that forgets to free simply
/// never gets that space back until the proclet is destroyed.
#[derive(Debug)]
pub struct SlabToken {
    size: usize,
}

/// A bump allocator restricted to one proclet's (or the per-runtime) byte
/// budget. `allocate`/`free` are the only two operations; there is no
/// realloc, matching the "copy across the slab boundary" invocation model.
#[derive(Debug)]
pub struct Slab {
    capacity: usize,
    used: AtomicUsize,
}

impl Slab {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Reserves `n` bytes from the slab. Returns `None` (the "null" of the
    /// spec) when the slab is exhausted; never panics.
    pub fn allocate(&self, n: usize) -> Option<SlabToken> {
        loop {
            let cur = self.used.load(Ordering::Acquire);
            let next = cur.checked_add(n)?;
            if next > self.capacity {
                return None;
            }
            if self
                .used
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(SlabToken { size: n });
            }
        }
    }

    pub fn free(&self, token: SlabToken) {
        self.used.fetch_sub(token.size, Ordering::AcqRel);
    }

    /// Probes allocability by attempting an allocation of size `n` and
    /// freeing it immediately. Used by the distributed mempool to decide
    /// whether a "full" shard can again satisfy a demanded size.
    pub fn has_space_for(&self, n: usize) -> bool {
        match self.allocate(n) {
            Some(tok) => {
                self.free(tok);
                true
            }
            None => false,
        }
    }
}

thread_local! {
    /// The slab installed for the duration of a call executing "inside" a
    /// proclet. `None` means allocations should come from the per-runtime
    /// slab instead.
    static CURRENT_SLAB_CAPACITY: Cell<Option<usize>> = const { Cell::new(None) };
}

/// A scoped guard installing a slab as the "current slab" for its lifetime,
/// restoring the prior one on drop. Mirrors the teacher's `ConnectionGuard`
/// RAII idiom: whichever slab was current when the call entered is restored
/// no matter how the call exits (return, early error, or panic unwind).
pub struct SlabGuard {
    previous: Option<usize>,
}

impl SlabGuard {
    /// Installs `slab` as current for as long as the guard lives.
    pub fn enter(slab: &Slab) -> Self {
        let previous = CURRENT_SLAB_CAPACITY.with(|c| c.replace(Some(slab.capacity())));
        Self { previous }
    }
}

impl Drop for SlabGuard {
    fn drop(&mut self) {
        CURRENT_SLAB_CAPACITY.with(|c| c.set(self.previous));
    }
}

/// Whether the calling thread currently has a proclet slab installed, i.e.
/// whether it is executing "inside" a proclet right now.
pub fn is_inside_proclet() -> bool {
    CURRENT_SLAB_CAPACITY.with(|c| c.get().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_exhausts_and_frees() {
        let slab = Slab::new(16);
        let a = slab.allocate(10).expect("fits");
        assert!(slab.allocate(10).is_none(), "exhausted, should be null");
        slab.free(a);
        assert!(slab.allocate(10).is_some(), "space reclaimed after free");
    }

    #[test]
    fn has_space_for_does_not_leak_the_probe() {
        let slab = Slab::new(16);
        assert!(slab.has_space_for(16));
        assert_eq!(slab.used(), 0);
        assert!(!slab.has_space_for(17));
    }

    #[test]
    fn guard_restores_previous_slab_on_drop() {
        assert!(!is_inside_proclet());
        let outer = Slab::new(8);
        {
            let _g1 = SlabGuard::enter(&outer);
            assert!(is_inside_proclet());
            let inner = Slab::new(4);
            {
                let _g2 = SlabGuard::enter(&inner);
                assert!(is_inside_proclet());
            }
            assert!(is_inside_proclet());
        }
        assert!(!is_inside_proclet());
    }
}
