// src/sync/rcu.rs

//! `ReadSkewedLock<T>`: a read-skewed RCU-style lock. Readers almost never
//! block; a writer sets a barrier, waits for in-flight readers to drain,
//! performs the update, then clears the barrier. Grounded on
//! `original_source/inc/nu/utils/read_skewed_lock.hpp`.

use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

/// Fast-path spin budget before a blocked reader falls back to the
/// mutex+condvar wait, matching the original's `kReaderWaitFastPathMaxUs`.
const READER_SPIN_ITERS: u32 = 200;

/// Maximum nesting depth for recursive reader holds on one thread.
const MAX_NESTED_READS: u8 = 16;

thread_local! {
    static NESTED_READS: Cell<u8> = const { Cell::new(0) };
}

struct LockState {
    readers: AtomicIsize,
    writer_barrier: AtomicBool,
    writer_mutex: Mutex<()>,
    backoff: Condvar,
}

/// A read-skewed lock guarding a `T`. Readers call [`ReadSkewedLock::read`]
/// and get a guard cheaply as long as no writer barrier is up; writers call
/// [`ReadSkewedLock::write`] and run a closure with exclusive access once
/// all readers have drained.
pub struct ReadSkewedLock<T = ()> {
    data: std::cell::UnsafeCell<T>,
    state: LockState,
}

unsafe impl<T: Send> Send for ReadSkewedLock<T> {}
unsafe impl<T: Send> Sync for ReadSkewedLock<T> {}

impl ReadSkewedLock<()> {
    /// A bare lock with no guarded payload, used where the header only
    /// needs the synchronization (draining readers before migration) and
    /// the actual data lives elsewhere.
    pub fn new() -> Self {
        ReadSkewedLock::with_data(())
    }
}

impl Default for ReadSkewedLock<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReadSkewedLock<T> {
    pub fn with_data(data: T) -> Self {
        Self {
            data: std::cell::UnsafeCell::new(data),
            state: LockState {
                readers: AtomicIsize::new(0),
                writer_barrier: AtomicBool::new(false),
                writer_mutex: Mutex::new(()),
                backoff: Condvar::new(),
            },
        }
    }

    /// Acquires a reader hold. Nested holds on the same thread are counted
    /// (up to [`MAX_NESTED_READS`]) and do not re-enter the slow path.
    pub fn read(&self) -> ReadGuard<'_, T> {
        let nested = NESTED_READS.with(|c| {
            let v = c.get();
            if v > 0 {
                assert!(v < MAX_NESTED_READS, "rcu reader hold nested too deeply");
                c.set(v + 1);
            }
            v
        });
        if nested == 0 {
            self.reader_lock_slow();
            NESTED_READS.with(|c| c.set(1));
        }
        ReadGuard { lock: self }
    }

    fn reader_lock_slow(&self) {
        loop {
            if !self.state.writer_barrier.load(Ordering::Acquire) {
                self.state.readers.fetch_add(1, Ordering::AcqRel);
                if !self.state.writer_barrier.load(Ordering::Acquire) {
                    return;
                }
                self.state.readers.fetch_sub(1, Ordering::AcqRel);
            }
            let mut spun = false;
            for _ in 0..READER_SPIN_ITERS {
                if !self.state.writer_barrier.load(Ordering::Acquire) {
                    spun = true;
                    break;
                }
                std::hint::spin_loop();
            }
            if spun {
                continue;
            }
            // Fast path exhausted: fall back to a mutex+condvar wait for the
            // writer barrier to clear.
            let mut guard = self.state.writer_mutex.lock();
            while self.state.writer_barrier.load(Ordering::Acquire) {
                self.state.backoff.wait(&mut guard);
            }
        }
    }

    fn reader_unlock(&self) {
        let remaining = NESTED_READS.with(|c| {
            let v = c.get().saturating_sub(1);
            c.set(v);
            v
        });
        if remaining == 0 {
            self.state.readers.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Sets the writer barrier, waits for in-flight readers to drain, runs
    /// `f` with exclusive access, then clears the barrier and wakes any
    /// readers parked on the fallback condvar.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _serialize = self.state.writer_mutex.lock();
        self.state.writer_barrier.store(true, Ordering::Release);
        while self.state.readers.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
        let result = unsafe { f(&mut *self.data.get()) };
        self.state.writer_barrier.store(false, Ordering::Release);
        self.state.backoff.notify_all();
        result
    }

    /// True while a writer has the barrier up; readers use this to decide
    /// whether to back off before even trying the fast path.
    pub fn writer_barrier_is_set(&self) -> bool {
        self.state.writer_barrier.load(Ordering::Acquire)
    }
}

/// A reader guard. While held, the pointee must not be mutated — enforced
/// by only exposing `Deref`, never `DerefMut`.
pub struct ReadGuard<'a, T> {
    lock: &'a ReadSkewedLock<T>,
}

impl<T> std::ops::Deref for ReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.reader_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn writer_sees_exclusive_access() {
        let lock = Arc::new(ReadSkewedLock::with_data(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        lock.write(|v| *v += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 1600);
    }

    #[test]
    fn readers_never_observe_a_partial_write() {
        let lock = Arc::new(ReadSkewedLock::with_data((0i64, 0i64)));
        let violations = Arc::new(AtomicUsize::new(0));
        let writer = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                for i in 0..500 {
                    lock.write(|(a, b)| {
                        *a = i;
                        *b = i;
                    });
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let violations = Arc::clone(&violations);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let guard = lock.read();
                        if guard.0 != guard.1 {
                            violations.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(violations.load(Ordering::Relaxed), 0);
    }
}
