// src/scheduler/mod.rs

//! The cooperative scheduler (spec §4.8): one [`KThread`] per OS thread,
//! FIFO run queues with an overflow list, a deprioritized list for RCU
//! writer-sync, and a migrating-threads side list the migrator drains.

mod kthread;
mod task;

pub use kthread::KThread;
pub use task::{ScheduledTask, TaskBody};

use crate::proclet::{ProcletId, ProcletRegistry};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Owns every kthread on this node and hands out task ids / kthread
/// assignment. `num_kthreads` mirrors [`crate::config::Config::num_kthreads`].
pub struct Scheduler {
    kthreads: Vec<Arc<KThread>>,
    next_task_id: AtomicU64,
    round_robin: AtomicU64,
}

impl Scheduler {
    pub fn new(num_kthreads: usize) -> Self {
        let num_kthreads = num_kthreads.max(1);
        let kthreads = (0..num_kthreads).map(KThread::new).collect();
        info!(num_kthreads, "scheduler initialized");
        Self {
            kthreads,
            next_task_id: AtomicU64::new(1),
            round_robin: AtomicU64::new(0),
        }
    }

    pub fn num_kthreads(&self) -> usize {
        self.kthreads.len()
    }

    fn pick_kthread(&self) -> &Arc<KThread> {
        let i = self.round_robin.fetch_add(1, Ordering::Relaxed) as usize % self.kthreads.len();
        &self.kthreads[i]
    }

    /// Schedules `body` to run, attributed to `owner_proclet` for cycle
    /// accounting. Returns the assigned task id.
    pub fn spawn(&self, owner_proclet: Option<ProcletId>, body: TaskBody) -> u64 {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(ScheduledTask::new(id, owner_proclet, body));
        self.pick_kthread().enqueue(task);
        id
    }

    /// Runs every kthread's queue to exhaustion once. A production boot
    /// instead spawns one OS thread per kthread looping
    /// [`KThread::run_one`] (see `runtime::boot`); this synchronous drain
    /// is what tests and the in-process perf harness use.
    pub fn drain_once(&self, registry: &ProcletRegistry) {
        for kt in &self.kthreads {
            while kt.run_one(registry) {}
        }
    }

    /// Broadcasts a pause request for `target` to every kthread — step 2
    /// of the migrator's algorithm ("quiesce").
    pub fn request_pause(&self, target: ProcletId) {
        for kt in &self.kthreads {
            kt.request_pause(target);
        }
    }

    pub fn clear_pause(&self) {
        for kt in &self.kthreads {
            kt.clear_pause();
        }
    }

    /// Collects every task siphoned off for `target` across all kthreads,
    /// for the migrator's snapshot step.
    pub fn take_migrating(&self, target: ProcletId) -> Vec<Arc<ScheduledTask>> {
        self.kthreads
            .iter()
            .flat_map(|kt| kt.take_migrating(target))
            .collect()
    }

    /// Total queued-task depth across all kthreads, used by the CPU
    /// pressure signal.
    pub fn total_queued(&self) -> usize {
        self.kthreads.iter().map(|kt| kt.run_queue_len()).sum()
    }

    /// Pulls roughly half of a randomly chosen peer's queue onto
    /// `thief_index`'s. Returns the number of tasks moved.
    pub fn steal_for(&self, thief_index: usize) -> usize {
        if self.kthreads.len() < 2 {
            return 0;
        }
        let victim_index = {
            let mut rng = rand::thread_rng();
            loop {
                let i = rng.gen_range(0..self.kthreads.len());
                if i != thief_index {
                    break i;
                }
            }
        };
        let stolen = self.kthreads[victim_index].steal_half();
        let n = stolen.len();
        for t in stolen {
            self.kthreads[thief_index].enqueue(t);
        }
        n
    }

    pub fn request_prioritize(&self) {
        for kt in &self.kthreads {
            kt.request_prioritize();
        }
    }

    pub fn clear_prioritize(&self) {
        for kt in &self.kthreads {
            kt.clear_prioritize();
        }
    }

    pub fn request_shutdown(&self) {
        for kt in &self.kthreads {
            kt.request_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn spawn_round_robins_and_drains() {
        let sched = Scheduler::new(3);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..9 {
            let ran = Arc::clone(&ran);
            sched.spawn(None, Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        sched.drain_once(&ProcletRegistry::new());
        assert_eq!(ran.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn pause_and_take_migrating_round_trips_across_kthreads() {
        let sched = Scheduler::new(4);
        let target = ProcletId(55);
        for _ in 0..20 {
            sched.spawn(Some(target), Box::new(|| {}));
        }
        sched.request_pause(target);
        let taken = sched.take_migrating(target);
        assert_eq!(taken.len(), 20);
        sched.clear_pause();
    }
}
