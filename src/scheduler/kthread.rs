// src/scheduler/kthread.rs

//! One cooperative scheduler instance, one per OS thread ("kthread" in the
//! source's Caladan-derived vocabulary). Run queues are plain
//! `Mutex`-guarded `VecDeque`s rather than lock-free structures:
//! contention is low (one producer per enqueue call, one consumer — the
//! kthread's own loop, or an occasional thief).

use super::task::ScheduledTask;
use crate::proclet::{ProcletId, ProcletRegistry};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::trace;

/// Above this many queued tasks, new arrivals spill into the overflow list
/// instead of the head run queue.
const RUN_QUEUE_SOFT_CAP: usize = 256;

pub struct KThread {
    pub index: usize,
    run_queue: Mutex<VecDeque<Arc<ScheduledTask>>>,
    overflow: Mutex<VecDeque<Arc<ScheduledTask>>>,
    deprioritized: Mutex<VecDeque<Arc<ScheduledTask>>>,
    migrating: Mutex<Vec<Arc<ScheduledTask>>>,
    pause_target: Mutex<Option<ProcletId>>,
    prioritizing: AtomicBool,
    shutdown: AtomicBool,
}

impl KThread {
    pub fn new(index: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            run_queue: Mutex::new(VecDeque::new()),
            overflow: Mutex::new(VecDeque::new()),
            deprioritized: Mutex::new(VecDeque::new()),
            migrating: Mutex::new(Vec::new()),
            pause_target: Mutex::new(None),
            prioritizing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    /// FIFO enqueue, spilling to the overflow list once the run queue
    /// passes its soft cap.
    pub fn enqueue(&self, task: Arc<ScheduledTask>) {
        let mut q = self.run_queue.lock();
        if q.len() >= RUN_QUEUE_SOFT_CAP {
            self.overflow.lock().push_back(task);
        } else {
            q.push_back(task);
        }
    }

    /// Head-enqueue: used to wake a preemptor, or a thread whose monitored
    /// proclet just became runnable again, ahead of FIFO order.
    pub fn enqueue_front(&self, task: Arc<ScheduledTask>) {
        self.run_queue.lock().push_front(task);
    }

    pub fn run_queue_len(&self) -> usize {
        self.run_queue.lock().len() + self.overflow.lock().len()
    }

    /// Takes roughly half of this kthread's run queue for a work-stealing
    /// peer. Respects an in-flight pause/prioritize request: a thief must
    /// not observe tasks the victim-selection logic is mid-siphoning.
    pub fn steal_half(&self) -> Vec<Arc<ScheduledTask>> {
        if self.pause_target.lock().is_some() || self.prioritizing.load(Ordering::Acquire) {
            return Vec::new();
        }
        let mut q = self.run_queue.lock();
        let half = q.len() / 2;
        if half == 0 {
            return Vec::new();
        }
        let split_at = q.len() - half;
        q.split_off(split_at).into()
    }

    /// Flags `target` for quiesce and immediately siphons any already
    /// queued task owned by it — step 2 of the migrator's algorithm.
    pub fn request_pause(&self, target: ProcletId) {
        *self.pause_target.lock() = Some(target);
        self.siphon_paused();
    }

    pub fn clear_pause(&self) {
        *self.pause_target.lock() = None;
    }

    fn siphon_paused(&self) {
        let Some(target) = *self.pause_target.lock() else {
            return;
        };
        let mut migrating = self.migrating.lock();
        for queue in [&self.run_queue, &self.overflow] {
            let mut q = queue.lock();
            let mut remaining = VecDeque::with_capacity(q.len());
            while let Some(t) = q.pop_front() {
                if t.owner_proclet == Some(target) {
                    migrating.push(t);
                } else {
                    remaining.push_back(t);
                }
            }
            *q = remaining;
        }
    }

    /// Drains the migrating side list for `target` — the migrator calls
    /// this once quiesce has observed zero outstanding guards, taking
    /// ownership of the paused continuations to ship.
    pub fn take_migrating(&self, target: ProcletId) -> Vec<Arc<ScheduledTask>> {
        let mut migrating = self.migrating.lock();
        let (taken, rest): (Vec<_>, Vec<_>) = migrating
            .drain(..)
            .partition(|t| t.owner_proclet == Some(target));
        *migrating = rest;
        taken
    }

    /// Moves every queued task to the deprioritized list until
    /// [`KThread::clear_prioritize`] — the RCU writer-sync path's
    /// "run only rcu-holding threads" step.
    pub fn request_prioritize(&self) {
        self.prioritizing.store(true, Ordering::Release);
        let mut run_queue = self.run_queue.lock();
        let mut deprioritized = self.deprioritized.lock();
        deprioritized.extend(run_queue.drain(..));
    }

    pub fn clear_prioritize(&self) {
        self.prioritizing.store(false, Ordering::Release);
        let mut deprioritized = self.deprioritized.lock();
        let mut run_queue = self.run_queue.lock();
        run_queue.extend(deprioritized.drain(..));
    }

    fn next_runnable(&self) -> Option<Arc<ScheduledTask>> {
        if let Some(t) = self.run_queue.lock().pop_front() {
            return Some(t);
        }
        self.overflow.lock().pop_front()
    }

    /// Runs one scheduling quantum: pop, run to completion, attribute
    /// elapsed wall time as cycles both to the task and, when it is owned
    /// by a still-resident proclet, to that proclet's header (spec §4.8:
    /// "elapsed cycles are added to the proclet's monitor counter on each
    /// cooperative switch") so the CPU pressure handler has something to
    /// rank victims by. Returns `false` when nothing was runnable.
    pub fn run_one(&self, registry: &ProcletRegistry) -> bool {
        self.siphon_paused();
        let Some(task) = self.next_runnable() else {
            return false;
        };
        let start = Instant::now();
        task.run_once();
        let elapsed = start.elapsed().as_nanos() as u64;
        task.add_cycles(elapsed);
        if let Some(owner) = task.owner_proclet
            && let Some(entry) = registry.get(owner)
        {
            entry.header.add_monitor_cycles(elapsed);
        }
        trace!(kthread = self.index, task = task.id, elapsed, "ran task");
        true
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_task(id: u64, owner: Option<ProcletId>) -> Arc<ScheduledTask> {
        Arc::new(ScheduledTask::new(id, owner, Box::new(|| {})))
    }

    #[test]
    fn pause_siphons_matching_tasks_only() {
        let kt = KThread::new(0);
        let target = ProcletId(1);
        let other = ProcletId(2);
        kt.enqueue(noop_task(1, Some(target)));
        kt.enqueue(noop_task(2, Some(other)));
        kt.enqueue(noop_task(3, Some(target)));

        kt.request_pause(target);
        assert_eq!(kt.run_queue_len(), 1);
        let migrating = kt.take_migrating(target);
        assert_eq!(migrating.len(), 2);
        assert!(migrating.iter().all(|t| t.owner_proclet == Some(target)));
    }

    #[test]
    fn run_one_drains_the_queue() {
        let kt = KThread::new(0);
        for i in 0..5 {
            kt.enqueue(noop_task(i, None));
        }
        let registry = ProcletRegistry::new();
        let mut ran = 0;
        while kt.run_one(&registry) {
            ran += 1;
        }
        assert_eq!(ran, 5);
    }

    #[test]
    fn run_one_credits_elapsed_cycles_to_the_owning_proclet() {
        use crate::proclet::{ProcletEntry, ProcletHeader};
        use crate::invocation::registry::CtorId;

        let kt = KThread::new(0);
        let registry = ProcletRegistry::new();
        let target = ProcletId(9);
        let header = Arc::new(ProcletHeader::new(4096, "127.0.0.1:9100".parse().unwrap(), false));
        registry.insert(
            target,
            Arc::new(ProcletEntry::new(header, Box::new(0i32), CtorId(0))),
        );

        kt.enqueue(Arc::new(ScheduledTask::new(
            1,
            Some(target),
            Box::new(|| std::thread::sleep(std::time::Duration::from_micros(50))),
        )));
        assert!(kt.run_one(&registry));
        assert!(registry.get(target).unwrap().header.monitor_cycles() > 0);
    }

    #[test]
    fn prioritize_then_clear_restores_queue_order() {
        let kt = KThread::new(0);
        kt.enqueue(noop_task(1, None));
        kt.enqueue(noop_task(2, None));
        kt.request_prioritize();
        assert_eq!(kt.run_queue_len(), 0);
        kt.clear_prioritize();
        assert_eq!(kt.run_queue_len(), 2);
    }
}
