// src/scheduler/task.rs

//! A schedulable unit of work: the safe-Rust analogue of the original's
//! captured-continuation user thread (spec §4.8, §9 "Coroutine-like
//! resumption of migrated frames"). Rather than saved registers and a raw
//! stack, a task is a boxed `FnOnce` the owning kthread runs to completion;
//! what migration actually needs to preserve — `owner_proclet`, the
//! accumulated cycle count — rides alongside it instead of inside it.

use crate::proclet::ProcletId;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub type TaskBody = Box<dyn FnOnce() + Send>;

pub struct ScheduledTask {
    pub id: u64,
    pub owner_proclet: Option<ProcletId>,
    cycles: AtomicU64,
    body: Mutex<Option<TaskBody>>,
}

impl ScheduledTask {
    pub fn new(id: u64, owner_proclet: Option<ProcletId>, body: TaskBody) -> Self {
        Self {
            id,
            owner_proclet,
            cycles: AtomicU64::new(0),
            body: Mutex::new(Some(body)),
        }
    }

    /// Runs the task body exactly once. Returns `false` if the body had
    /// already been taken — defensive; the scheduler never dispatches the
    /// same task twice.
    pub fn run_once(&self) -> bool {
        let body = self.body.lock().unwrap().take();
        match body {
            Some(f) => {
                f();
                true
            }
            None => false,
        }
    }

    pub fn add_cycles(&self, n: u64) {
        self.cycles.fetch_add(n, Ordering::Relaxed);
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_once_runs_exactly_once() {
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&ran);
        let task = ScheduledTask::new(
            1,
            None,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(task.run_once());
        assert!(!task.run_once());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
