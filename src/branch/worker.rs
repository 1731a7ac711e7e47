use super::{Core, WaitStrategy};
use crate::task::{Task, panic_message};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

/// Spin iterations before a `Balance` worker starts sleeping.
const MAX_SPIN: u32 = 10_000;

/// One worker thread's state. The loop reads `decline` and `is_waiting`
/// lock-free as hints; every exit or park decision is re-validated under
/// the control mutex before it commits.
pub(super) struct Worker {
    core: Arc<Core>,
    id: u64,
    spin_count: u32,
}

impl Worker {
    pub(super) fn new(core: Arc<Core>, id: u64) -> Self {
        Self {
            core,
            id,
            spin_count: 0,
        }
    }

    pub(super) fn run(mut self) {
        loop {
            // Drain path: no exit request pending and the queue has work.
            if self.core.decline.load(Ordering::Relaxed) == 0 {
                if let Some(task) = self.core.queue.try_pop() {
                    self.run_task(task);
                    continue;
                }
            }

            // Exit path.
            if self.core.decline.load(Ordering::Relaxed) > 0 {
                if self.try_exit() {
                    return;
                }
                continue;
            }

            // Quiescence path.
            if self.core.is_waiting.load(Ordering::Relaxed) {
                self.park_for_quiescence();
                continue;
            }

            self.idle_wait();
        }
    }

    fn run_task(&mut self, task: Task) {
        // Submissions wrap user code themselves; a panic reaching this
        // boundary is unexpected but must not take the worker down.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            tracing::error!(
                worker = ?thread::current().id(),
                cause = panic_message(&*payload),
                "panic escaped the task boundary",
            );
        }
        self.spin_count = 0;
    }

    /// Consumes one exit request: decrementing `decline` and removing the
    /// registry entry happen atomically under the control mutex. Returns
    /// `true` when this worker should exit its thread.
    fn try_exit(&self) -> bool {
        let mut ctrl = self.core.ctrl.lock();
        if self.core.decline.load(Ordering::Relaxed) == 0 {
            return false;
        }
        self.core.decline.fetch_sub(1, Ordering::Relaxed);
        ctrl.workers.remove(&self.id);

        if self.core.is_waiting.load(Ordering::Relaxed) {
            // This worker will never acknowledge the drain; let the
            // waiter re-evaluate against the shrunk registry.
            self.core.drained_cv.notify_one();
        }
        if self.core.destructing.load(Ordering::Relaxed) {
            self.core.resume_cv.notify_one();
        }
        true
    }

    /// Phase-1 acknowledgement and phase-2 park of the quiescence
    /// handshake.
    fn park_for_quiescence(&self) {
        let mut ctrl = self.core.ctrl.lock();
        if !self.core.is_waiting.load(Ordering::Relaxed) {
            // The wait cycle ended between the hint read and the lock;
            // an acknowledgement now would leak into the next cycle.
            return;
        }

        ctrl.task_done_workers += 1;
        ctrl.parked += 1;
        self.core.drained_cv.notify_one();

        while self.core.is_waiting.load(Ordering::Relaxed) {
            self.core.resume_cv.wait(&mut ctrl);
        }

        ctrl.parked -= 1;
        ctrl.waiting_finished_workers += 1;
        if ctrl.parked == 0 {
            self.core.resumed_cv.notify_one();
        }
    }

    fn idle_wait(&mut self) {
        match self.core.strategy {
            WaitStrategy::LowLatency => thread::yield_now(),
            WaitStrategy::Balance => {
                if self.spin_count < MAX_SPIN {
                    self.spin_count += 1;
                    thread::yield_now();
                } else {
                    thread::sleep(Duration::from_nanos(1));
                }
            }
            WaitStrategy::Blocking => {
                let mut ctrl = self.core.ctrl.lock();
                while self.core.queue.len() == 0
                    && !self.core.is_waiting.load(Ordering::Relaxed)
                    && !self.core.destructing.load(Ordering::Relaxed)
                    && self.core.decline.load(Ordering::Relaxed) == 0
                {
                    self.core.task_cv.wait(&mut ctrl);
                }
            }
        }
    }
}
