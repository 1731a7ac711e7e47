//! A single worker pool: a double-ended task queue, a set of worker
//! threads, and the cooperative protocols that grow, shrink, quiesce and
//! shut the pool down without ever killing a thread.

use crate::error::{Error, TaskError};
use crate::queue::TaskQueue;
use crate::task::deferred::{self, Deferred, Promise};
use crate::task::{Task, panic_message};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

mod worker;

#[cfg(test)]
mod tests;

/// How idle workers wait for new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Yield-spin. Lowest wake latency, highest CPU burn.
    LowLatency,
    /// Bounded spin, then sub-microsecond sleeps.
    Balance,
    /// Condition-variable block. Lowest CPU, highest wake latency.
    Blocking,
}

/// Handshake counters and the worker registry. Only ever touched while
/// the control mutex is held.
#[derive(Default)]
struct Control {
    /// Live workers, ordered by spawn id.
    workers: BTreeSet<u64>,
    next_worker_id: u64,
    /// Workers that acknowledged the drain in the current wait cycle.
    task_done_workers: usize,
    /// Workers that acknowledged the resume in the current wait cycle.
    waiting_finished_workers: usize,
    /// Workers currently blocked on `resume_cv`. Phase 2 of `wait_tasks`
    /// drains exactly these, so a drain that timed out with busy workers
    /// still terminates.
    parked: usize,
}

/// State shared between the branch handle and its worker threads.
struct Core {
    queue: TaskQueue,
    strategy: WaitStrategy,
    branch_id: usize,

    ctrl: Mutex<Control>,
    /// Pending cooperative exit requests. Written under `ctrl`; read
    /// lock-free by the worker loop as a hint.
    decline: AtomicUsize,
    /// A `wait_tasks` cycle is in its drain phase. Hint semantics as
    /// `decline`.
    is_waiting: AtomicBool,
    /// Shutdown in progress. Hint semantics as `decline`.
    destructing: AtomicBool,

    /// Wakes `Blocking` workers when work or a control event arrives.
    task_cv: Condvar,
    /// Drain acknowledgements (phase 1 of `wait_tasks`).
    drained_cv: Condvar,
    /// Releases parked workers (phase 2); doubles as the shutdown wait.
    resume_cv: Condvar,
    /// Resume acknowledgements (phase 2 completion).
    resumed_cv: Condvar,
}

impl Core {
    fn enqueue_back(&self, task: Task) {
        self.queue.push_back(task);
        self.notify_submission();
    }

    fn enqueue_front(&self, task: Task) {
        self.queue.push_front(task);
        self.notify_submission();
    }

    fn notify_submission(&self) {
        if self.strategy == WaitStrategy::Blocking {
            // Taking the control mutex pairs this notify with the idle
            // predicate check: a push cannot slip between a worker's
            // empty-queue observation and its wait.
            let _ctrl = self.ctrl.lock();
            self.task_cv.notify_one();
        }
    }
}

static NEXT_BRANCH_ID: AtomicUsize = AtomicUsize::new(0);

/// A worker pool.
///
/// All methods take `&self`; the branch is internally synchronized and
/// may be driven from any number of threads through an `Arc<Branch>`.
/// Dropping the last handle shuts the pool down gracefully: queued but
/// unpopped tasks are discarded and every worker exits through the
/// cooperative path before `drop` returns.
pub struct Branch {
    core: Arc<Core>,
    /// Join handles of every spawned worker, reaped opportunistically and
    /// drained on drop so no worker thread outlives the branch.
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Serializes `wait_tasks` callers; nested waits are not supported,
    /// so late callers queue behind the active cycle.
    waiter: Mutex<()>,
}

impl Branch {
    /// An effectively indefinite `wait_tasks` timeout.
    pub const WAIT_FOREVER: Duration = Duration::from_millis(u32::MAX as u64);

    /// Creates a branch running `max(initial_workers, 1)` workers. The
    /// wait strategy is fixed for the branch's lifetime.
    pub fn new(initial_workers: usize, strategy: WaitStrategy) -> Self {
        let branch = Self {
            core: Arc::new(Core {
                queue: TaskQueue::new(),
                strategy,
                branch_id: NEXT_BRANCH_ID.fetch_add(1, Ordering::Relaxed),
                ctrl: Mutex::new(Control::default()),
                decline: AtomicUsize::new(0),
                is_waiting: AtomicBool::new(false),
                destructing: AtomicBool::new(false),
                task_cv: Condvar::new(),
                drained_cv: Condvar::new(),
                resume_cv: Condvar::new(),
                resumed_cv: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
            waiter: Mutex::new(()),
        };
        for _ in 0..initial_workers.max(1) {
            branch.add_worker();
        }
        branch
    }

    /// Spawns one additional worker. Registration is ordered by a
    /// per-branch worker id.
    pub fn add_worker(&self) {
        let wid = {
            let mut ctrl = self.core.ctrl.lock();
            let wid = ctrl.next_worker_id;
            ctrl.next_worker_id += 1;
            ctrl.workers.insert(wid);
            wid
        };

        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name(format!("arbor-br{}-w{}", self.core.branch_id, wid))
            .spawn(move || worker::Worker::new(core, wid).run())
            .expect("failed to spawn worker thread");

        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Asks one worker to leave. The request is cooperative: the next
    /// worker to observe it unregisters itself and exits its thread. When
    /// callers race, `decline` may transiently exceed the worker count;
    /// the surplus is absorbed by whichever workers observe it next.
    pub fn del_worker(&self) -> Result<(), Error> {
        let ctrl = self.core.ctrl.lock();
        if ctrl.workers.is_empty() {
            return Err(Error::NoWorkers);
        }
        self.core.decline.fetch_add(1, Ordering::Relaxed);
        if self.core.strategy == WaitStrategy::Blocking {
            // A blocked worker cannot observe the request on its own.
            self.core.task_cv.notify_one();
        }
        Ok(())
    }

    /// Enqueues a fire-and-forget task at the back of the queue. Panics
    /// raised by `f` are caught at the task boundary and logged; they
    /// never take the worker down.
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.enqueue_back(fire_and_forget(f));
    }

    /// Enqueues a fire-and-forget task at the front of the queue, one
    /// slot ahead of everything currently queued. A task already being
    /// executed is not preempted.
    pub fn submit_urgent<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.enqueue_front(fire_and_forget(f));
    }

    /// Enqueues a single back-insertion that runs `tasks` in order on one
    /// worker, with no other submission to this branch interleaved on
    /// that worker. If a member panics, the panic is logged and the
    /// remaining members are skipped.
    pub fn submit_sequence<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let tasks: Vec<Task> = tasks.into_iter().collect();
        self.core.enqueue_back(Task::new(move || {
            for (index, task) in tasks.into_iter().enumerate() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
                    tracing::error!(
                        worker = ?thread::current().id(),
                        cause = panic_message(&*payload),
                        "sequence member {} panicked; remaining members skipped",
                        index,
                    );
                    break;
                }
            }
        }));
    }

    /// Enqueues a result-yielding task at the back of the queue. A panic
    /// in `f` is captured into the deferred result instead of being
    /// logged.
    pub fn submit_deferred<R, F>(&self, f: F) -> Deferred<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (promise, result) = deferred::pair();
        self.core.enqueue_back(deliver_into(promise, f));
        result
    }

    /// Front-of-queue variant of [`Branch::submit_deferred`].
    pub fn submit_urgent_deferred<R, F>(&self, f: F) -> Deferred<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (promise, result) = deferred::pair();
        self.core.enqueue_front(deliver_into(promise, f));
        result
    }

    /// Instantaneous worker count.
    pub fn num_workers(&self) -> usize {
        self.core.ctrl.lock().workers.len()
    }

    /// Instantaneous count of queued (not yet popped) tasks.
    pub fn num_tasks(&self) -> usize {
        self.core.queue.len()
    }

    /// Drains the pool and pauses every worker, then resumes them.
    ///
    /// Phase 1 waits (bounded by `timeout`) until every live worker has
    /// reported the queue empty and parked. Phase 2 releases the parked
    /// workers and waits for all of them to acknowledge the resume;
    /// phase 2 always completes, even when phase 1 timed out.
    ///
    /// Returns `true` if quiescence was reached within `timeout`.
    pub fn wait_tasks(&self, timeout: Duration) -> bool {
        let _waiter = self.waiter.lock();

        let drained;
        {
            let mut ctrl = self.core.ctrl.lock();
            self.core.is_waiting.store(true, Ordering::Relaxed);
            if self.core.strategy == WaitStrategy::Blocking {
                self.core.task_cv.notify_all();
            }

            let deadline = Instant::now().checked_add(timeout);
            loop {
                if ctrl.task_done_workers >= ctrl.workers.len() {
                    drained = true;
                    break;
                }
                match deadline {
                    Some(deadline) => {
                        if self.core.drained_cv.wait_until(&mut ctrl, deadline).timed_out() {
                            drained = ctrl.task_done_workers >= ctrl.workers.len();
                            break;
                        }
                    }
                    None => self.core.drained_cv.wait(&mut ctrl),
                }
            }

            ctrl.task_done_workers = 0;
            self.core.is_waiting.store(false, Ordering::Relaxed);
        }
        self.core.resume_cv.notify_all();

        let mut ctrl = self.core.ctrl.lock();
        while ctrl.parked > 0 {
            self.core.resumed_cv.wait(&mut ctrl);
        }
        ctrl.waiting_finished_workers = 0;
        drained
    }
}

impl Drop for Branch {
    /// Graceful shutdown: every live worker is handed an exit request and
    /// the drop blocks until all of them have acknowledged it. Queued but
    /// unpopped tasks are dropped with the queue; their deferred results
    /// resolve to [`TaskError::Discarded`].
    fn drop(&mut self) {
        {
            let mut ctrl = self.core.ctrl.lock();
            self.core
                .decline
                .store(ctrl.workers.len(), Ordering::Relaxed);
            self.core.destructing.store(true, Ordering::Relaxed);
            if self.core.strategy == WaitStrategy::Blocking {
                self.core.task_cv.notify_all();
            }
            while self.core.decline.load(Ordering::Relaxed) > 0 {
                self.core.resume_cv.wait(&mut ctrl);
            }
        }

        for handle in self.handles.get_mut().drain(..) {
            let _ = handle.join();
        }
    }
}

fn fire_and_forget<F>(f: F) -> Task
where
    F: FnOnce() + Send + 'static,
{
    Task::new(move || {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            tracing::error!(
                worker = ?thread::current().id(),
                cause = panic_message(&*payload),
                "submitted task panicked",
            );
        }
    })
}

fn deliver_into<R, F>(promise: Promise<R>, f: F) -> Task
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    Task::new(move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(f))
            .map_err(|payload| TaskError::Panicked(panic_message(&*payload).to_owned()));
        promise.fulfil(outcome);
    })
}
