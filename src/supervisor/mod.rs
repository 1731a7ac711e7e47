//! Background controller that elastically resizes branches against
//! observed backlog.

use crate::branch::Branch;
use crate::error::Error;
use crate::task::panic_message;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};


type TickCallback = Arc<dyn Fn() + Send + Sync + 'static>;

struct State {
    branches: Vec<Arc<Branch>>,
    /// Wait before the next tick; `None` pauses the loop until
    /// [`Supervisor::proceed`].
    tick: Option<Duration>,
    callback: Option<TickCallback>,
    stopping: bool,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
    wmin: usize,
    wmax: usize,
    /// Restore target for `proceed`.
    tval: Duration,
}

static NEXT_SUPERVISOR_ID: AtomicUsize = AtomicUsize::new(0);

/// Watches registered branches from its own thread and keeps each one's
/// worker count inside `[wmin, wmax]`: backlogged branches grow by up to
/// the backlog size per tick, idle branches shrink by one worker per
/// tick. Dropping the supervisor stops and joins the thread.
pub struct Supervisor {
    inner: Arc<Inner>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Supervisor {
    /// Starts the control thread. Requires `wmax > 0` and `wmax > wmin`;
    /// `tick` is the interval between scaling passes.
    pub fn new(wmin: usize, wmax: usize, tick: Duration) -> Result<Self, Error> {
        if wmax == 0 || wmax <= wmin {
            return Err(Error::InvalidBounds { wmin, wmax });
        }

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                branches: Vec::new(),
                tick: Some(tick),
                callback: None,
                stopping: false,
            }),
            cv: Condvar::new(),
            wmin,
            wmax,
            tval: tick,
        });

        let thread = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(format!(
                    "arbor-supervisor-{}",
                    NEXT_SUPERVISOR_ID.fetch_add(1, Ordering::Relaxed)
                ))
                .spawn(move || control_loop(inner))
                .expect("failed to spawn supervisor thread")
        };

        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    /// Registers a branch for scaling. A handle already registered (same
    /// allocation) is ignored.
    pub fn add_super(&self, branch: Arc<Branch>) {
        let mut state = self.inner.state.lock();
        if state.branches.iter().any(|b| Arc::ptr_eq(b, &branch)) {
            return;
        }
        state.branches.push(branch);
    }

    /// Pauses the loop after the current tick; only [`Supervisor::proceed`]
    /// resumes it.
    pub fn suspend(&self) {
        self.inner.state.lock().tick = None;
    }

    /// Sets the wait before the next tick to `pause`. The current tick is
    /// not interrupted.
    pub fn suspend_for(&self, pause: Duration) {
        self.inner.state.lock().tick = Some(pause);
    }

    /// Restores the constructed tick interval and wakes the loop.
    pub fn proceed(&self) {
        self.inner.state.lock().tick = Some(self.inner.tval);
        self.inner.cv.notify_one();
    }

    /// Replaces the tick callback. It runs once per tick, after the
    /// scaling pass, outside the supervisor lock.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.state.lock().callback = Some(Arc::new(callback));
    }

    /// Identity of this supervisor, stable across moves of the handle.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.stopping = true;
            self.inner.cv.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn control_loop(inner: Arc<Inner>) {
    loop {
        let branches = {
            let state = inner.state.lock();
            if state.stopping {
                return;
            }
            state.branches.clone()
        };

        // Branch calls run outside the supervisor lock so a slow pool can
        // never block suspend/proceed or registration.
        for branch in &branches {
            if panic::catch_unwind(AssertUnwindSafe(|| inner.scale(branch))).is_err() {
                tracing::error!(
                    supervisor = ?thread::current().id(),
                    "scaling pass panicked; continuing",
                );
            }
        }

        {
            let mut state = inner.state.lock();
            if state.stopping {
                return;
            }
            match state.tick {
                Some(tick) => match Instant::now().checked_add(tick) {
                    Some(deadline) => {
                        inner.cv.wait_until(&mut state, deadline);
                    }
                    None => inner.cv.wait(&mut state),
                },
                None => inner.cv.wait(&mut state),
            }
        }

        let callback = inner.state.lock().callback.clone();
        if let Some(callback) = callback {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback())) {
                tracing::error!(
                    supervisor = ?thread::current().id(),
                    cause = panic_message(&*payload),
                    "tick callback panicked; continuing",
                );
            }
        }
    }
}

impl Inner {
    fn scale(&self, branch: &Branch) {
        let workers = branch.num_workers();
        let tasks = branch.num_tasks();

        if tasks > 0 {
            // Grow by the backlog, bounded by the remaining headroom.
            let needed = tasks.saturating_sub(workers);
            let capacity = self.wmax.saturating_sub(workers);
            for _ in 0..needed.min(capacity) {
                branch.add_worker();
            }
        } else if workers > self.wmin {
            // Idle: slow shrink, one worker per tick.
            if let Err(error) = branch.del_worker() {
                tracing::warn!(
                    supervisor = ?thread::current().id(),
                    %error,
                    "shrink request failed",
                );
            }
        }
    }
}
