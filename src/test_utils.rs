//! Shared helpers for the component test modules.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A reusable barrier that keeps tasks (and therefore the workers
/// running them) busy until the test opens it.
#[derive(Clone)]
pub(crate) struct Gate(Arc<GateInner>);

struct GateInner {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Gate(Arc::new(GateInner {
            open: Mutex::new(false),
            cv: Condvar::new(),
        }))
    }

    pub(crate) fn open(&self) {
        *self.0.open.lock() = true;
        self.0.cv.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut open = self.0.open.lock();
        while !*open {
            self.0.cv.wait(&mut open);
        }
    }

    /// A task body that blocks its worker until the gate opens.
    pub(crate) fn block_task(&self) -> impl FnOnce() + Send + 'static {
        let gate = self.clone();
        move || gate.wait()
    }
}

/// Order-preserving, thread-safe event log.
pub(crate) struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Recorder(Arc::clone(&self.0))
    }
}

impl<T> Recorder<T> {
    pub(crate) fn new() -> Self {
        Recorder(Arc::new(Mutex::new(Vec::new())))
    }

    pub(crate) fn push(&self, value: T) {
        self.0.lock().push(value);
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.0.lock().clone()
    }
}

/// Polls `cond` until it holds or `deadline` elapses; returns the final
/// observation. Timing assertions in the suite go through this instead
/// of fixed sleeps.
pub(crate) fn poll_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}
