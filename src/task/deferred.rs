//! One-shot deferred results and their ordered collection.

use crate::error::TaskError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

enum Cell<T> {
    Pending,
    Ready(Result<T, TaskError>),
    Taken,
}

struct Shared<T> {
    cell: Mutex<Cell<T>>,
    cv: Condvar,
}

/// Creates a connected producer/consumer pair.
pub(crate) fn pair<T>() -> (Promise<T>, Deferred<T>) {
    let shared = Arc::new(Shared {
        cell: Mutex::new(Cell::Pending),
        cv: Condvar::new(),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
            fulfilled: false,
        },
        Deferred { shared },
    )
}

/// Producer half of a deferred result. Held inside the queued task.
pub(crate) struct Promise<T> {
    shared: Arc<Shared<T>>,
    fulfilled: bool,
}

impl<T> Promise<T> {
    /// Stores the outcome. Every cell has exactly one producer and the
    /// consumer side never writes, so the cell is still pending here:
    /// `fulfil` consumes the move-only producer, which makes a second
    /// delivery unrepresentable rather than a runtime error.
    pub(crate) fn fulfil(mut self, outcome: Result<T, TaskError>) {
        let mut cell = self.shared.cell.lock();
        debug_assert!(
            matches!(*cell, Cell::Pending),
            "deferred cell delivered twice"
        );
        *cell = Cell::Ready(outcome);
        self.fulfilled = true;
        drop(cell);
        self.shared.cv.notify_all();
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        // A promise dropped without delivery means the task never ran
        // (the branch shut down with it still queued). Consumers must
        // not block forever on it.
        if self.fulfilled {
            return;
        }
        let mut cell = self.shared.cell.lock();
        if matches!(*cell, Cell::Pending) {
            *cell = Cell::Ready(Err(TaskError::Discarded));
            drop(cell);
            self.shared.cv.notify_all();
        }
    }
}

/// Consumer half of a deferred result produced by a result-yielding
/// submission.
pub struct Deferred<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Deferred<T> {
    /// Blocks until the outcome has been delivered.
    pub fn wait(&self) {
        let mut cell = self.shared.cell.lock();
        while matches!(*cell, Cell::Pending) {
            self.shared.cv.wait(&mut cell);
        }
    }

    /// Blocks until the outcome is delivered or `timeout` elapses.
    /// Returns `true` if the outcome is available.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut cell = self.shared.cell.lock();
        while matches!(*cell, Cell::Pending) {
            match deadline {
                Some(deadline) => {
                    if self.shared.cv.wait_until(&mut cell, deadline).timed_out() {
                        return !matches!(*cell, Cell::Pending);
                    }
                }
                None => self.shared.cv.wait(&mut cell),
            }
        }
        true
    }

    /// Takes the outcome if it has been delivered. Returns `None` while
    /// the task is still pending or after the outcome was taken.
    pub fn try_take(&self) -> Option<Result<T, TaskError>> {
        let mut cell = self.shared.cell.lock();
        match std::mem::replace(&mut *cell, Cell::Taken) {
            Cell::Ready(outcome) => Some(outcome),
            other => {
                *cell = other;
                None
            }
        }
    }

    /// Blocks until the outcome is delivered, then consumes it.
    pub fn take(self) -> Result<T, TaskError> {
        self.wait();
        self.try_take()
            .expect("deferred result was already taken through try_take")
    }
}

/// An insertion-ordered collection of deferred results.
pub struct Deferreds<T> {
    items: VecDeque<Deferred<T>>,
}

impl<T> Default for Deferreds<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deferreds<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub fn add_back(&mut self, deferred: Deferred<T>) {
        self.items.push_back(deferred);
    }

    pub fn add_front(&mut self, deferred: Deferred<T>) {
        self.items.push_front(deferred);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Blocks until every outcome has been delivered.
    pub fn wait(&self) {
        for deferred in &self.items {
            deferred.wait();
        }
    }

    /// Blocks until every outcome is delivered, then consumes them all
    /// in insertion order.
    pub fn take_all(self) -> Vec<Result<T, TaskError>> {
        self.items.into_iter().map(Deferred::take).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Deferred<T>> {
        self.items.iter()
    }
}
