//! Multi-branch façade: owns branches and supervisors, hands out
//! identity handles, and spreads submissions with a round-robin cursor
//! plus a one-step load peek.

use crate::branch::Branch;
use crate::supervisor::Supervisor;
use crate::task::Task;
use crate::task::deferred::Deferred;
use std::collections::BTreeMap;
use std::sync::Arc;


/// Identity handle for a workspace-attached branch. Compares and orders
/// by identity so it can key external containers; it never extends the
/// branch's lifetime, and it dangles once the branch is detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bid(usize);

/// Identity handle for a workspace-attached supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sid(usize);

/// A collection of branches and supervisors behind one submission front.
///
/// The workspace itself is not internally synchronized: every mutating
/// entry point takes `&mut self`, so concurrent use requires external
/// serialization. The branches and supervisors it owns stay internally
/// synchronized and may be driven concurrently through shared handles.
#[derive(Default)]
pub struct Workspace {
    branches: Vec<Arc<Branch>>,
    supervisors: BTreeMap<Sid, Supervisor>,
    /// Round-robin position into `branches`; meaningless while empty.
    cursor: usize,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of a branch and appends it to the dispatch list.
    /// The round-robin cursor resets to the list head.
    pub fn attach(&mut self, branch: Branch) -> Bid {
        self.attach_shared(Arc::new(branch))
    }

    /// Attaches an externally shared branch (e.g. one also registered
    /// with a supervisor).
    pub fn attach_shared(&mut self, branch: Arc<Branch>) -> Bid {
        let bid = Bid(Arc::as_ptr(&branch) as usize);
        self.branches.push(branch);
        self.cursor = 0;
        bid
    }

    /// Takes ownership of a supervisor, keyed by its identity.
    pub fn attach_supervisor(&mut self, supervisor: Supervisor) -> Sid {
        let sid = Sid(supervisor.identity());
        self.supervisors.insert(sid, supervisor);
        sid
    }

    /// Removes a branch and returns it to the caller. The cursor is
    /// repaired to point at what was the next element, wrapping to the
    /// head when the removed element was the tail.
    pub fn detach(&mut self, bid: Bid) -> Option<Arc<Branch>> {
        let index = self.index_of(bid)?;
        let branch = self.branches.remove(index);
        self.cursor = if self.branches.is_empty() {
            0
        } else {
            index % self.branches.len()
        };
        Some(branch)
    }

    /// Removes a supervisor and returns it to the caller.
    pub fn detach_supervisor(&mut self, sid: Sid) -> Option<Supervisor> {
        self.supervisors.remove(&sid)
    }

    pub fn get(&self, bid: Bid) -> Option<&Branch> {
        self.index_of(bid).map(|i| self.branches[i].as_ref())
    }

    /// Clones out a shared handle, e.g. to register the branch with a
    /// supervisor.
    pub fn get_shared(&self, bid: Bid) -> Option<Arc<Branch>> {
        self.index_of(bid).map(|i| Arc::clone(&self.branches[i]))
    }

    fn index_of(&self, bid: Bid) -> Option<usize> {
        self.branches
            .iter()
            .position(|b| Arc::as_ptr(b) as usize == bid.0)
    }

    pub fn get_supervisor(&self, sid: Sid) -> Option<&Supervisor> {
        self.supervisors.get(&sid)
    }

    /// Visits branches in attachment order.
    pub fn for_each_branch<F>(&self, mut f: F)
    where
        F: FnMut(&Branch),
    {
        for branch in &self.branches {
            f(branch);
        }
    }

    /// Visits supervisors in key order.
    pub fn for_each_supervisor<F>(&self, mut f: F)
    where
        F: FnMut(&Supervisor),
    {
        for supervisor in self.supervisors.values() {
            f(supervisor);
        }
    }

    pub fn num_branches(&self) -> usize {
        self.branches.len()
    }

    pub fn num_supervisors(&self) -> usize {
        self.supervisors.len()
    }

    /// Submits a fire-and-forget task to the branch picked by
    /// [`Workspace::dispatch`].
    ///
    /// # Panics
    ///
    /// Panics if no branch is attached.
    pub fn submit<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch().submit(f);
    }

    /// Front-of-queue variant of [`Workspace::submit`].
    pub fn submit_urgent<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch().submit_urgent(f);
    }

    /// Submits an ordered sequence to one branch as a single insertion.
    pub fn submit_sequence<I>(&mut self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        self.dispatch().submit_sequence(tasks);
    }

    /// Result-yielding submission through the dispatch rule.
    pub fn submit_deferred<R, F>(&mut self, f: F) -> Deferred<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.dispatch().submit_deferred(f)
    }

    /// Front-of-queue variant of [`Workspace::submit_deferred`].
    pub fn submit_urgent_deferred<R, F>(&mut self, f: F) -> Deferred<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.dispatch().submit_urgent_deferred(f)
    }

    /// Picks the submission target: the cursor advances one step on every
    /// submission (wrapping at the tail), then the task goes to whichever
    /// of the old and new positions holds fewer queued tasks. Ties keep
    /// the old position.
    fn dispatch(&mut self) -> &Branch {
        assert!(
            !self.branches.is_empty(),
            "workspace has no attached branch to dispatch to"
        );
        let this_i = self.cursor;
        self.cursor = (self.cursor + 1) % self.branches.len();
        let next_i = self.cursor;

        let target = if self.branches[next_i].num_tasks() < self.branches[this_i].num_tasks() {
            next_i
        } else {
            this_i
        };
        self.branches[target].as_ref()
    }
}
