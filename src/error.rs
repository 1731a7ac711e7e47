/// Control-path errors surfaced to the direct caller.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A worker removal was requested on a branch that has none left.
    #[error("no worker left in branch to remove")]
    NoWorkers,

    /// Supervisor bounds must satisfy `wmax > 0` and `wmax > wmin`.
    #[error("invalid supervisor bounds: wmin={wmin}, wmax={wmax}")]
    InvalidBounds { wmin: usize, wmax: usize },
}

/// The outcome of a submitted task, as observed through its deferred
/// result. Fire-and-forget submissions never surface these; their
/// failures are logged at the task boundary instead.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// User code panicked while the task ran. The payload message is
    /// preserved when it is a string.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was dropped before it ever ran, typically because its
    /// branch shut down with the task still queued.
    #[error("task discarded before execution")]
    Discarded,
}
