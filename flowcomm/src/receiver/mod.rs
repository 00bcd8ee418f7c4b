//! User-facing result callbacks and the per-upstream queues final and
//! partial stages are built on.

mod upstream;

pub use upstream::{Round, UpstreamQueues};

use crate::types::TaskId;

/// Consumer of an operator's results on one worker.
///
/// `target` is the local task a result belongs to: the root of a reduce or
/// gather, each destination of a broadcast or partition.
pub trait Receiver<M>: Send {
    /// Called once, before any result, with every local target.
    fn init(&mut self, _targets: &[TaskId]) {}

    fn receive(&mut self, target: TaskId, message: M);

    /// A synchronization marker aligned across every upstream of `target`.
    fn sync(&mut self, _target: TaskId, _marker: &[u8]) {}

    /// A batch operation delivered everything it will for `target`.
    fn complete(&mut self, _target: TaskId) {}
}

impl<M, F> Receiver<M> for F
where
    F: FnMut(TaskId, M) + Send,
{
    fn receive(&mut self, target: TaskId, message: M) {
        self(target, message)
    }
}
