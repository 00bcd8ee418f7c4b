use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{Broadcast, EdgePlan, Operation, Reduce};
use crate::context::CommContext;
use crate::error::{CommError, Result};
use crate::protocol::codec::Codec;
use crate::receiver::Receiver;
use crate::reduce::ReduceFunction;
use crate::types::{OperationKind, TaskId};

/// What the upward pass produced at the root, in order.
pub(crate) enum Handoff<T> {
    Value(T),
    Marker(Vec<u8>),
    Complete,
}

pub(crate) type HandoffQueue<T> = Arc<Mutex<VecDeque<Handoff<T>>>>;

/// Receiver of the upward pass that queues results for the downward one.
pub(crate) struct HandoffReceiver<T>(pub HandoffQueue<T>);

impl<T: Send> Receiver<T> for HandoffReceiver<T> {
    fn receive(&mut self, _target: TaskId, message: T) {
        self.push(Handoff::Value(message));
    }

    fn sync(&mut self, _target: TaskId, marker: &[u8]) {
        self.push(Handoff::Marker(marker.to_vec()));
    }

    fn complete(&mut self, _target: TaskId) {
        self.push(Handoff::Complete);
    }
}

impl<T> HandoffReceiver<T> {
    fn push(&self, item: Handoff<T>) {
        self.0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(item);
    }
}

/// Hands each element of a delivered list to the inner receiver.
pub(crate) struct Unbatch<R>(pub R);

impl<T, R: Receiver<T>> Receiver<Vec<T>> for Unbatch<R> {
    fn init(&mut self, targets: &[TaskId]) {
        self.0.init(targets);
    }

    fn receive(&mut self, target: TaskId, message: Vec<T>) {
        for m in message {
            self.0.receive(target, m);
        }
    }

    fn sync(&mut self, target: TaskId, marker: &[u8]) {
        self.0.sync(target, marker);
    }

    fn complete(&mut self, target: TaskId) {
        self.0.complete(target);
    }
}

/// Root of the upward pass of a two-edge operator.
pub(crate) fn pass_root(plan: &EdgePlan) -> Result<TaskId> {
    plan.destinations.iter().copied().min().ok_or_else(|| {
        CommError::InvalidPlan(format!("edge {} has no destinations", plan.edge))
    })
}

/// Move queued upward results into `send` until it pushes back.
pub(crate) fn pump<T>(
    queue: &HandoffQueue<T>,
    mut send: impl FnMut(&Handoff<T>) -> Result<bool>,
) -> Result<bool> {
    let mut queue = queue.lock().unwrap_or_else(|p| p.into_inner());
    let mut moved = false;
    while let Some(head) = queue.front() {
        if !send(head)? {
            break;
        }
        queue.pop_front();
        moved = true;
    }
    Ok(moved)
}

/// Reduce to one task, then broadcast the result to every destination.
///
/// Occupies edges `edge` and `edge + 1`. The smallest destination is the
/// root of both passes.
pub struct AllReduce<T: Clone + Send + 'static> {
    plan: EdgePlan,
    root: TaskId,
    reduce: Reduce<T>,
    broadcast: Broadcast<T>,
    handoff: HandoffQueue<T>,
}

impl<T: Clone + Send + 'static> AllReduce<T> {
    pub fn new(
        ctx: &CommContext,
        plan: EdgePlan,
        codec: Arc<dyn Codec<T>>,
        function: Arc<dyn ReduceFunction<T>>,
        receiver: impl Receiver<T> + 'static,
    ) -> Result<Self> {
        let root = pass_root(&plan)?;
        let handoff: HandoffQueue<T> = Arc::default();
        let up = EdgePlan {
            destinations: vec![root],
            ..plan.clone()
        };
        let down = EdgePlan {
            edge: plan.edge + 1,
            sources: vec![root],
            ..plan.clone()
        };
        let reduce = Reduce::new(
            ctx,
            up,
            Arc::clone(&codec),
            function,
            HandoffReceiver(Arc::clone(&handoff)),
        )?;
        let broadcast = Broadcast::new(ctx, down, codec, Unbatch(receiver))?;
        debug!(edge = plan.edge, root, "allreduce ready");
        Ok(Self {
            plan,
            root,
            reduce,
            broadcast,
            handoff,
        })
    }

    pub fn reduce(&mut self, source: TaskId, value: &T) -> Result<bool> {
        self.reduce.reduce(source, value)
    }

    pub fn finish(&mut self, source: TaskId) -> Result<bool> {
        self.reduce.finish(source)
    }

    pub fn barrier(&mut self, source: TaskId, marker: &[u8]) -> Result<bool> {
        self.reduce.barrier(source, marker)
    }

    fn handoff_empty(&self) -> bool {
        self.handoff
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty()
    }
}

impl<T: Clone + Send + 'static> Operation for AllReduce<T> {
    fn progress(&mut self) -> Result<bool> {
        let mut moved = self.reduce.progress()?;
        let (root, broadcast) = (self.root, &mut self.broadcast);
        moved |= pump(&self.handoff, |item| match item {
            Handoff::Value(v) => broadcast.broadcast(root, v),
            Handoff::Marker(m) => broadcast.barrier(root, m),
            Handoff::Complete => broadcast.finish(root),
        })?;
        moved |= self.broadcast.progress()?;
        Ok(moved)
    }

    fn has_pending(&self) -> bool {
        self.reduce.has_pending() || self.broadcast.has_pending() || !self.handoff_empty()
    }

    fn is_complete(&self) -> bool {
        self.reduce.is_complete() && self.broadcast.is_complete() && self.handoff_empty()
    }

    fn close(&mut self) -> Result<()> {
        self.reduce.close()?;
        self.broadcast.close()
    }

    fn reset(&mut self) -> Result<()> {
        if !self.is_complete() {
            return Err(CommError::OperationBusy {
                edge: self.plan.edge,
                operation: OperationKind::AllReduce.name(),
            });
        }
        self.reduce.reset()?;
        self.broadcast.reset()
    }
}
