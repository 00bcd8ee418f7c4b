use std::sync::Arc;

use tracing::debug;

use super::allreduce::{Handoff, HandoffQueue, HandoffReceiver, Unbatch, pass_root, pump};
use super::{Broadcast, EdgePlan, Gather, Operation};
use crate::context::CommContext;
use crate::error::{CommError, Result};
use crate::protocol::codec::{Codec, ListCodec, PairCodec, ScalarCodec};
use crate::receiver::Receiver;
use crate::types::{OperationKind, TaskId};

/// Gather at one task, then broadcast the gathered list to every
/// destination.
///
/// Occupies edges `edge` and `edge + 1`. Every destination's receiver sees
/// the same lists, ordered by source within each list.
pub struct AllGather<T: Clone + Send + 'static> {
    plan: EdgePlan,
    root: TaskId,
    gather: Gather<T>,
    broadcast: Broadcast<Vec<(TaskId, T)>>,
    handoff: HandoffQueue<Vec<(TaskId, T)>>,
}

impl<T: Clone + Send + 'static> AllGather<T> {
    pub fn new(
        ctx: &CommContext,
        plan: EdgePlan,
        codec: Arc<dyn Codec<T>>,
        receiver: impl Receiver<Vec<(TaskId, T)>> + 'static,
    ) -> Result<Self> {
        let root = pass_root(&plan)?;
        let handoff: HandoffQueue<Vec<(TaskId, T)>> = Arc::default();
        let up = EdgePlan {
            destinations: vec![root],
            ..plan.clone()
        };
        let down = EdgePlan {
            edge: plan.edge + 1,
            sources: vec![root],
            ..plan.clone()
        };
        let lists: Arc<dyn Codec<Vec<(TaskId, T)>>> = Arc::new(ListCodec::new(Arc::new(
            PairCodec::new(Arc::new(ScalarCodec::<TaskId>::new()), Arc::clone(&codec)),
        )));
        let gather = Gather::new(ctx, up, codec, HandoffReceiver(Arc::clone(&handoff)))?;
        let broadcast = Broadcast::new(ctx, down, lists, Unbatch(receiver))?;
        debug!(edge = plan.edge, root, "allgather ready");
        Ok(Self {
            plan,
            root,
            gather,
            broadcast,
            handoff,
        })
    }

    pub fn gather(&mut self, source: TaskId, value: &T) -> Result<bool> {
        self.gather.gather(source, value)
    }

    pub fn finish(&mut self, source: TaskId) -> Result<bool> {
        self.gather.finish(source)
    }

    pub fn barrier(&mut self, source: TaskId, marker: &[u8]) -> Result<bool> {
        self.gather.barrier(source, marker)
    }

    fn handoff_empty(&self) -> bool {
        self.handoff
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty()
    }
}

impl<T: Clone + Send + 'static> Operation for AllGather<T> {
    fn progress(&mut self) -> Result<bool> {
        let mut moved = self.gather.progress()?;
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
        self.gather.has_pending() || self.broadcast.has_pending() || !self.handoff_empty()
    }

    fn is_complete(&self) -> bool {
        self.gather.is_complete() && self.broadcast.is_complete() && self.handoff_empty()
    }

    fn close(&mut self) -> Result<()> {
        self.gather.close()?;
        self.broadcast.close()
    }

    fn reset(&mut self) -> Result<()> {
        if !self.is_complete() {
            return Err(CommError::OperationBusy {
                edge: self.plan.edge,
                operation: OperationKind::AllGather.name(),
            });
        }
        self.gather.reset()?;
        self.broadcast.reset()
    }
}
