use std::sync::Arc;

use tracing::debug;

use super::tree::{DownwardStage, downward_spec};
use super::{EdgePlan, Operation, offer};
use crate::context::CommContext;
use crate::dataflow::{ChannelOperation, Payload};
use crate::error::{CommError, Result};
use crate::protocol::codec::Codec;
use crate::receiver::Receiver;
use crate::routing::TreeRouter;
use crate::types::{Flags, Mode, OperationKind, TaskId};

/// Deliver one source's values to every destination.
///
/// Workers relay what their parent sent to their children before handing
/// it to local destinations. Each destination's receiver sees a list of
/// values: everything at once in batch mode, per window or barrier in
/// streaming mode.
pub struct Broadcast<T: Clone + Send + 'static> {
    plan: EdgePlan,
    source: TaskId,
    engine: ChannelOperation<T>,
    stage: DownwardStage<T>,
}

impl<T: Clone + Send + 'static> Broadcast<T> {
    pub fn new(
        ctx: &CommContext,
        plan: EdgePlan,
        codec: Arc<dyn Codec<T>>,
        receiver: impl Receiver<Vec<T>> + 'static,
    ) -> Result<Self> {
        let source = match plan.sources.as_slice() {
            [s] => *s,
            other => {
                return Err(CommError::InvalidPlan(format!(
                    "broadcast on edge {} needs exactly one source, got {}",
                    plan.edge,
                    other.len()
                )));
            }
        };
        let config = &ctx.config;
        let router = TreeRouter::new(
            &ctx.plan,
            source,
            &plan.destinations,
            config.tree_inter_node_degree,
            config.tree_intra_node_degree,
        )?;
        let local_sources = if ctx.plan.is_local(source) {
            vec![source]
        } else {
            Vec::new()
        };
        let engine = ChannelOperation::new(
            ctx,
            downward_spec(OperationKind::Broadcast, plan.edge, &router, local_sources),
            codec,
        )?;
        let stage = DownwardStage::new(
            plan.edge,
            plan.mode,
            config.window_count,
            config.receive_queue_max,
            config.send_pending_max,
            &router,
            Box::new(receiver),
        );
        debug!(
            edge = plan.edge,
            source,
            local = router.local_members().len(),
            children = router.children().len(),
            "broadcast ready"
        );
        Ok(Self {
            plan,
            source,
            engine,
            stage,
        })
    }

    fn send(&mut self, source: TaskId, payload: impl FnOnce() -> Payload<T>, flags: Flags) -> Result<bool> {
        if source != self.source {
            return Err(CommError::UnknownSource {
                edge: self.plan.edge,
                source_task: source,
            });
        }
        let params = self.stage.fan_out(self.source);
        offer(&mut self.engine, source, payload, flags | Flags::ORIGIN_SENDER, params)
    }

    pub fn broadcast(&mut self, source: TaskId, value: &T) -> Result<bool> {
        self.send(source, || Payload::Single(value.clone()), Flags::NONE)
    }

    pub fn finish(&mut self, source: TaskId) -> Result<bool> {
        self.plan.require(Mode::Batch, "finish")?;
        self.send(source, || Payload::Empty, Flags::END)
    }

    pub fn barrier(&mut self, source: TaskId, marker: &[u8]) -> Result<bool> {
        self.plan.require(Mode::Streaming, "barrier")?;
        self.send(source, || Payload::Marker(marker.to_vec()), Flags::BARRIER)
    }
}

impl<T: Clone + Send + 'static> Operation for Broadcast<T> {
    fn progress(&mut self) -> Result<bool> {
        let mut moved = self.engine.progress(&mut self.stage)?;
        moved |= self.stage.progress(&mut self.engine)?;
        Ok(moved)
    }

    fn has_pending(&self) -> bool {
        self.engine.has_pending() || !self.stage.is_done()
    }

    fn is_complete(&self) -> bool {
        self.engine.is_complete() && self.stage.is_done()
    }

    fn close(&mut self) -> Result<()> {
        self.engine.close()
    }

    fn reset(&mut self) -> Result<()> {
        if !self.stage.is_done() {
            return Err(CommError::OperationBusy {
                edge: self.plan.edge,
                operation: OperationKind::Broadcast.name(),
            });
        }
        self.engine.reset()?;
        self.stage.reset();
        Ok(())
    }
}
