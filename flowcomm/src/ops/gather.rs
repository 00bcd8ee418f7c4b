use std::sync::Arc;

use tracing::debug;

use super::accumulate::GatherAccumulator;
use super::tree::{UpwardStage, upward_params, upward_spec};
use super::{EdgePlan, Operation, offer};
use crate::context::CommContext;
use crate::dataflow::{ChannelOperation, Payload};
use crate::error::{CommError, Result};
use crate::protocol::codec::{Codec, PairCodec, ScalarCodec};
use crate::receiver::Receiver;
use crate::routing::TreeRouter;
use crate::types::{Flags, Mode, OperationKind, TaskId};

/// Collect every source's values at the root, tagged with their source.
///
/// Intermediate workers concatenate what they received and forward it as
/// one batch. The root's receiver sees the values ordered by source: once
/// in batch mode, per window of `window_count` values or barrier in
/// streaming mode.
pub struct Gather<T: Clone + Send + 'static> {
    plan: EdgePlan,
    router: TreeRouter,
    engine: ChannelOperation<(TaskId, T)>,
    stage: UpwardStage<(TaskId, T), GatherAccumulator<T>>,
}

impl<T: Clone + Send + 'static> Gather<T> {
    pub fn new(
        ctx: &CommContext,
        plan: EdgePlan,
        codec: Arc<dyn Codec<T>>,
        receiver: impl Receiver<Vec<(TaskId, T)>> + 'static,
    ) -> Result<Self> {
        let root = plan.single_destination()?;
        let config = &ctx.config;
        let router = TreeRouter::new(
            &ctx.plan,
            root,
            &plan.sources,
            config.tree_inter_node_degree,
            config.tree_intra_node_degree,
        )?;
        let local_sources: Vec<TaskId> = plan
            .sources
            .iter()
            .copied()
            .filter(|s| ctx.plan.is_local(*s))
            .collect();
        let pairs: Arc<dyn Codec<(TaskId, T)>> =
            Arc::new(PairCodec::new(Arc::new(ScalarCodec::<TaskId>::new()), codec));
        let engine = ChannelOperation::new(
            ctx,
            upward_spec(OperationKind::Gather, plan.edge, &router, local_sources),
            pairs,
        )?;
        let stage = UpwardStage::new(
            plan.edge,
            plan.mode,
            config.window_count,
            config.receive_queue_max,
            config.send_pending_max,
            &router,
            Box::new(GatherAccumulator::default),
            Box::new(receiver),
        );
        debug!(edge = plan.edge, root, mode = ?plan.mode, "gather ready");
        Ok(Self {
            plan,
            router,
            engine,
            stage,
        })
    }

    pub fn gather(&mut self, source: TaskId, value: &T) -> Result<bool> {
        let params = upward_params(&self.router, self.plan.edge, source)?;
        offer(
            &mut self.engine,
            source,
            || Payload::Single((source, value.clone())),
            Flags::ORIGIN_SENDER,
            params,
        )
    }

    pub fn finish(&mut self, source: TaskId) -> Result<bool> {
        self.plan.require(Mode::Batch, "finish")?;
        let params = upward_params(&self.router, self.plan.edge, source)?;
        offer(
            &mut self.engine,
            source,
            || Payload::Empty,
            Flags::END | Flags::ORIGIN_SENDER,
            params,
        )
    }

    pub fn barrier(&mut self, source: TaskId, marker: &[u8]) -> Result<bool> {
        self.plan.require(Mode::Streaming, "barrier")?;
        let params = upward_params(&self.router, self.plan.edge, source)?;
        offer(
            &mut self.engine,
            source,
            || Payload::Marker(marker.to_vec()),
            Flags::BARRIER | Flags::ORIGIN_SENDER,
            params,
        )
    }
}

impl<T: Clone + Send + 'static> Operation for Gather<T> {
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
                operation: OperationKind::Gather.name(),
            });
        }
        self.engine.reset()?;
        self.stage.reset();
        Ok(())
    }
}
