use std::sync::Arc;

use tracing::debug;

use super::accumulate::ReduceAccumulator;
use super::tree::{UpwardStage, upward_params, upward_spec};
use super::{EdgePlan, Operation, offer};
use crate::context::CommContext;
use crate::dataflow::{ChannelOperation, Payload};
use crate::error::{CommError, Result};
use crate::protocol::codec::Codec;
use crate::receiver::Receiver;
use crate::reduce::ReduceFunction;
use crate::routing::TreeRouter;
use crate::types::{Flags, Mode, OperationKind, TaskId};

/// Combine one value per source into a single result at the root.
///
/// Values are folded on the way up the tree, so each worker forwards at
/// most one value per round. In batch mode the root's receiver sees one
/// result once every source called [`finish`](Self::finish); in streaming
/// mode it sees one result per round of values, one from each source.
pub struct Reduce<T: Clone + Send + 'static> {
    plan: EdgePlan,
    router: TreeRouter,
    engine: ChannelOperation<T>,
    stage: UpwardStage<T, ReduceAccumulator<T>>,
}

impl<T: Clone + Send + 'static> Reduce<T> {
    pub fn new(
        ctx: &CommContext,
        plan: EdgePlan,
        codec: Arc<dyn Codec<T>>,
        function: Arc<dyn ReduceFunction<T>>,
        receiver: impl Receiver<T> + 'static,
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
        let engine = ChannelOperation::new(
            ctx,
            upward_spec(OperationKind::Reduce, plan.edge, &router, local_sources),
            codec,
        )?;
        let stage = UpwardStage::new(
            plan.edge,
            plan.mode,
            config.window_count,
            config.receive_queue_max,
            config.send_pending_max,
            &router,
            Box::new(move || ReduceAccumulator::new(Arc::clone(&function))),
            Box::new(receiver),
        );
        debug!(
            edge = plan.edge,
            root,
            mode = ?plan.mode,
            parent = ?router.parent(),
            "reduce ready"
        );
        Ok(Self {
            plan,
            router,
            engine,
            stage,
        })
    }

    /// Contribute `value` from `source`. `Ok(false)` means try again after
    /// progress.
    pub fn reduce(&mut self, source: TaskId, value: &T) -> Result<bool> {
        let params = upward_params(&self.router, self.plan.edge, source)?;
        offer(
            &mut self.engine,
            source,
            || Payload::Single(value.clone()),
            Flags::ORIGIN_SENDER,
            params,
        )
    }

    /// `source` will send nothing more.
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

    /// Send a synchronization marker; the root's receiver sees it once every
    /// source sent one.
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

    pub fn router(&self) -> &TreeRouter {
        &self.router
    }
}

impl<T: Clone + Send + 'static> Operation for Reduce<T> {
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
                operation: OperationKind::Reduce.name(),
            });
        }
        self.engine.reset()?;
        self.stage.reset();
        Ok(())
    }
}
