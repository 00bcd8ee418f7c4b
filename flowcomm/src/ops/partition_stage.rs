//! Receive logic of partition operators.
//!
//! Sources hand values to their worker's partial stage, which buffers them
//! per destination in a [`Combiner`] and forwards them flagged
//! `ORIGIN_PARTIAL`. Destinations count one end marker per partial stage,
//! not per source.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use super::accumulate::{Accumulator, Combiner};
use super::target::{TargetState, incoming};
use super::{EdgePlan, Operation, Outbox, offer};
use crate::context::CommContext;
use crate::dataflow::{ChannelOperation, Delivery, EdgeSpec, Offer, Payload, RoutingParameters, Sink};
use crate::error::{CommError, Result};
use crate::protocol::codec::Codec;
use crate::receiver::{Receiver, Round, UpstreamQueues};
use crate::routing::PartitionRouter;
use crate::types::{EdgeId, Flags, Mode, OperationKind, TaskId};

pub(crate) fn partition_spec(kind: OperationKind, edge: EdgeId, router: &PartitionRouter) -> EdgeSpec {
    EdgeSpec {
        edge,
        kind,
        local_sources: router.local_sources().to_vec(),
        receive_workers: router.receive_workers(),
        receive_targets: router
            .local_destinations()
            .iter()
            .map(|&d| (d, d))
            .collect::<HashMap<_, _>>(),
    }
}

/// Route of a user send: to this worker's partial stage, with the chosen
/// destination as path.
pub(crate) fn partial_params(router: &PartitionRouter, edge: EdgeId, source: TaskId, destination: TaskId) -> Result<RoutingParameters> {
    if router.worker_of_destination(destination).is_none() {
        return Err(CommError::UnexpectedDestination { edge, destination });
    }
    let stage = router.stage().ok_or(CommError::UnknownSource {
        edge,
        source_task: source,
    })?;
    Ok(RoutingParameters::internal(destination, vec![stage]))
}

/// Route of an end or barrier from a source to its partial stage.
pub(crate) fn control_params(router: &PartitionRouter, edge: EdgeId, source: TaskId) -> Result<RoutingParameters> {
    let stage = router.stage().ok_or(CommError::UnknownSource {
        edge,
        source_task: source,
    })?;
    Ok(RoutingParameters::internal(stage, vec![stage]))
}

struct Partial<M, C> {
    id: TaskId,
    queues: UpstreamQueues<(TaskId, M)>,
    combiner: C,
    flushed: bool,
}

pub(crate) struct PartitionStage<M, C, A: Accumulator<M>> {
    edge: EdgeId,
    mode: Mode,
    window: usize,
    destinations: Vec<TaskId>,
    routes: BTreeMap<TaskId, RoutingParameters>,
    partial: Option<Partial<M, C>>,
    finals: BTreeMap<TaskId, TargetState<M, A>>,
    fresh: Box<dyn Fn(TaskId) -> A + Send>,
    outbox: Outbox<M>,
    receiver: Box<dyn Receiver<A::Output>>,
}

impl<M, C, A> PartitionStage<M, C, A>
where
    M: Clone + Send + 'static,
    C: Combiner<M>,
    A: Accumulator<M>,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        edge: EdgeId,
        mode: Mode,
        window: usize,
        queue_capacity: usize,
        outbox_capacity: usize,
        router: &PartitionRouter,
        combiner: C,
        fresh: Box<dyn Fn(TaskId) -> A + Send>,
        mut receiver: Box<dyn Receiver<A::Output>>,
    ) -> Self {
        let partial = router.stage().map(|id| Partial {
            id,
            queues: UpstreamQueues::new(edge, id, router.local_sources(), queue_capacity),
            combiner,
            flushed: false,
        });
        let stages = router.expected_stages();
        let finals = router
            .local_destinations()
            .iter()
            .map(|&d| {
                let queues = UpstreamQueues::new(edge, d, &stages, queue_capacity);
                (d, TargetState::new(edge, d, mode, window, queues, fresh(d)))
            })
            .collect();
        let routes = router
            .destinations()
            .iter()
            .map(|&d| {
                let params = match router.worker_of_destination(d) {
                    Some(w) if !router.is_internal(d) => RoutingParameters::external(d, vec![w]),
                    _ => RoutingParameters::internal(d, vec![d]),
                };
                (d, params)
            })
            .collect();
        receiver.init(router.local_destinations());
        Self {
            edge,
            mode,
            window: window.max(1),
            destinations: router.destinations().to_vec(),
            routes,
            partial,
            finals,
            fresh,
            outbox: Outbox::new(outbox_capacity),
            receiver,
        }
    }

    fn forward(&mut self, source: TaskId, destination: TaskId, payload: Payload<M>, flags: Flags) {
        if let Some(params) = self.routes.get(&destination) {
            self.outbox
                .push(source, payload, flags | Flags::ORIGIN_PARTIAL, params.clone());
        }
    }

    fn flush_one(&mut self, destination: TaskId, flags: Flags) {
        let Some(partial) = self.partial.as_mut() else {
            return;
        };
        let id = partial.id;
        let items = partial.combiner.take(destination);
        if !items.is_empty() {
            self.forward(id, destination, Payload::Batch(items), flags);
        }
    }

    fn flush_all(&mut self, flags: Flags) {
        let pending = self
            .partial
            .as_ref()
            .map(|p| p.combiner.destinations())
            .unwrap_or_default();
        for d in pending {
            self.flush_one(d, flags);
        }
    }

    /// Control message from the partial stage to every destination.
    fn to_all(&mut self, payload: Payload<M>, flags: Flags) {
        let Some(id) = self.partial.as_ref().map(|p| p.id) else {
            return;
        };
        for d in self.destinations.clone() {
            self.forward(id, d, payload.clone(), flags);
        }
    }

    fn combine(&mut self, destination: TaskId, item: M) -> Result<()> {
        let Some(partial) = self.partial.as_mut() else {
            return Ok(());
        };
        let Err(item) = partial.combiner.offer(destination, item) else {
            return Ok(());
        };
        self.flush_all(Flags::NONE);
        let edge = self.edge;
        match self.partial.as_mut().map(|p| p.combiner.offer(destination, item)) {
            Some(Err(_)) => Err(CommError::InvalidConfig(format!(
                "edge {edge}: combiner refused a value after flushing"
            ))),
            _ => Ok(()),
        }
    }

    fn drain_partial(&mut self) -> Result<bool> {
        let mut moved = false;
        while self.outbox.has_room() {
            let Some(round) = self.partial.as_mut().and_then(|p| p.queues.take_available()) else {
                break;
            };
            moved = true;
            match round {
                Round::Values(items) => {
                    for (destination, item) in items {
                        self.combine(destination, item)?;
                    }
                    let (ready, buffered) = match self.partial.as_ref() {
                        Some(p) => (p.combiner.ready(), p.combiner.len()),
                        None => (Vec::new(), 0),
                    };
                    for d in ready {
                        self.flush_one(d, Flags::NONE);
                    }
                    if self.mode == Mode::Streaming && buffered >= self.window {
                        self.flush_all(Flags::NONE);
                    }
                }
                Round::Aligned(marker) => {
                    self.flush_all(Flags::NONE);
                    self.to_all(Payload::Marker(marker), Flags::BARRIER);
                }
            }
        }

        let finished = self
            .partial
            .as_ref()
            .is_some_and(|p| !p.flushed && p.queues.all_finished());
        if self.mode == Mode::Batch && finished {
            self.flush_all(Flags::LAST);
            self.to_all(Payload::Empty, Flags::END);
            if let Some(p) = self.partial.as_mut() {
                p.flushed = true;
                debug!(edge = self.edge, stage = p.id, "partial stage finished");
            }
            moved = true;
        }
        Ok(moved)
    }

    pub(crate) fn progress(&mut self, engine: &mut ChannelOperation<M>) -> Result<bool> {
        let mut moved = self.drain_partial()?;
        moved |= self.outbox.flush(engine)?;
        Ok(moved)
    }

    pub(crate) fn is_done(&self) -> bool {
        let partial_done = match (&self.partial, self.mode) {
            (None, _) => true,
            (Some(p), Mode::Batch) => p.flushed,
            (Some(p), Mode::Streaming) => p.queues.is_drained() && p.combiner.is_empty(),
        };
        partial_done && self.outbox.is_empty() && self.finals.values().all(TargetState::is_done)
    }

    /// Values each local destination received since the last reset.
    pub(crate) fn received(&self) -> BTreeMap<TaskId, usize> {
        self.finals
            .iter()
            .map(|(&d, state)| (d, state.received()))
            .collect()
    }

    /// Swap how each local destination accumulates and start its state
    /// over. Only valid before any value arrived.
    pub(crate) fn set_factory(&mut self, fresh: Box<dyn Fn(TaskId) -> A + Send>) {
        self.fresh = fresh;
        for (&d, state) in self.finals.iter_mut() {
            state.reset((self.fresh)(d));
        }
    }

    pub(crate) fn reset(&mut self) {
        if let Some(p) = self.partial.as_mut() {
            p.queues.reset();
            for d in p.combiner.destinations() {
                p.combiner.take(d);
            }
            p.flushed = false;
        }
        for (&d, state) in self.finals.iter_mut() {
            state.reset((self.fresh)(d));
        }
        self.outbox.clear();
    }
}

impl<M, C, A> Sink<M> for PartitionStage<M, C, A>
where
    M: Clone + Send + 'static,
    C: Combiner<M>,
    A: Accumulator<M>,
{
    fn on_message(&mut self, delivery: Delivery<M>) -> Result<Offer<M>> {
        if delivery.flags.contains(Flags::ORIGIN_PARTIAL) {
            return match self.finals.get_mut(&delivery.target) {
                Some(state) => state.offer(delivery, &mut *self.receiver),
                None => Err(CommError::UnexpectedDestination {
                    edge: self.edge,
                    destination: delivery.target,
                }),
            };
        }

        let Some(partial) = self.partial.as_mut() else {
            return Err(CommError::UnexpectedDestination {
                edge: self.edge,
                destination: delivery.target,
            });
        };
        let source = delivery.source;
        if !partial.queues.accepts(source, incoming(&delivery))? {
            return Ok(Offer::Refused(delivery));
        }
        let destination = delivery.path;
        match delivery.payload {
            Payload::Marker(marker) => partial.queues.barrier(source, marker)?,
            payload => partial
                .queues
                .extend(source, payload.into_values().into_iter().map(|v| (destination, v)))?,
        }
        if delivery.flags.contains(Flags::END) {
            partial.queues.finish(source)?;
        }
        self.drain_partial()?;
        Ok(Offer::Accepted)
    }
}

/// Router, engine and stage shared by every partition operator.
pub(crate) struct PartitionCore<M: Clone + Send + 'static, C, A: Accumulator<M>> {
    kind: OperationKind,
    plan: EdgePlan,
    router: PartitionRouter,
    engine: ChannelOperation<M>,
    stage: PartitionStage<M, C, A>,
}

impl<M, C, A> PartitionCore<M, C, A>
where
    M: Clone + Send + 'static,
    C: Combiner<M>,
    A: Accumulator<M>,
{
    pub(crate) fn new(
        ctx: &CommContext,
        kind: OperationKind,
        plan: EdgePlan,
        codec: Arc<dyn Codec<M>>,
        combiner: C,
        fresh: Box<dyn Fn(TaskId) -> A + Send>,
        receiver: Box<dyn Receiver<A::Output>>,
    ) -> Result<Self> {
        let router = PartitionRouter::new(&ctx.plan, &plan.sources, &plan.destinations)?;
        let engine = ChannelOperation::new(ctx, partition_spec(kind, plan.edge, &router), codec)?;
        let config = &ctx.config;
        let stage = PartitionStage::new(
            plan.edge,
            plan.mode,
            config.window_count,
            config.receive_queue_max,
            config.send_pending_max,
            &router,
            combiner,
            fresh,
            receiver,
        );
        debug!(
            edge = plan.edge,
            kind = %kind,
            mode = ?plan.mode,
            stage = ?router.stage(),
            destinations = router.local_destinations().len(),
            "partition ready"
        );
        Ok(Self {
            kind,
            plan,
            router,
            engine,
            stage,
        })
    }

    pub(crate) fn plan(&self) -> &EdgePlan {
        &self.plan
    }

    pub(crate) fn router(&self) -> &PartitionRouter {
        &self.router
    }

    pub(crate) fn send(&mut self, source: TaskId, destination: TaskId, value: impl FnOnce() -> M) -> Result<bool> {
        let params = partial_params(&self.router, self.plan.edge, source, destination)?;
        offer(
            &mut self.engine,
            source,
            || Payload::Single(value()),
            Flags::ORIGIN_SENDER,
            params,
        )
    }

    pub(crate) fn finish(&mut self, source: TaskId) -> Result<bool> {
        self.plan.require(Mode::Batch, "finish")?;
        let params = control_params(&self.router, self.plan.edge, source)?;
        offer(
            &mut self.engine,
            source,
            || Payload::Empty,
            Flags::END | Flags::ORIGIN_SENDER,
            params,
        )
    }

    pub(crate) fn barrier(&mut self, source: TaskId, marker: &[u8]) -> Result<bool> {
        self.plan.require(Mode::Streaming, "barrier")?;
        let params = control_params(&self.router, self.plan.edge, source)?;
        offer(
            &mut self.engine,
            source,
            || Payload::Marker(marker.to_vec()),
            Flags::BARRIER | Flags::ORIGIN_SENDER,
            params,
        )
    }

    /// Replace the accumulator factory before use.
    pub(crate) fn set_factory(&mut self, fresh: Box<dyn Fn(TaskId) -> A + Send>) {
        self.stage.set_factory(fresh);
    }

    pub(crate) fn received(&self) -> BTreeMap<TaskId, usize> {
        self.stage.received()
    }
}

impl<M, C, A> Operation for PartitionCore<M, C, A>
where
    M: Clone + Send + 'static,
    C: Combiner<M>,
    A: Accumulator<M>,
{
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
                operation: self.kind.name(),
            });
        }
        self.engine.reset()?;
        self.stage.reset();
        Ok(())
    }
}
