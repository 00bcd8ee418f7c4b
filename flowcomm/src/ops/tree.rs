//! Receive logic of tree operators.
//!
//! [`UpwardStage`] runs on every worker that takes part in a reduce or
//! gather tree: it merges what local members and child representatives
//! send and forwards the result to the parent, or hands it to the receiver
//! at the root. [`DownwardStage`] relays a broadcast from the parent to
//! child workers and delivers it to local destinations.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use super::Outbox;
use super::accumulate::{Accumulator, ListAccumulator};
use super::target::{TargetState, enqueue, incoming};
use crate::dataflow::{ChannelOperation, Delivery, EdgeSpec, Offer, Payload, RoutingParameters, Sink};
use crate::error::{CommError, Result};
use crate::receiver::{Receiver, Round, UpstreamQueues};
use crate::routing::TreeRouter;
use crate::types::{EdgeId, Flags, Mode, OperationKind, TaskId, WorkerId};

/// Engine wiring of an upward pass: remote input arrives at this worker's
/// representative.
pub(crate) fn upward_spec(kind: OperationKind, edge: EdgeId, router: &TreeRouter, local_sources: Vec<TaskId>) -> EdgeSpec {
    EdgeSpec {
        edge,
        kind,
        local_sources,
        receive_workers: router.receive_workers_up(),
        receive_targets: router
            .main_task()
            .map(|rep| HashMap::from([(router.root(), rep)]))
            .unwrap_or_default(),
    }
}

/// Engine wiring of a downward pass: relayed input arrives at the
/// representative and is fanned out from there.
pub(crate) fn downward_spec(kind: OperationKind, edge: EdgeId, router: &TreeRouter, local_sources: Vec<TaskId>) -> EdgeSpec {
    EdgeSpec {
        edge,
        kind,
        local_sources,
        receive_workers: router.receive_workers_down(),
        receive_targets: router
            .main_task()
            .map(|rep| HashMap::from([(router.root(), rep)]))
            .unwrap_or_default(),
    }
}

/// Role of a worker that hosts a representative.
struct Representative<M> {
    task: TaskId,
    parent: Option<WorkerId>,
    queues: UpstreamQueues<M>,
}

pub(crate) struct UpwardStage<M, A: Accumulator<M>> {
    edge: EdgeId,
    mode: Mode,
    window: usize,
    root: TaskId,
    role: Option<Representative<M>>,
    acc: A,
    fresh: Box<dyn Fn() -> A + Send>,
    flushed: bool,
    outbox: Outbox<M>,
    receiver: Box<dyn Receiver<A::Output>>,
}

impl<M, A> UpwardStage<M, A>
where
    M: Clone + Send + 'static,
    A: Accumulator<M>,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        edge: EdgeId,
        mode: Mode,
        window: usize,
        queue_capacity: usize,
        outbox_capacity: usize,
        router: &TreeRouter,
        fresh: Box<dyn Fn() -> A + Send>,
        mut receiver: Box<dyn Receiver<A::Output>>,
    ) -> Self {
        let role = router.main_task().map(|task| Representative {
            task,
            parent: router.parent().map(|(w, _)| w),
            queues: UpstreamQueues::new(edge, task, &router.upstream(), queue_capacity),
        });
        if router.is_last_receiver() {
            receiver.init(&[router.root()]);
        }
        Self {
            edge,
            mode,
            window: window.max(1),
            root: router.root(),
            role,
            acc: fresh(),
            fresh,
            flushed: false,
            outbox: Outbox::new(outbox_capacity),
            receiver,
        }
    }

    fn is_root(&self) -> bool {
        self.role
            .as_ref()
            .is_some_and(|r| r.task == self.root && r.parent.is_none())
    }

    /// This worker's representative and its parent worker, off the root.
    fn uplink(&self) -> Option<(TaskId, WorkerId)> {
        let role = self.role.as_ref()?;
        role.parent.map(|parent| (role.task, parent))
    }

    /// Result to the receiver at the root, partial result to the parent
    /// elsewhere.
    fn emit(&mut self) -> Result<()> {
        if self.is_root() {
            if let Some(out) = self.acc.take_output()? {
                self.receiver.receive(self.root, out);
            }
        } else if let Some(payload) = self.acc.take_forward() {
            self.to_parent(payload, Flags::NONE);
        }
        Ok(())
    }

    fn to_parent(&mut self, payload: Payload<M>, flags: Flags) {
        if let Some((task, parent)) = self.uplink() {
            self.outbox.push(
                task,
                payload,
                flags | Flags::ORIGIN_PARTIAL,
                RoutingParameters::external(self.root, vec![parent]),
            );
        }
    }

    fn drain(&mut self) -> Result<bool> {
        let rounds = A::ROUNDS && self.mode == Mode::Streaming;
        let mut moved = false;
        while self.outbox.has_room() {
            let Some(role) = self.role.as_mut() else {
                return Ok(false);
            };
            let round = if rounds {
                role.queues.take_round()
            } else {
                role.queues.take_available()
            };
            let Some(round) = round else { break };
            moved = true;
            match round {
                Round::Values(values) => {
                    for v in values {
                        self.acc.add(v)?;
                    }
                    if self.mode == Mode::Streaming
                        && (rounds || self.acc.len() >= self.window || self.acc.is_full())
                    {
                        self.emit()?;
                    }
                }
                Round::Aligned(marker) => {
                    self.emit()?;
                    if self.is_root() {
                        self.receiver.sync(self.root, &marker);
                    } else {
                        self.to_parent(Payload::Marker(marker), Flags::BARRIER);
                    }
                }
            }
        }

        let finished = self.role.as_ref().is_some_and(|r| r.queues.all_finished());
        if self.mode == Mode::Batch && !self.flushed && finished {
            self.emit()?;
            if self.is_root() {
                self.receiver.complete(self.root);
            } else {
                self.to_parent(Payload::Empty, Flags::END);
            }
            self.flushed = true;
            debug!(edge = self.edge, root = self.root, "upward pass finished on this worker");
            moved = true;
        }
        Ok(moved)
    }

    pub(crate) fn progress(&mut self, engine: &mut ChannelOperation<M>) -> Result<bool> {
        let mut moved = self.drain()?;
        moved |= self.outbox.flush(engine)?;
        Ok(moved)
    }

    pub(crate) fn is_done(&self) -> bool {
        if !self.outbox.is_empty() {
            return false;
        }
        match (&self.role, self.mode) {
            (None, _) => true,
            (Some(_), Mode::Batch) => self.flushed,
            (Some(r), Mode::Streaming) => r.queues.is_drained() && self.acc.is_empty(),
        }
    }

    pub(crate) fn reset(&mut self) {
        if let Some(role) = self.role.as_mut() {
            role.queues.reset();
        }
        self.acc = (self.fresh)();
        self.flushed = false;
        self.outbox.clear();
    }
}

impl<M, A> Sink<M> for UpwardStage<M, A>
where
    M: Clone + Send + 'static,
    A: Accumulator<M>,
{
    fn on_message(&mut self, delivery: Delivery<M>) -> Result<Offer<M>> {
        let Some(role) = self.role.as_mut() else {
            return Err(CommError::UnexpectedDestination {
                edge: self.edge,
                destination: delivery.path,
            });
        };
        if !role.queues.accepts(delivery.source, incoming(&delivery))? {
            return Ok(Offer::Refused(delivery));
        }
        enqueue(&mut role.queues, delivery)?;
        self.drain()?;
        Ok(Offer::Accepted)
    }
}

pub(crate) struct DownwardStage<T> {
    edge: EdgeId,
    local: Vec<TaskId>,
    children: Vec<WorkerId>,
    finals: BTreeMap<TaskId, TargetState<T, ListAccumulator<T>>>,
    outbox: Outbox<T>,
    receiver: Box<dyn Receiver<Vec<T>>>,
}

impl<T: Clone + Send + 'static> DownwardStage<T> {
    pub(crate) fn new(
        edge: EdgeId,
        mode: Mode,
        window: usize,
        queue_capacity: usize,
        outbox_capacity: usize,
        router: &TreeRouter,
        mut receiver: Box<dyn Receiver<Vec<T>>>,
    ) -> Self {
        let root = router.root();
        let local = router.local_members().to_vec();
        let finals = local
            .iter()
            .map(|&d| {
                let queues = UpstreamQueues::new(edge, d, &[root], queue_capacity);
                let state = TargetState::new(edge, d, mode, window, queues, ListAccumulator::default());
                (d, state)
            })
            .collect();
        receiver.init(&local);
        Self {
            edge,
            local,
            children: router.children().into_iter().map(|(w, _)| w).collect(),
            finals,
            outbox: Outbox::new(outbox_capacity),
            receiver,
        }
    }

    /// Where a payload from the root goes on this worker.
    pub(crate) fn fan_out(&self, path: i32) -> RoutingParameters {
        RoutingParameters {
            path,
            internal: self.local.clone(),
            external: self.children.clone(),
        }
    }

    pub(crate) fn progress(&mut self, engine: &mut ChannelOperation<T>) -> Result<bool> {
        self.outbox.flush(engine)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.outbox.is_empty() && self.finals.values().all(TargetState::is_done)
    }

    pub(crate) fn reset(&mut self) {
        for state in self.finals.values_mut() {
            state.reset(ListAccumulator::default());
        }
        self.outbox.clear();
    }
}

impl<T: Clone + Send + 'static> Sink<T> for DownwardStage<T> {
    fn on_message(&mut self, delivery: Delivery<T>) -> Result<Offer<T>> {
        if delivery.remote {
            if !self.outbox.has_room() {
                return Ok(Offer::Refused(delivery));
            }
            let params = self.fan_out(delivery.path);
            self.outbox.push(
                delivery.source,
                delivery.payload,
                delivery.flags | Flags::ORIGIN_PARTIAL,
                params,
            );
            return Ok(Offer::Accepted);
        }
        match self.finals.get_mut(&delivery.target) {
            Some(state) => state.offer(delivery, &mut *self.receiver),
            None => Err(CommError::UnexpectedDestination {
                edge: self.edge,
                destination: delivery.target,
            }),
        }
    }
}

/// Route of a user send on an upward pass: to the local representative.
pub(crate) fn upward_params(router: &TreeRouter, edge: EdgeId, source: TaskId) -> Result<RoutingParameters> {
    let target = router
        .internal_target(source)
        .ok_or(CommError::UnknownSource {
            edge,
            source_task: source,
        })?;
    Ok(RoutingParameters::internal(router.root(), vec![target]))
}
