//! Final-receiver state of one local target.

use tracing::debug;

use super::accumulate::Accumulator;
use crate::dataflow::{Delivery, Offer, Payload};
use crate::error::Result;
use crate::receiver::{Receiver, Round, UpstreamQueues};
use crate::types::{EdgeId, Flags, Mode, TaskId};

/// Queue items a delivery adds: its values, a barrier and an end.
pub(crate) fn incoming<M>(delivery: &Delivery<M>) -> usize {
    let marker = matches!(delivery.payload, Payload::Marker(_));
    delivery.payload.len() + usize::from(marker) + usize::from(delivery.flags.contains(Flags::END))
}

/// Queue a delivery's contents under its source. The caller checked
/// capacity.
pub(crate) fn enqueue<M>(queues: &mut UpstreamQueues<M>, delivery: Delivery<M>) -> Result<()> {
    let source = delivery.source;
    match delivery.payload {
        Payload::Marker(marker) => queues.barrier(source, marker)?,
        payload => queues.extend(source, payload.into_values())?,
    }
    if delivery.flags.contains(Flags::END) {
        queues.finish(source)?;
    }
    Ok(())
}

pub(crate) struct TargetState<M, A> {
    edge: EdgeId,
    target: TaskId,
    mode: Mode,
    window: usize,
    queues: UpstreamQueues<M>,
    acc: A,
    done: bool,
    received: usize,
}

impl<M, A: Accumulator<M>> TargetState<M, A> {
    pub(crate) fn new(
        edge: EdgeId,
        target: TaskId,
        mode: Mode,
        window: usize,
        queues: UpstreamQueues<M>,
        acc: A,
    ) -> Self {
        Self {
            edge,
            target,
            mode,
            window: window.max(1),
            queues,
            acc,
            done: false,
            received: 0,
        }
    }

    pub(crate) fn offer(
        &mut self,
        delivery: Delivery<M>,
        receiver: &mut dyn Receiver<A::Output>,
    ) -> Result<Offer<M>> {
        if !self.queues.accepts(delivery.source, incoming(&delivery))? {
            return Ok(Offer::Refused(delivery));
        }
        enqueue(&mut self.queues, delivery)?;
        self.drain(receiver)?;
        Ok(Offer::Accepted)
    }

    pub(crate) fn drain(&mut self, receiver: &mut dyn Receiver<A::Output>) -> Result<bool> {
        let mut moved = false;
        while let Some(round) = self.queues.take_available() {
            moved = true;
            match round {
                Round::Values(values) => {
                    self.received += values.len();
                    for v in values {
                        self.acc.add(v)?;
                    }
                    if self.mode == Mode::Streaming
                        && (self.acc.len() >= self.window || self.acc.is_full())
                    {
                        self.deliver(receiver)?;
                    }
                }
                Round::Aligned(marker) => {
                    self.deliver(receiver)?;
                    receiver.sync(self.target, &marker);
                }
            }
        }
        if self.mode == Mode::Batch && !self.done && self.queues.all_finished() {
            self.deliver(receiver)?;
            receiver.complete(self.target);
            self.done = true;
            debug!(
                edge = self.edge,
                target = self.target,
                received = self.received,
                "target finished"
            );
            moved = true;
        }
        Ok(moved)
    }

    fn deliver(&mut self, receiver: &mut dyn Receiver<A::Output>) -> Result<()> {
        if let Some(out) = self.acc.take_output()? {
            receiver.receive(self.target, out);
        }
        Ok(())
    }

    pub(crate) fn is_done(&self) -> bool {
        match self.mode {
            Mode::Batch => self.done,
            Mode::Streaming => self.queues.is_drained(),
        }
    }

    /// Values received since the last reset.
    pub(crate) fn received(&self) -> usize {
        self.received
    }

    pub(crate) fn reset(&mut self, acc: A) {
        self.queues.reset();
        self.acc = acc;
        self.done = false;
        self.received = 0;
    }
}
