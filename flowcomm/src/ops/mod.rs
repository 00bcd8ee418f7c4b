//! Collective operators.
//!
//! Each operator composes a router, the edge engine and a stage that runs
//! the partial and final receive logic for this worker:
//!
//! - Tree operators ([`Reduce`], [`Gather`], [`Broadcast`] and the
//!   two-edge [`AllReduce`] and [`AllGather`]) move values along a
//!   [`TreeRouter`](crate::routing::TreeRouter) tree. Intermediate
//!   representatives combine or forward; the root's receiver sees results.
//! - Partition operators ([`Partition`], [`KeyedPartition`],
//!   [`KeyedGather`], [`KeyedReduce`]) route through one partial stage per
//!   worker to every destination.
//!
//! Every operator comes in [`Mode::Batch`] (ended per source with
//! `finish`) and [`Mode::Streaming`] (windowed, synchronized with
//! `barrier`).

pub mod accumulate;
mod allgather;
mod allreduce;
mod broadcast;
mod gather;
mod keyed_gather;
mod keyed_partition;
mod keyed_reduce;
mod partition;
mod partition_stage;
mod reduce;
mod target;
mod tree;
pub mod values;

pub use allgather::AllGather;
pub use allreduce::AllReduce;
pub use broadcast::Broadcast;
pub use gather::Gather;
pub use keyed_gather::KeyedGather;
pub use keyed_partition::KeyedPartition;
pub use keyed_reduce::KeyedReduce;
pub use partition::Partition;
pub use reduce::Reduce;
pub use values::{KeyedGroups, PartitionValues};

use std::collections::VecDeque;

use crate::dataflow::{ChannelOperation, Payload, RoutingParameters};
use crate::error::{CommError, Result};
use crate::types::{EdgeId, Flags, Mode, TaskId};

/// Edge id, participating tasks and flavor of one operator instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgePlan {
    pub edge: EdgeId,
    pub sources: Vec<TaskId>,
    pub destinations: Vec<TaskId>,
    pub mode: Mode,
}

impl EdgePlan {
    pub fn batch(edge: EdgeId, sources: Vec<TaskId>, destinations: Vec<TaskId>) -> Self {
        Self {
            edge,
            sources,
            destinations,
            mode: Mode::Batch,
        }
    }

    pub fn streaming(edge: EdgeId, sources: Vec<TaskId>, destinations: Vec<TaskId>) -> Self {
        Self {
            edge,
            sources,
            destinations,
            mode: Mode::Streaming,
        }
    }

    /// The single destination of a rooted operator.
    pub(crate) fn single_destination(&self) -> Result<TaskId> {
        match self.destinations.as_slice() {
            [root] => Ok(*root),
            other => Err(CommError::InvalidPlan(format!(
                "edge {} needs exactly one destination, got {}",
                self.edge,
                other.len()
            ))),
        }
    }

    pub(crate) fn require(&self, mode: Mode, call: &str) -> Result<()> {
        if self.mode == mode {
            Ok(())
        } else {
            Err(CommError::InvalidConfig(format!(
                "{call} is not available on a {:?} operator",
                self.mode
            )))
        }
    }
}

/// Drive-loop surface shared by every operator.
pub trait Operation {
    /// One bounded unit of work. Returns whether anything moved.
    fn progress(&mut self) -> Result<bool>;

    fn has_pending(&self) -> bool;

    /// Nothing left to send, receive or deliver.
    fn is_complete(&self) -> bool;

    /// Deregister this worker's network receives.
    fn close(&mut self) -> Result<()>;

    /// Prepare for another batch. Fails while work is in flight.
    fn reset(&mut self) -> Result<()>;
}

/// A send produced by a stage, waiting for engine capacity.
pub(crate) struct Outgoing<T> {
    pub source: TaskId,
    pub payload: Payload<T>,
    pub flags: Flags,
    pub params: RoutingParameters,
}

/// Sends a stage produced while the engine was busy delivering to it.
pub(crate) struct Outbox<T> {
    queue: VecDeque<Outgoing<T>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> Outbox<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(
        &mut self,
        source: TaskId,
        payload: Payload<T>,
        flags: Flags,
        params: RoutingParameters,
    ) {
        self.queue.push_back(Outgoing {
            source,
            payload,
            flags,
            params,
        });
    }

    pub(crate) fn has_room(&self) -> bool {
        self.queue.len() < self.capacity
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
    }

    /// Hand queued sends to `engine` in order until it pushes back.
    pub(crate) fn flush(&mut self, engine: &mut ChannelOperation<T>) -> Result<bool> {
        let mut sent = false;
        while let Some(next) = self.queue.front() {
            if !engine.can_send(next.source, next.flags)? {
                break;
            }
            if let Some(o) = self.queue.pop_front() {
                engine.send(o.source, o.payload, o.flags, o.params)?;
                sent = true;
            }
        }
        Ok(sent)
    }
}

/// Send a user value once the engine has room, without consuming it
/// otherwise.
pub(crate) fn offer<T: Clone + Send + 'static>(
    engine: &mut ChannelOperation<T>,
    source: TaskId,
    payload: impl FnOnce() -> Payload<T>,
    flags: Flags,
    params: RoutingParameters,
) -> Result<bool> {
    if !engine.can_send(source, flags)? {
        return Ok(false);
    }
    engine.send(source, payload(), flags, params)
}
